//! Device session: transfer pools, the acquisition thread and device commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use metrics::counter;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::assembler::{ColorAssembler, DepthAssembler};
use crate::capture::control::{Command, CommandChannel, DataPage};
use crate::capture::frame::{Channel, Frame};
use crate::capture::stream::UsbStream;
use crate::capture::transport::{
    Completion, ControlChannel, StreamSpec, TransferEngine, TransferId, TransferKind,
};
use crate::decoder::params::{CameraParams, ColorCameraParams, DepthCameraParams, P0Tables};
use crate::{CaptureConfig, Error, Result, TransportError};

pub const COLOR_ENDPOINT: u8 = 0x83;
pub const DEPTH_ENDPOINT: u8 = 0x84;

/// Streams to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    pub color: bool,
    pub depth: bool,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            color: true,
            depth: true,
        }
    }
}

/// Receives each committed frame on the acquisition thread. The slice is
/// only valid for the duration of the call.
pub struct FrameCallback(Box<dyn Fn(&[u8]) + Send + Sync>);

impl FrameCallback {
    pub fn new(f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

struct Shared {
    color: ArcSwapOption<FrameCallback>,
    depth: ArcSwapOption<FrameCallback>,
    shutdown: AtomicBool,
    device_lost: AtomicBool,
}

impl Shared {
    fn callback(&self, channel: Channel) -> &ArcSwapOption<FrameCallback> {
        match channel {
            Channel::Color => &self.color,
            Channel::Depth => &self.depth,
        }
    }
}

enum Assembler {
    Color(ColorAssembler),
    Depth(DepthAssembler),
}

struct Pipe {
    stream: UsbStream,
    assembler: Assembler,
}

impl Pipe {
    fn channel(&self) -> Channel {
        self.stream.spec().channel
    }

    fn feed(&mut self, completion: &Completion<'_>, callback: Option<&FrameCallback>) {
        let packet_size = self.stream.spec().packet_size;
        let on_frame = |frame: &[u8]| {
            if let Some(callback) = callback {
                (callback.0)(frame);
            }
        };
        match &mut self.assembler {
            Assembler::Color(a) => a.on_transfer(completion, packet_size, on_frame),
            Assembler::Depth(a) => a.on_transfer(completion, packet_size, on_frame),
        };
    }
}

/// An open camera. Dropping it stops the acquisition thread.
pub struct Session<C: ControlChannel> {
    commands: CommandChannel<C>,
    channels: Channels,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl<C: ControlChannel> Session<C> {
    /// Open the transfer pools for `channels`, submit them and start the
    /// acquisition thread. Streaming itself begins with [`Session::start`].
    #[instrument(skip_all)]
    pub fn open<E: TransferEngine>(
        mut engine: E,
        control: C,
        config: &CaptureConfig,
        channels: Channels,
    ) -> Result<Self> {
        let mut pipes = Vec::new();

        if channels.color {
            let spec = StreamSpec {
                channel: Channel::Color,
                kind: TransferKind::Bulk,
                endpoint: COLOR_ENDPOINT,
                num_transfers: config.color_transfers,
                packets_per_transfer: 1,
                packet_size: config.color_packet_size,
            };
            pipes.push(Pipe {
                stream: UsbStream::open(&mut engine, spec)?,
                assembler: Assembler::Color(ColorAssembler::new(config.ring_buffer_size)),
            });
        }

        if channels.depth {
            let packet_size = engine.max_iso_packet_size(DEPTH_ENDPOINT)?;
            if packet_size == 0 {
                return Err(TransportError::NoBandwidth(DEPTH_ENDPOINT).into());
            }
            info!("iso packet size is {packet_size} bytes");
            let spec = StreamSpec {
                channel: Channel::Depth,
                kind: TransferKind::Isochronous,
                endpoint: DEPTH_ENDPOINT,
                num_transfers: config.depth_transfers,
                packets_per_transfer: config.depth_packets_per_transfer,
                packet_size,
            };
            pipes.push(Pipe {
                stream: UsbStream::open(&mut engine, spec)?,
                assembler: Assembler::Depth(DepthAssembler::new(config.ring_buffer_size)),
            });
        }

        for pipe in &mut pipes {
            pipe.stream.start(&mut engine);
        }

        let shared = Arc::new(Shared {
            color: ArcSwapOption::empty(),
            depth: ArcSwapOption::empty(),
            shutdown: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
        });

        let worker = Acquisition {
            engine,
            pipes,
            shared: Arc::clone(&shared),
            event_timeout: config.event_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            resubmit: Vec::new(),
        };
        let pin_core = config.pin_core;
        let thread = std::thread::Builder::new()
            .name("k4w2-usb".into())
            .spawn(move || {
                if let Some(id) = pin_core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "failed to pin acquisition thread");
                    }
                }
                worker.run();
            })?;

        Ok(Self {
            commands: CommandChannel::new(control, config.control_timeout()),
            channels,
            shared,
            thread: Some(thread),
        })
    }

    pub fn set_color_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.set_callback(Channel::Color, Some(FrameCallback::new(callback)));
    }

    pub fn set_depth_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.set_callback(Channel::Depth, Some(FrameCallback::new(callback)));
    }

    /// Replace (or with `None`, remove) the callback of `channel`.
    pub fn set_callback(&self, channel: Channel, callback: Option<FrameCallback>) {
        self.shared
            .callback(channel)
            .store(callback.map(Arc::new));
    }

    /// Ask the device to stream on every enabled channel.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.channels.color {
            self.commands.send(Command::SetStreaming(true))?;
        }
        if self.channels.depth {
            self.commands.send(Command::StartDepth)?;
        }
        info!("streaming started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.channels.color {
            self.commands.send(Command::SetStreaming(false))?;
        }
        if self.channels.depth {
            self.commands.send(Command::StopDepth)?;
        }
        info!("streaming stopped");
        Ok(())
    }

    pub fn read_color_params(&mut self) -> Result<ColorCameraParams> {
        self.ensure_open()?;
        ColorCameraParams::from_bytes(&self.commands.read_data_page(DataPage::ColorParams)?)
    }

    pub fn read_depth_params(&mut self) -> Result<DepthCameraParams> {
        self.ensure_open()?;
        DepthCameraParams::from_bytes(&self.commands.read_data_page(DataPage::DepthParams)?)
    }

    pub fn read_p0_tables(&mut self) -> Result<P0Tables> {
        self.ensure_open()?;
        P0Tables::from_bytes(&self.commands.read_data_page(DataPage::P0Tables)?)
    }

    /// All three calibration pages, ready for [`CameraParams::save`].
    pub fn read_camera_params(&mut self) -> Result<CameraParams> {
        Ok(CameraParams {
            color: self.read_color_params()?,
            depth: self.read_depth_params()?,
            p0: self.read_p0_tables()?,
        })
    }

    /// The transport reported the device gone; no more frames will arrive.
    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    /// Stop the acquisition thread, cancelling in-flight transfers.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Commands need a live acquisition thread.
    fn ensure_open(&self) -> Result<()> {
        if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        debug!("stopping acquisition thread");
        self.shared.shutdown.store(true, Ordering::Release);
        thread.join().map_err(|_| Error::ThreadPanicked)
    }
}

impl<C: ControlChannel> Drop for Session<C> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("session shutdown failed: {e}");
        }
    }
}

struct Acquisition<E> {
    engine: E,
    pipes: Vec<Pipe>,
    shared: Arc<Shared>,
    event_timeout: Duration,
    shutdown_timeout: Duration,
    resubmit: Vec<TransferId>,
}

impl<E: TransferEngine> Acquisition<E> {
    fn run(mut self) {
        info!("acquisition thread started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            self.pump();
            if self.shared.device_lost.load(Ordering::Acquire) {
                warn!("device lost, acquisition stops");
                break;
            }
        }

        for pipe in &mut self.pipes {
            pipe.stream.cancel_all(&mut self.engine);
        }
        let deadline = Instant::now() + self.shutdown_timeout;
        while !self.pipes.iter().all(|p| p.stream.is_idle()) {
            if Instant::now() >= deadline {
                warn!("timed out waiting for transfers to finish");
                break;
            }
            self.pump();
        }
        info!("acquisition thread stopped");
    }

    /// Handle one batch of completions, then resubmit what asked for it.
    fn pump(&mut self) {
        let pipes = &mut self.pipes;
        let shared = &self.shared;
        let resubmit = &mut self.resubmit;

        let result = self.engine.handle_events(self.event_timeout, &mut |completion| {
            let Some(pipe) = pipes.iter_mut().find(|p| p.channel() == completion.id.channel)
            else {
                trace!(id = ?completion.id, "completion for unknown channel");
                return;
            };
            let disposition = pipe.stream.on_complete(completion.id.index, completion.status);
            if disposition.deliver {
                let callback = shared.callback(pipe.channel()).load();
                pipe.feed(&completion, callback.as_deref());
            }
            if disposition.resubmit {
                resubmit.push(completion.id);
            }
            if pipe.stream.is_device_lost() {
                shared.device_lost.store(true, Ordering::Release);
            }
        });

        if let Err(e) = result {
            warn!("event handling failed: {e}");
            if e == TransportError::NoDevice {
                self.shared.device_lost.store(true, Ordering::Release);
            }
        }

        for id in self.resubmit.drain(..) {
            if let Some(pipe) = self.pipes.iter_mut().find(|p| p.channel() == id.channel) {
                pipe.stream.resubmit(&mut self.engine, id.index);
                if pipe.stream.is_device_lost() {
                    self.shared.device_lost.store(true, Ordering::Release);
                }
            }
        }
    }
}

/// Callback that copies frames into [`Frame`]s for a bounded channel.
/// Frames are dropped when the receiver falls behind.
pub fn frame_channel(
    channel: Channel,
    capacity: usize,
) -> (FrameCallback, flume::Receiver<Frame>) {
    let (tx, rx) = flume::bounded(capacity);
    let callback = FrameCallback::new(move |raw: &[u8]| {
        match tx.try_send(Frame::copy_from(channel, raw)) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                trace!(%channel, "consumer behind, frame discarded");
                counter!("k4w2_frames_discarded", "channel" => channel.as_str()).increment(1);
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    });
    (callback, rx)
}
