//! Session and stream reassembly driven by a scripted transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use color_eyre::eyre::eyre;
use k4w2::capture::control::{RESPONSE_MAGIC, REQUEST_MAGIC};
use k4w2::capture::frame::{
    ColorHeader, DepthFooter, PixelFormat, DEPTH_FRAME_SIZE, DEPTH_IMAGE_SIZE,
    DEPTH_SUBFRAME_SIZE,
};
use k4w2::capture::transport::{
    Completion, IsoPacket, StreamSpec, TransferId, TransferStatus, TransportResult,
};
use k4w2::capture::{
    frame_channel, Channel, Channels, ControlChannel, DepthAssembler, Session, SyncState,
    TransferEngine,
};
use k4w2::decoder::{CameraParams, ColorCameraParams, DepthCameraParams, P0Tables};
use k4w2::{CaptureConfig, Error, TransportError};

const PACKET: usize = 0x8400;

fn subframe_packets(footer: DepthFooter, fill: u8) -> Vec<Vec<u8>> {
    let mut bytes = vec![fill; DEPTH_IMAGE_SIZE];
    bytes.extend_from_slice(footer.as_bytes());
    bytes.chunks(PACKET).map(<[u8]>::to_vec).collect()
}

/// Ten subframes, each filled with its own index.
fn frame_packets(sequence: u32) -> Vec<Vec<u8>> {
    (0..10)
        .flat_map(|sub| subframe_packets(DepthFooter::new(sequence, sub, sequence * 100), sub as u8))
        .collect()
}

/// Frame whose subframe 3 carries a footer with a bad magic.
fn corrupted_frame_packets(sequence: u32) -> Vec<Vec<u8>> {
    (0..10)
        .flat_map(|sub| {
            let mut footer = DepthFooter::new(sequence, sub, 0);
            if sub == 3 {
                footer.magic0 = 0xdead_beef;
            }
            subframe_packets(footer, sub as u8)
        })
        .collect()
}

#[derive(Default)]
struct EngineState {
    specs: Vec<StreamSpec>,
    queued: VecDeque<TransferId>,
    cancelled: VecDeque<TransferId>,
    packets: VecDeque<Vec<u8>>,
    /// Bulk chunks handed to color transfers, one per completion.
    chunks: VecDeque<Vec<u8>>,
    /// Report the device gone once the packet script runs dry.
    lose_device: bool,
}

/// Completes color transfers from a chunk script and depth transfers from a
/// packet script. Transfers with nothing scripted stay in flight.
#[derive(Clone, Default)]
struct ScriptedEngine(Arc<Mutex<EngineState>>);

impl ScriptedEngine {
    fn with_packets(packets: Vec<Vec<u8>>) -> Self {
        let engine = Self::default();
        engine.feed(packets);
        engine
    }

    fn feed(&self, packets: Vec<Vec<u8>>) {
        self.0.lock().unwrap().packets.extend(packets);
    }

    fn feed_chunks(&self, chunks: Vec<Vec<u8>>) {
        self.0.lock().unwrap().chunks.extend(chunks);
    }
}

impl TransferEngine for ScriptedEngine {
    fn max_iso_packet_size(&mut self, _endpoint: u8) -> TransportResult<usize> {
        Ok(PACKET)
    }

    fn open_stream(&mut self, spec: &StreamSpec) -> TransportResult<()> {
        self.0.lock().unwrap().specs.push(*spec);
        Ok(())
    }

    fn submit(&mut self, id: TransferId) -> TransportResult<()> {
        self.0.lock().unwrap().queued.push_back(id);
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) -> TransportResult<()> {
        let mut state = self.0.lock().unwrap();
        state.queued.retain(|q| *q != id);
        state.cancelled.push_back(id);
        Ok(())
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion<'_>),
    ) -> TransportResult<()> {
        let mut state = self.0.lock().unwrap();

        if let Some(id) = state.cancelled.pop_front() {
            drop(state);
            on_complete(Completion {
                id,
                status: TransferStatus::Cancelled,
                data: &[],
                packets: &[],
            });
            return Ok(());
        }

        let color = state.queued.iter().position(|id| id.channel == Channel::Color);
        if let Some(position) = color.filter(|_| !state.chunks.is_empty()) {
            let id = state.queued.remove(position).unwrap();
            let chunk = state.chunks.pop_front().unwrap();
            drop(state);
            on_complete(Completion {
                id,
                status: TransferStatus::Completed,
                data: &chunk,
                packets: &[],
            });
            return Ok(());
        }

        let depth = state.queued.iter().position(|id| id.channel == Channel::Depth);
        let Some(position) = depth else {
            drop(state);
            std::thread::sleep(timeout);
            return Ok(());
        };

        if state.packets.is_empty() {
            if state.lose_device {
                let id = state.queued.remove(position).unwrap();
                drop(state);
                on_complete(Completion {
                    id,
                    status: TransferStatus::NoDevice,
                    data: &[],
                    packets: &[],
                });
                return Err(TransportError::NoDevice);
            }
            drop(state);
            std::thread::sleep(timeout);
            return Ok(());
        }

        let id = state.queued.remove(position).unwrap();
        let per_transfer = state
            .specs
            .iter()
            .find(|s| s.channel == Channel::Depth)
            .map(|s| s.packets_per_transfer)
            .unwrap();
        let mut data = vec![0u8; per_transfer * PACKET];
        let mut packets = Vec::new();
        for i in 0..per_transfer {
            let Some(packet) = state.packets.pop_front() else {
                break;
            };
            data[i * PACKET..i * PACKET + packet.len()].copy_from_slice(&packet);
            packets.push(IsoPacket {
                length: PACKET,
                actual_length: packet.len(),
            });
        }
        drop(state);

        on_complete(Completion {
            id,
            status: TransferStatus::Completed,
            data: &data,
            packets: &packets,
        });
        Ok(())
    }
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Answers every command, serving `pages` by page number for data reads.
#[derive(Clone, Default)]
struct ScriptedControl {
    sent: Arc<Mutex<Vec<Vec<u32>>>>,
    replies: VecDeque<Vec<u8>>,
    pages: HashMap<u32, Vec<u8>>,
}

impl ControlChannel for ScriptedControl {
    fn bulk_out(&mut self, _endpoint: u8, data: &[u8], _: Duration) -> TransportResult<usize> {
        let request = words(data);
        assert_eq!(request[0], REQUEST_MAGIC);
        if request[2] > 0 {
            let page = self.pages.get(&request[5]).cloned().unwrap_or_default();
            self.replies.push_back(page);
        }
        let mut completion = vec![0u32; 32];
        completion[0] = RESPONSE_MAGIC;
        completion[1] = request[1];
        self.replies
            .push_back(completion.iter().flat_map(|w| w.to_le_bytes()).collect());
        self.sent.lock().unwrap().push(request);
        Ok(data.len())
    }

    fn bulk_in(&mut self, _endpoint: u8, buf: &mut [u8], _: Duration) -> TransportResult<usize> {
        let reply = self.replies.pop_front().ok_or(TransportError::Timeout)?;
        buf[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}

fn color_only() -> Channels {
    Channels {
        color: true,
        depth: false,
    }
}

fn depth_only() -> Channels {
    Channels {
        color: false,
        depth: true,
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn resynchronizes_after_corrupted_frames() {
    let mut assembler = DepthAssembler::new(3);
    let mut sequences = Vec::new();
    let mut on_frame = |frame: &[u8]| {
        assert_eq!(frame.len(), DEPTH_SUBFRAME_SIZE * 10);
        sequences.push(DepthFooter::of_frame(frame).unwrap().sequence);
    };

    // Frame 0 arrives without its first subframes.
    for packet in frame_packets(0).into_iter().skip(30) {
        assembler.push_packet(&packet, PACKET, &mut on_frame);
    }
    for sequence in [1, 2, 3] {
        for packet in corrupted_frame_packets(sequence) {
            assembler.push_packet(&packet, PACKET, &mut on_frame);
        }
    }
    for sequence in 4..=6 {
        for packet in frame_packets(sequence) {
            assembler.push_packet(&packet, PACKET, &mut on_frame);
        }
    }

    assert_eq!(sequences, vec![4, 5, 6]);
    assert_eq!(assembler.state(), SyncState::Synced);
}

#[test]
fn session_delivers_depth_frames() -> color_eyre::Result<()> {
    let engine = ScriptedEngine::default();
    let control = ScriptedControl::default();

    let session = Session::open(
        engine.clone(),
        control,
        &CaptureConfig::default(),
        depth_only(),
    )?;
    let (callback, frames) = frame_channel(Channel::Depth, 8);
    session.set_callback(Channel::Depth, Some(callback));
    engine.feed((1..=4).flat_map(frame_packets).collect());

    let mut sequences = Vec::new();
    for _ in 0..3 {
        let frame = frames
            .recv_timeout(Duration::from_secs(5))
            .map_err(|e| eyre!("no frame: {e}"))?;
        assert_eq!(frame.data.len(), DEPTH_FRAME_SIZE);
        assert_eq!(frame.data[DEPTH_SUBFRAME_SIZE * 7], 7);
        sequences.push(frame.meta.sequence);
    }
    // Frame 1 only establishes synchronization.
    assert_eq!(sequences, vec![2, 3, 4]);

    let specs = engine.0.lock().unwrap().specs.clone();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].endpoint, 0x84);
    assert_eq!(specs[0].packet_size, PACKET);

    session.close()?;
    assert!(engine.0.lock().unwrap().queued.is_empty());
    Ok(())
}

#[test]
fn start_and_stop_send_streaming_commands() -> color_eyre::Result<()> {
    let control = ScriptedControl::default();
    let sent = Arc::clone(&control.sent);
    let mut session = Session::open(
        ScriptedEngine::default(),
        control,
        &CaptureConfig::default(),
        Channels::default(),
    )?;

    session.start()?;
    session.stop()?;
    session.close()?;

    let commands: Vec<_> = sent
        .lock()
        .unwrap()
        .iter()
        .map(|w| (w[3], w.get(5).copied()))
        .collect();
    assert_eq!(
        commands,
        vec![(0x2B, Some(1)), (0x09, None), (0x2B, Some(0)), (0x0A, None)]
    );
    Ok(())
}

#[test]
fn reads_depth_parameters_page() -> color_eyre::Result<()> {
    let control = ScriptedControl {
        pages: HashMap::from([(0x03, (0..23).flat_map(|i| (i as f32).to_le_bytes()).collect())]),
        ..Default::default()
    };
    let mut session = Session::open(
        ScriptedEngine::default(),
        control,
        &CaptureConfig::default(),
        depth_only(),
    )?;

    let params = session.read_depth_params()?;
    assert_eq!((params.fx, params.fy, params.cx, params.cy), (0.0, 1.0, 3.0, 4.0));
    Ok(())
}

#[test]
fn device_loss_stops_acquisition() -> color_eyre::Result<()> {
    let engine = ScriptedEngine::with_packets(frame_packets(1));
    engine.0.lock().unwrap().lose_device = true;

    let mut session = Session::open(
        engine,
        ScriptedControl::default(),
        &CaptureConfig::default(),
        depth_only(),
    )?;

    assert!(wait_until(|| session.is_device_lost()));
    assert!(wait_until(|| matches!(session.start(), Err(Error::Closed))));
    session.close()?;
    Ok(())
}

const CHUNK: usize = 256;

fn color_frame(sequence: u32, len: usize) -> Vec<u8> {
    let mut frame = ColorHeader::new(sequence).as_bytes().to_vec();
    frame.extend((0..len - frame.len()).map(|i| (i % 251) as u8));
    frame
}

/// Bulk chunks as the device sends them, with an empty chunk closing a frame
/// that fills its last chunk exactly.
fn color_chunks(frame: &[u8]) -> Vec<Vec<u8>> {
    let mut chunks: Vec<_> = frame.chunks(CHUNK).map(<[u8]>::to_vec).collect();
    if frame.len() % CHUNK == 0 {
        chunks.push(Vec::new());
    }
    chunks
}

#[test]
fn session_delivers_color_frames() -> color_eyre::Result<()> {
    let engine = ScriptedEngine::default();
    let config = CaptureConfig {
        color_transfers: 4,
        color_packet_size: CHUNK,
        ..Default::default()
    };
    let session = Session::open(
        engine.clone(),
        ScriptedControl::default(),
        &config,
        color_only(),
    )?;
    let (callback, frames) = frame_channel(Channel::Color, 8);
    session.set_callback(Channel::Color, Some(callback));

    let first = color_frame(1, 1000);
    let mut broken = color_frame(2, 700);
    broken[4..8].copy_from_slice(b"XXXX");
    let second = color_frame(3, 2 * CHUNK);
    engine.feed_chunks(
        [&first, &broken, &second]
            .into_iter()
            .flat_map(|frame| color_chunks(frame))
            .collect(),
    );

    let mut delivered = Vec::new();
    for _ in 0..2 {
        let frame = frames
            .recv_timeout(Duration::from_secs(5))
            .map_err(|e| eyre!("no frame: {e}"))?;
        assert_eq!(frame.meta.channel, Channel::Color);
        assert_eq!(frame.meta.format, PixelFormat::Jpeg);
        delivered.push((frame.meta.sequence, frame.data.to_vec()));
    }
    assert_eq!(delivered, vec![(1, first), (3, second)]);
    assert!(frames.recv_timeout(Duration::from_millis(100)).is_err());

    let specs = engine.0.lock().unwrap().specs.clone();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].endpoint, 0x83);
    assert_eq!(specs[0].packet_size, CHUNK);

    session.close()?;
    Ok(())
}

#[test]
fn camera_params_read_from_device_can_be_cached() -> color_eyre::Result<()> {
    let mut p0 = P0Tables::from_planes(std::array::from_fn(|k| vec![k as u16 + 1; 512 * 424]))?;
    p0.header[0] = 0x10;
    let color = ColorCameraParams {
        table_id: 2,
        f: 1081.4,
        ..Default::default()
    };
    let depth = DepthCameraParams {
        fx: 365.5,
        cx: 255.6,
        ..Default::default()
    };
    let control = ScriptedControl {
        pages: HashMap::from([
            (0x02, p0.to_bytes()),
            (0x03, depth.to_bytes()),
            (0x04, color.to_bytes()),
        ]),
        ..Default::default()
    };
    let mut session = Session::open(
        ScriptedEngine::default(),
        control,
        &CaptureConfig::default(),
        Channels {
            color: false,
            depth: false,
        },
    )?;

    let params = session.read_camera_params()?;
    assert_eq!(params.color, color);
    assert_eq!(params.depth, depth);
    assert_eq!(params.p0, p0);
    session.close()?;

    let dir = tempfile::tempdir()?;
    params.save(dir.path().join("kinect"))?;
    assert_eq!(CameraParams::load(dir.path().join("kinect"))?, params);
    Ok(())
}
