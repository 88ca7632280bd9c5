//! Reassembly of whole frames from transfer payloads.
//!
//! Each channel owns a [`RingBuffer`]. Payloads are appended while the
//! assembler trusts the stream position; structural markers (depth footers,
//! color header magic, short packets) decide whether the frame is committed
//! or thrown away. Damaged frames are dropped and never repaired.

use metrics::counter;
use tracing::{debug, trace};

use crate::capture::frame::{
    Channel, ColorHeader, DepthFooter, COLOR_FRAME_MAX, DEPTH_FOOTER_SIZE, DEPTH_FRAME_SIZE,
    DEPTH_SUBFRAMES, DEPTH_SUBFRAME_SIZE,
};
use crate::capture::transport::Completion;
use crate::pipeline::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Position in the stream unknown; payload is not kept.
    Unsynced,
    /// Appending; the next valid last-subframe footer completes a frame.
    Synced,
}

fn frame_dropped(channel: Channel, reason: &'static str) {
    debug!(%channel, reason, "frame dropped");
    counter!("k4w2_frames_dropped", "channel" => channel.as_str()).increment(1);
}

fn frame_committed(channel: Channel, len: usize) {
    trace!(%channel, len, "frame committed");
    counter!("k4w2_frames_committed", "channel" => channel.as_str()).increment(1);
}

/// Depth stream: isochronous packets, one footer per subframe.
pub struct DepthAssembler {
    ring: RingBuffer,
    state: SyncState,
}

impl DepthAssembler {
    pub fn new(ring_slots: usize) -> Self {
        Self {
            ring: RingBuffer::new(ring_slots, DEPTH_FRAME_SIZE),
            state: SyncState::Unsynced,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Feed every packet of an isochronous transfer. Returns the number of
    /// frames handed to `on_frame`.
    pub fn on_transfer<F>(&mut self, completion: &Completion<'_>, packet_size: usize, mut on_frame: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let mut frames = 0;
        for (i, packet) in completion.packets.iter().enumerate() {
            let start = i * packet_size;
            let payload = completion
                .data
                .get(start..start + packet.actual_length.min(packet_size))
                .unwrap_or_default();
            if self.push_packet(payload, packet_size, &mut on_frame) {
                frames += 1;
            }
        }
        frames
    }

    /// Feed one packet of nominal size `packet_size`. Returns true when a
    /// frame was committed.
    pub fn push_packet<F>(&mut self, packet: &[u8], packet_size: usize, on_frame: &mut F) -> bool
    where
        F: FnMut(&[u8]),
    {
        if packet.is_empty() {
            return false;
        }

        if self.state == SyncState::Synced {
            if let Err(overflow) = self.ring.append(packet) {
                trace!(?overflow, "depth slot overflow");
                self.desync("overflow");
                return false;
            }
        }

        if packet.len() >= packet_size {
            return false;
        }

        // A short packet closes a subframe; its tail is the footer.
        if packet.len() < DEPTH_FOOTER_SIZE {
            self.desync("truncated footer");
            return false;
        }
        let footer = match DepthFooter::from_tail(packet) {
            Some(footer) if footer.is_valid() => footer,
            _ => {
                self.desync("bad footer");
                return false;
            }
        };

        let expected = (footer.subsequence as usize + 1) * DEPTH_SUBFRAME_SIZE;
        if self.state == SyncState::Synced && self.ring.len() != expected {
            trace!(
                subsequence = footer.subsequence,
                len = self.ring.len(),
                expected,
                "depth subframe out of order"
            );
            self.desync("lost subframe");
        }

        if footer.subsequence as usize != DEPTH_SUBFRAMES - 1 {
            return false;
        }

        // Last subframe: the next packet starts a fresh frame.
        let committed = if self.state == SyncState::Synced && self.ring.len() == DEPTH_FRAME_SIZE {
            let frame = self.ring.commit();
            frame_committed(Channel::Depth, frame.len());
            on_frame(frame);
            true
        } else {
            self.ring.rollback();
            false
        };
        if self.state == SyncState::Unsynced {
            debug!(sequence = footer.sequence, "depth stream synchronized");
        }
        self.state = SyncState::Synced;
        committed
    }

    fn desync(&mut self, reason: &'static str) {
        if self.state == SyncState::Synced {
            frame_dropped(Channel::Depth, reason);
        }
        self.ring.rollback();
        self.state = SyncState::Unsynced;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorState {
    /// Next packet must start with a header.
    AwaitHeader,
    InFrame,
    /// Dropping packets until the current frame ends.
    Discard,
}

/// Color stream: bulk chunks, a header up front and a short chunk at the end.
pub struct ColorAssembler {
    ring: RingBuffer,
    state: ColorState,
}

impl ColorAssembler {
    pub fn new(ring_slots: usize) -> Self {
        Self::with_frame_size(ring_slots, COLOR_FRAME_MAX)
    }

    pub fn with_frame_size(ring_slots: usize, frame_size: usize) -> Self {
        Self {
            ring: RingBuffer::new(ring_slots, frame_size),
            state: ColorState::AwaitHeader,
        }
    }

    pub fn state(&self) -> ColorState {
        self.state
    }

    pub fn sync_state(&self) -> SyncState {
        match self.state {
            ColorState::Discard => SyncState::Unsynced,
            _ => SyncState::Synced,
        }
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn on_transfer<F>(&mut self, completion: &Completion<'_>, chunk_size: usize, mut on_frame: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        usize::from(self.push_packet(completion.data, chunk_size, &mut on_frame))
    }

    /// Feed one bulk chunk. Returns true when a frame was committed.
    pub fn push_packet<F>(&mut self, packet: &[u8], chunk_size: usize, on_frame: &mut F) -> bool
    where
        F: FnMut(&[u8]),
    {
        let last = packet.len() < chunk_size;

        match self.state {
            ColorState::Discard => {
                if last {
                    self.state = ColorState::AwaitHeader;
                }
                false
            }
            ColorState::AwaitHeader => {
                if packet.is_empty() {
                    return false;
                }
                match ColorHeader::parse(packet) {
                    Some(header) if header.is_valid() => {
                        self.state = ColorState::InFrame;
                        self.append(packet, last, on_frame)
                    }
                    _ => {
                        self.ring.rollback();
                        frame_dropped(Channel::Color, "bad header");
                        if !last {
                            self.state = ColorState::Discard;
                        }
                        false
                    }
                }
            }
            ColorState::InFrame => self.append(packet, last, on_frame),
        }
    }

    fn append<F>(&mut self, packet: &[u8], last: bool, on_frame: &mut F) -> bool
    where
        F: FnMut(&[u8]),
    {
        if let Err(overflow) = self.ring.append(packet) {
            trace!(?overflow, "color slot overflow");
            self.ring.rollback();
            frame_dropped(Channel::Color, "overflow");
            self.state = if last {
                ColorState::AwaitHeader
            } else {
                ColorState::Discard
            };
            return false;
        }
        if !last {
            return false;
        }

        let frame = self.ring.commit();
        frame_committed(Channel::Color, frame.len());
        on_frame(frame);
        self.state = ColorState::AwaitHeader;
        true
    }
}
