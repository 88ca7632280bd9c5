//! Boundary to the USB transfer facility.
//!
//! The engine owns the transfer buffers; completions lend them to the
//! acquisition thread for the duration of a callback.

use std::time::Duration;

use crate::capture::frame::Channel;
use crate::TransportError;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Isochronous,
}

/// Outcome of one transfer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    NoDevice,
    Cancelled,
    Error(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub channel: Channel,
    pub index: usize,
}

/// Per-packet result of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub length: usize,
    pub actual_length: usize,
}

/// A finished transfer. For isochronous transfers `data` spans the whole
/// transfer buffer and packet `i` starts at `i * spec.packet_size`; for bulk
/// transfers `data` holds exactly the received bytes and `packets` is empty.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub id: TransferId,
    pub status: TransferStatus,
    pub data: &'a [u8],
    pub packets: &'a [IsoPacket],
}

/// Shape of the transfer pool behind one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub channel: Channel,
    pub kind: TransferKind,
    pub endpoint: u8,
    pub num_transfers: usize,
    pub packets_per_transfer: usize,
    pub packet_size: usize,
}

impl StreamSpec {
    pub fn transfer_size(&self) -> usize {
        self.packets_per_transfer * self.packet_size
    }
}

/// Asynchronous streaming transfers, driven from a single thread.
pub trait TransferEngine: Send + 'static {
    /// Bytes per service interval of an isochronous endpoint.
    fn max_iso_packet_size(&mut self, endpoint: u8) -> TransportResult<usize>;

    /// Allocate `spec.num_transfers` transfers for `spec.channel`.
    fn open_stream(&mut self, spec: &StreamSpec) -> TransportResult<()>;

    fn submit(&mut self, id: TransferId) -> TransportResult<()>;

    /// Request cancellation; the transfer later completes as `Cancelled`.
    fn cancel(&mut self, id: TransferId) -> TransportResult<()>;

    /// Deliver finished transfers, waiting at most `timeout` for the first.
    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion<'_>),
    ) -> TransportResult<()>;
}

/// Synchronous bulk endpoints used for device commands.
pub trait ControlChannel: Send {
    fn bulk_out(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
        -> TransportResult<usize>;

    fn bulk_in(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> TransportResult<usize>;
}
