//! Bookkeeping for one channel's pool of streaming transfers.

use metrics::counter;
use tracing::{debug, warn};

use crate::capture::transport::{StreamSpec, TransferEngine, TransferId, TransferStatus};
use crate::{Result, TransportError};

/// What to do with a transfer after its completion was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    /// Payload is valid and goes to the assembler.
    pub deliver: bool,
    pub resubmit: bool,
}

pub struct UsbStream {
    spec: StreamSpec,
    active: Vec<bool>,
    inactive: usize,
    shutdown: bool,
    device_lost: bool,
}

impl UsbStream {
    pub fn open<E: TransferEngine + ?Sized>(engine: &mut E, spec: StreamSpec) -> Result<Self> {
        engine.open_stream(&spec)?;
        debug!(
            channel = %spec.channel,
            endpoint = spec.endpoint,
            transfers = spec.num_transfers,
            bytes = spec.transfer_size(),
            "stream opened"
        );
        Ok(Self {
            spec,
            active: vec![false; spec.num_transfers],
            inactive: spec.num_transfers,
            shutdown: false,
            device_lost: false,
        })
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    fn id(&self, index: usize) -> TransferId {
        TransferId {
            channel: self.spec.channel,
            index,
        }
    }

    /// Submit every transfer. Failed submissions count as inactive.
    pub fn start<E: TransferEngine + ?Sized>(&mut self, engine: &mut E) {
        for index in 0..self.spec.num_transfers {
            if self.active[index] {
                continue;
            }
            match engine.submit(self.id(index)) {
                Ok(()) => {
                    self.active[index] = true;
                    self.inactive -= 1;
                }
                Err(e) => {
                    warn!(channel = %self.spec.channel, index, "submit failed: {e}");
                    self.note_error(&e);
                }
            }
        }
    }

    /// Classify a completion and update the inactive count.
    pub fn on_complete(&mut self, index: usize, status: TransferStatus) -> Disposition {
        match status {
            TransferStatus::Completed => {
                if self.shutdown {
                    self.retire(index);
                }
                Disposition {
                    deliver: true,
                    resubmit: !self.shutdown,
                }
            }
            TransferStatus::NoDevice => {
                warn!(channel = %self.spec.channel, "no device");
                self.device_lost = true;
                self.shutdown = true;
                self.retire(index);
                Disposition {
                    deliver: false,
                    resubmit: false,
                }
            }
            TransferStatus::Cancelled => {
                debug!(channel = %self.spec.channel, index, "cancelled");
                self.retire(index);
                Disposition {
                    deliver: false,
                    resubmit: false,
                }
            }
            TransferStatus::Error(code) => {
                // Transient errors are common on some hosts; keep the pool alive.
                warn!(channel = %self.spec.channel, index, code, "transfer error");
                counter!("k4w2_transfer_errors", "channel" => self.spec.channel.as_str())
                    .increment(1);
                if self.shutdown {
                    self.retire(index);
                }
                Disposition {
                    deliver: false,
                    resubmit: !self.shutdown,
                }
            }
        }
    }

    pub fn resubmit<E: TransferEngine + ?Sized>(&mut self, engine: &mut E, index: usize) {
        if let Err(e) = engine.submit(self.id(index)) {
            warn!(channel = %self.spec.channel, index, "resubmission failed: {e}");
            self.retire(index);
            self.note_error(&e);
        }
    }

    /// Stop resubmitting and cancel whatever is still in flight.
    pub fn cancel_all<E: TransferEngine + ?Sized>(&mut self, engine: &mut E) {
        self.shutdown = true;
        for index in 0..self.spec.num_transfers {
            if !self.active[index] {
                continue;
            }
            if let Err(e) = engine.cancel(self.id(index)) {
                debug!(channel = %self.spec.channel, index, "cancel failed: {e}");
                self.retire(index);
            }
        }
    }

    fn note_error(&mut self, error: &TransportError) {
        if *error == TransportError::NoDevice {
            self.device_lost = true;
            self.shutdown = true;
        }
    }

    fn retire(&mut self, index: usize) {
        if let Some(active) = self.active.get_mut(index) {
            if *active {
                *active = false;
                self.inactive += 1;
            }
        }
    }

    pub fn inactive(&self) -> usize {
        self.inactive
    }

    /// Every transfer has been retired.
    pub fn is_idle(&self) -> bool {
        self.inactive >= self.spec.num_transfers
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }
}
