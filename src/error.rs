use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by the USB transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device disconnected")]
    NoDevice,
    #[error("transfer timed out")]
    Timeout,
    #[error("short transfer: {actual} of {expected} bytes")]
    Short { expected: usize, actual: usize },
    #[error("endpoint {0:#04x} reports no isochronous bandwidth")]
    NoBandwidth(u8),
    #[error("transport error code {0}")]
    Code(i32),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("{backend} unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("operation not supported by {0}")]
    NotSupported(&'static str),

    #[error("slot {slot} out of range for {count} slots")]
    InvalidSlot { slot: usize, count: usize },

    #[error("invalid buffer length {actual}, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("slot {0} has no pending request")]
    NotRequested(usize),

    #[error("calibration: {0}")]
    Calibration(String),

    #[error("gpu: {0}")]
    Gpu(String),

    #[error("jpeg: {0}")]
    Jpeg(String),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),

    #[error("session closed")]
    Closed,

    #[error("acquisition thread panicked")]
    ThreadPanicked,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// True when the device went away underneath the session.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Transport(TransportError::NoDevice))
    }
}
