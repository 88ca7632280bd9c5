pub mod assembler;
pub mod control;
pub mod frame;
pub mod session;
pub mod stream;
pub mod transport;

pub use assembler::{ColorAssembler, DepthAssembler, SyncState};
pub use frame::{Channel, Frame, PixelFormat};
pub use session::{frame_channel, Channels, FrameCallback, Session};
pub use transport::{ControlChannel, TransferEngine};
