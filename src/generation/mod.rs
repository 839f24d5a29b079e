mod frame;
mod ledger;
mod session;

pub use frame::{FrameBuffer, MAX_PENDING_BYTES, StreamEvent, decode_frame};
pub use ledger::{TokenArrival, TokenLedger};
pub use session::{GenerationConsumer, GenerationSummary, SessionState, SessionView};
