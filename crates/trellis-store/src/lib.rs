pub mod accumulator;
pub mod checkpoint;
pub mod conversation;
pub mod memory;
pub mod session;
pub mod step_log;

pub use accumulator::OutputAccumulator;
pub use checkpoint::CheckpointStore;
pub use conversation::{ConversationStore, NodeCursor};
pub use memory::SharedMemory;
pub use session::{SessionState, SessionStatus, SessionStore};
pub use step_log::{StepLog, StepRecord};
