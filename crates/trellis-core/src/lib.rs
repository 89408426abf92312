pub mod config;
pub mod error;
pub mod event;
pub mod expr;
pub mod goal;
pub mod spec;
pub mod ticket;
pub mod traits;
pub mod types;

pub use config::{LoopConfig, RuntimeConfig};
pub use error::{Result, TrellisError};
pub use event::{AgentEvent, EventBus, EventFilter, EventPayload, EventType};
pub use spec::{EdgeCondition, EdgeSpec, EntryPointSpec, GraphSpec, NodeSpec, TriggerSpec};
pub use ticket::{EscalationTicket, Severity};
pub use types::*;
