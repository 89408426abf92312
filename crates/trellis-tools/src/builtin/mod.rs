pub mod monitoring;
pub mod set_output;

pub use monitoring::{EmitEscalationTicketTool, NotifyOperatorTool, WorkerHealthSummaryTool};
pub use set_output::SetOutputTool;
