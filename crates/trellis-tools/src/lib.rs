pub mod builtin;
pub mod registry;

pub use builtin::{
    EmitEscalationTicketTool, NotifyOperatorTool, SetOutputTool, WorkerHealthSummaryTool,
};
pub use registry::ToolRegistry;

/// A registry pre-loaded with the tools every graph gets.
pub fn with_builtins() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(SetOutputTool);
    registry
}
