pub mod compaction;
pub mod creds;
pub mod executor;
pub mod judge;
pub mod monitoring;
pub mod runtime;
pub mod stream;
pub mod triggers;
pub mod webhook;

pub use executor::{ExecContext, ExecutorDeps, GraphExecutor, InputRouter, RouteDecision};
pub use judge::{ImplicitJudge, JudgeDecision, JudgeInput, LlmCriticJudge, NodeJudge, Verdict};
pub use runtime::{AgentRuntime, ChatOutcome, GraphDefinition};
pub use stream::{ExecutionReport, ExecutionStream};
pub use webhook::WebhookListener;
