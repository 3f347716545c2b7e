//! The Agent Loop: composes the Context Handle, Sandbox Supervisor,
//! Code Extractor, Egress Filter, and Budget Manager into one bounded
//! run per query.

mod agent_loop;
mod events;
mod prompt_builder;

pub use agent_loop::Orchestrator;
pub use events::{AgentStep, OrchestratorResult, StepAction};
pub use prompt_builder::build_system_prompt;

use thiserror::Error;

/// The closed error taxonomy for everything that can abort a run before
/// `OrchestratorResult` has a chance to carry the failure as a
/// `terminal_error` field instead.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("llm: {0}")]
    Llm(#[from] warden_llm::LlmError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] warden_sandbox::SandboxError),

    #[error("context: {0}")]
    Context(#[from] warden_context::ContextError),

    #[error("budget: {0}")]
    Budget(#[from] warden_budget::BudgetError),

    #[error("data leak detected: {0}")]
    Leak(#[from] warden_egress::DataLeakError),

    #[error("internal: {0}")]
    Internal(String),
}
