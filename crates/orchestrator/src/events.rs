//! The append-only step log named in the data model: one `AgentStep` per
//! loop action, plus the `OrchestratorResult` a run is summarized into.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    LlmRequest,
    CodeExec,
    Filter,
    Final,
}

/// One entry in the run's transcript. `cost_delta` is zero for steps that
/// don't touch the LLM (code_exec, filter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub iteration: u32,
    pub action: StepAction,
    pub input_summary: String,
    pub output_summary: String,
    pub error: Option<String>,
    pub cost_delta: f64,
}

impl AgentStep {
    pub fn ok(
        iteration: u32,
        action: StepAction,
        input_summary: impl Into<String>,
        output_summary: impl Into<String>,
        cost_delta: f64,
    ) -> Self {
        Self {
            iteration,
            action,
            input_summary: input_summary.into(),
            output_summary: output_summary.into(),
            error: None,
            cost_delta,
        }
    }

    pub fn failed(
        iteration: u32,
        action: StepAction,
        input_summary: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            iteration,
            action,
            input_summary: input_summary.into(),
            output_summary: String::new(),
            error: Some(error.into()),
            cost_delta: 0.0,
        }
    }
}

/// The run's outcome: what `Orchestrator::run` returns on every non-fatal
/// path, including exhaustion of `max_iterations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub final_answer: Option<String>,
    pub success: bool,
    pub iterations: u32,
    pub steps: Vec<AgentStep>,
    pub budget_summary: String,
    pub terminal_error: Option<String>,
}

/// Truncate `text` to at most `max_chars` characters for the step log,
/// appending `…` when cut. Step summaries are for a human transcript, not
/// the conversation itself, so they're deliberately lossy.
pub fn summarize(text: &str, max_chars: usize) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_passes_short_text_through() {
        assert_eq!(summarize("hello", 10), "hello");
    }

    #[test]
    fn summarize_truncates_and_marks_long_text() {
        let out = summarize(&"a".repeat(50), 10);
        assert_eq!(out.chars().count(), 11);
        assert!(out.ends_with('…'));
    }
}
