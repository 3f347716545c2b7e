//! The Agent Loop: couples an `LlmClient` to a `Supervisor`, extracting
//! code from model output, enforcing the Budget Manager before every
//! request, and recognizing the `FINAL(...)` termination signal — whether
//! the model writes that marker itself or the sandboxed program prints it.
//!
//! Iterations are strictly sequential — step N's observation is appended
//! to the conversation before step N+1's request goes out — so the loop
//! body below is a plain `loop`, not a fan-out over futures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_budget::BudgetManager;
use warden_context::ContextHandle;
use warden_egress::EgressFilter;
use warden_extract::extract;
use warden_llm::{ChatMessage, LlmClient, LlmError};
use warden_sandbox::{BollardDaemon, ContainerDaemon, SandboxConfig, Supervisor};

use crate::events::{summarize, AgentStep, OrchestratorResult, StepAction};
use crate::WardenError;

/// Cap on the observation text spliced back into the conversation, separate
/// from the egress filter's own truncation — this bounds prompt growth
/// across iterations even when the filter's output is near its own cap.
const MAX_OBSERVATION_CHARS: usize = 6000;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Drives one query to completion or exhaustion. Built fresh per run —
/// not reentrant, matching the "single-use per query" lifecycle. Generic
/// over the container daemon so tests can substitute a scripted double
/// for the end-to-end scenarios that need one.
pub struct Orchestrator<D: ContainerDaemon = BollardDaemon> {
    llm: Arc<dyn LlmClient>,
    sandbox: Supervisor<D>,
    sandbox_config: SandboxConfig,
    egress: EgressFilter,
    budget: BudgetManager,
    max_iterations: u32,
    cancel: CancellationToken,
}

impl<D: ContainerDaemon> Orchestrator<D> {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sandbox: Supervisor<D>,
        sandbox_config: SandboxConfig,
        egress: EgressFilter,
        budget: BudgetManager,
        max_iterations: u32,
    ) -> Self {
        Self {
            llm,
            sandbox,
            sandbox_config,
            egress,
            budget,
            max_iterations,
            cancel: CancellationToken::new(),
        }
    }

    /// Installs an externally owned cancellation token in place of the
    /// default fresh one, so a caller can cancel an in-flight run.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs `query` to completion, optionally mounting a read-only context
    /// file for the sandbox and Context Handle to share.
    ///
    /// `OrchestratorResult.iterations` only counts rounds that actually
    /// resolved — a final marker, a nudge to retry, or a completed sandbox
    /// run. A round that aborts the whole loop (budget refusal, transport
    /// failure, a `SecurityViolation` from the first sandbox call) leaves
    /// the counter untouched, so a day-one failure reports zero iterations.
    pub async fn run(
        &mut self,
        query: &str,
        context_path: Option<&Path>,
    ) -> Result<OrchestratorResult, WardenError> {
        let context = match context_path {
            Some(path) => Some(Arc::new(ContextHandle::open(path)?)),
            None => None,
        };
        let system_prompt = crate::prompt_builder::build_system_prompt(context.is_some());

        let mut messages = vec![ChatMessage::user(query)];
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut iteration: u32 = 0;

        let (final_answer, terminal_error) = loop {
            if self.cancel.is_cancelled() {
                break (None, Some("cancelled".to_string()));
            }
            if iteration >= self.max_iterations {
                info!(iteration, "agent loop exhausted max_iterations");
                break (None, None);
            }
            let candidate = iteration + 1;

            if let Err(e) = self.budget.ensure_within_budget() {
                steps.push(AgentStep::failed(candidate, StepAction::LlmRequest, "budget check", e.to_string()));
                break (None, Some(e.to_string()));
            }

            let completion = match self.complete_with_retry(&messages, &system_prompt).await {
                Ok(c) => c,
                Err(e) => {
                    steps.push(AgentStep::failed(candidate, StepAction::LlmRequest, summarize(query, 200), e.to_string()));
                    break (None, Some(e.to_string()));
                }
            };

            let cost_delta = match self.budget.record(&completion.model, completion.input_tokens, completion.output_tokens) {
                Ok(delta) => delta,
                Err(e) => {
                    steps.push(AgentStep::failed(candidate, StepAction::LlmRequest, "record usage", e.to_string()));
                    break (None, Some(e.to_string()));
                }
            };
            steps.push(AgentStep::ok(
                candidate,
                StepAction::LlmRequest,
                summarize(&messages.last().map(|m| m.content.clone()).unwrap_or_default(), 200),
                summarize(&completion.text, 400),
                cost_delta,
            ));
            messages.push(ChatMessage::assistant(completion.text.clone()));

            let extraction = extract(&completion.text);

            if let Some(answer) = extraction.final_answer {
                iteration = candidate;
                steps.push(AgentStep::ok(iteration, StepAction::Final, "final marker scan", summarize(&answer, 400), 0.0));
                break (Some(answer), None);
            }

            let Some(code) = extraction.code else {
                debug!(iteration = candidate, "no code block and no final marker; nudging the model");
                messages.push(ChatMessage::user(
                    "No fenced code block or FINAL(answer) marker was found in your last \
                     message. Emit one or the other.",
                ));
                iteration = candidate;
                continue;
            };

            let exec_result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break (None, Some("cancelled".to_string())),
                result = self.sandbox.execute(&self.sandbox_config, &code, context_path) => result,
            };
            let exec_result = match exec_result {
                Ok(r) => r,
                Err(e) => {
                    steps.push(AgentStep::failed(candidate, StepAction::CodeExec, summarize(&code, 200), e.to_string()));
                    break (None, Some(e.to_string()));
                }
            };
            let exec_summary = format!(
                "exit={:?} timed_out={} oom_killed={} duration={:.1}s",
                exec_result.exit_code,
                exec_result.timed_out,
                exec_result.oom_killed,
                exec_result.duration.as_secs_f64(),
            );
            steps.push(AgentStep::ok(candidate, StepAction::CodeExec, summarize(&code, 200), exec_summary, 0.0));

            let raw_len = exec_result.stdout.len() + exec_result.stderr.len();
            let mut combined = Vec::new();
            if exec_result.oom_killed {
                combined.extend_from_slice(b"Memory Limit Exceeded\n");
            } else if exec_result.timed_out {
                combined.extend_from_slice(b"Execution Timed Out\n");
            }
            combined.extend_from_slice(exec_result.stdout.as_bytes());
            combined.extend_from_slice(b"\n--- stderr ---\n");
            combined.extend_from_slice(exec_result.stderr.as_bytes());

            let filter = self.egress.clone();
            let context_for_filter = context.clone();
            let filter_outcome = tokio::task::spawn_blocking(move || {
                filter.filter(&combined, context_for_filter.as_deref())
            })
            .await
            .map_err(|e| WardenError::Internal(e.to_string()))?;

            let observation_text = match filter_outcome {
                Ok((text, leak_events)) => {
                    steps.push(AgentStep::ok(
                        candidate,
                        StepAction::Filter,
                        format!("{raw_len} byte(s) filtered"),
                        format!("{} event(s)", leak_events.len()),
                        0.0,
                    ));
                    if !leak_events.is_empty() {
                        debug!(iteration = candidate, events = ?leak_events, "egress filter redacted output");
                    }
                    text
                }
                Err(leak) => {
                    warn!(iteration = candidate, events = ?leak.events, "egress filter raised on leak");
                    steps.push(AgentStep::failed(candidate, StepAction::Filter, "leak policy", leak.to_string()));
                    break (None, Some(leak.to_string()));
                }
            };

            // The model is instructed to emit FINAL(...) itself, but code
            // that prints its own final answer terminates the loop on the
            // same iteration rather than waiting for a redundant round-trip.
            if let Some(answer) = extract(&observation_text).final_answer {
                iteration = candidate;
                steps.push(AgentStep::ok(iteration, StepAction::Final, "final marker in sandboxed output", summarize(&answer, 400), 0.0));
                break (Some(answer), None);
            }

            iteration = candidate;
            let observation_text = summarize(&observation_text, MAX_OBSERVATION_CHARS);
            messages.push(ChatMessage::user(format!("OBSERVATION:\n{observation_text}")));
        };

        Ok(OrchestratorResult {
            success: final_answer.is_some(),
            final_answer,
            iterations: iteration,
            steps,
            budget_summary: self.budget.summary(),
            terminal_error,
        })
    }

    /// Requests a completion, retrying once with a small jittered delay on
    /// a transient transport failure before treating it as fatal.
    async fn complete_with_retry(
        &self,
        messages: &[ChatMessage],
        system_prompt: &str,
    ) -> Result<warden_llm::CompletionResponse, LlmError> {
        match self.llm.complete(messages, Some(system_prompt)).await {
            Ok(response) => Ok(response),
            Err(first_error) => {
                let jitter_ms = rand::rng().random_range(0..250);
                let delay = RETRY_BACKOFF_BASE + Duration::from_millis(jitter_ms);
                warn!(error = %first_error, delay_ms = delay.as_millis(), "llm request failed, retrying once");
                tokio::time::sleep(delay).await;
                self.llm.complete(messages, Some(system_prompt)).await.map_err(|second_error| {
                    warn!(error = %second_error, "llm retry also failed");
                    second_error
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use warden_budget::PricingTable;
    use warden_egress::EgressConfig;
    use warden_llm::CompletionResponse;
    use warden_sandbox::{ContainerSpec, ExecutionResult, SandboxError};

    struct ScriptedLlm {
        replies: Vec<&'static str>,
        calls: AtomicU32,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn scripted(replies: Vec<&'static str>) -> Self {
            Self { replies, calls: AtomicU32::new(0), seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, messages: &[ChatMessage], _system_prompt: Option<&str>) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let text = self.replies.get(index).copied().unwrap_or("FINAL(done)").to_string();
            Ok(CompletionResponse { text, input_tokens: 10, output_tokens: 10, model: "test-model".to_string() })
        }

        async fn stream(&self, _messages: &[ChatMessage], _system_prompt: Option<&str>) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
            unimplemented!("not exercised by the agent loop tests")
        }
    }

    /// `ContainerDaemon` double that hands back a scripted sequence of
    /// results (or a fixed advertised runtime set) without touching a
    /// real daemon.
    struct FakeDaemon {
        runtimes: Vec<String>,
        results: Mutex<VecDeque<Result<ExecutionResult, SandboxError>>>,
        calls: AtomicU32,
    }

    impl FakeDaemon {
        fn with_runtimes(runtimes: Vec<&str>) -> Self {
            Self {
                runtimes: runtimes.into_iter().map(String::from).collect(),
                results: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn with_result(self, result: Result<ExecutionResult, SandboxError>) -> Self {
            self.results.lock().unwrap().push_back(result);
            self
        }
    }

    #[async_trait]
    impl ContainerDaemon for FakeDaemon {
        async fn available_runtimes(&self) -> Result<Vec<String>, SandboxError> {
            Ok(self.runtimes.clone())
        }

        async fn run(&self, _spec: ContainerSpec<'_>) -> Result<ExecutionResult, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or_else(|| Ok(ExecutionResult::default()))
        }
    }

    fn test_budget() -> BudgetManager {
        BudgetManager::new(PricingTable::builtin(), 10.0)
    }

    fn unreachable_sandbox() -> Supervisor<FakeDaemon> {
        Supervisor::from_daemon(FakeDaemon::with_runtimes(vec!["runsc"]))
    }

    #[tokio::test]
    async fn stops_immediately_on_final_marker_without_touching_sandbox() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["FINAL(42)"]));
        let mut orchestrator = Orchestrator::new(
            llm,
            unreachable_sandbox(),
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            5,
        );

        let result = orchestrator.run("what is the answer?", None).await.expect("run should succeed");
        assert!(result.success);
        assert_eq!(result.final_answer.as_deref(), Some("42"));
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn exhausts_iterations_when_model_never_finalizes() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["still thinking, no code or marker here"]));
        let mut orchestrator = Orchestrator::new(
            llm,
            unreachable_sandbox(),
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            3,
        );

        let result = orchestrator.run("loop forever", None).await.expect("run should succeed even when exhausted");
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
        assert!(result.terminal_error.is_none());
    }

    #[tokio::test]
    async fn cancellation_token_stops_the_loop_before_the_next_iteration() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["no marker yet"]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut orchestrator = Orchestrator::new(
            llm,
            unreachable_sandbox(),
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            5,
        )
        .with_cancellation(cancel);

        let result = orchestrator.run("anything", None).await.expect("run should surface cancellation as a terminal result");
        assert!(!result.success);
        assert_eq!(result.terminal_error.as_deref(), Some("cancelled"));
        assert_eq!(result.iterations, 0);
    }

    #[tokio::test]
    async fn sandboxed_print_of_the_final_marker_terminates_in_one_iteration() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["```python\nprint(f\"FINAL({2+2})\")\n```"]));
        let daemon = FakeDaemon::with_runtimes(vec!["runsc"]).with_result(Ok(ExecutionResult {
            stdout: "FINAL(4)\n".to_string(),
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            ..Default::default()
        }));
        let mut orchestrator = Orchestrator::new(
            llm,
            Supervisor::from_daemon(daemon),
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            5,
        );

        let result = orchestrator.run("what is 2 + 2?", None).await.expect("run should succeed");
        assert!(result.success);
        assert_eq!(result.final_answer.as_deref(), Some("4"));
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn oom_kill_produces_an_explicit_observation_and_the_loop_continues() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["```python\nx = 'a' * 10**9\n```", "FINAL(done)"]));
        let daemon = FakeDaemon::with_runtimes(vec!["runsc"]).with_result(Ok(ExecutionResult {
            exit_code: Some(137),
            oom_killed: true,
            duration: Duration::from_millis(5),
            ..Default::default()
        }));
        let mut orchestrator = Orchestrator::new(
            llm.clone(),
            Supervisor::from_daemon(daemon),
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            5,
        );

        let result = orchestrator.run("allocate too much memory", None).await.expect("run should succeed");
        assert!(result.success);
        assert_eq!(result.iterations, 2);

        let seen = llm.seen.lock().unwrap();
        let observation = seen[1].last().expect("the second call carries the prior observation");
        assert!(observation.content.contains("Memory Limit Exceeded"));
    }

    #[tokio::test]
    async fn network_attempt_is_surfaced_as_an_observation_not_a_sandbox_error() {
        let llm = Arc::new(ScriptedLlm::scripted(vec![
            "```python\nimport socket\nsocket.create_connection(('1.1.1.1', 80))\n```",
            "FINAL(done)",
        ]));
        let daemon = FakeDaemon::with_runtimes(vec!["runsc"]).with_result(Ok(ExecutionResult {
            stderr: "OSError: [Errno 101] Network is unreachable".to_string(),
            exit_code: Some(1),
            duration: Duration::from_millis(5),
            ..Default::default()
        }));
        let cfg = SandboxConfig::default();
        assert!(!cfg.network_enabled, "network must stay disabled by default for this scenario to hold");
        let mut orchestrator = Orchestrator::new(
            llm.clone(),
            Supervisor::from_daemon(daemon),
            cfg,
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            5,
        );

        let result = orchestrator.run("reach out over the network", None).await.expect("run should succeed");
        assert!(result.success);
        assert_eq!(result.iterations, 2);

        let seen = llm.seen.lock().unwrap();
        let observation = seen[1].last().expect("the second call carries the prior observation");
        assert!(observation.content.contains("Network is unreachable"));
    }

    #[tokio::test]
    async fn missing_secure_runtime_with_strict_policy_executes_zero_iterations() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["```python\nprint('hi')\n```"]));
        // No `runsc` advertised; `SandboxConfig::default()` is `Auto` with
        // `allow_unsafe_runtime = false`, so `execute()` fails closed.
        let sandbox = Supervisor::from_daemon(FakeDaemon::with_runtimes(vec![]));
        let mut orchestrator = Orchestrator::new(
            llm,
            sandbox,
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            test_budget(),
            5,
        );

        let result = orchestrator.run("do anything", None).await.expect("run should surface the violation as a terminal result");
        assert!(!result.success);
        assert_eq!(result.iterations, 0);
        assert!(result.terminal_error.as_deref().unwrap().to_lowercase().contains("secure"));
    }

    #[tokio::test]
    async fn budget_ceiling_refuses_the_second_iteration_before_the_llm_is_called() {
        let llm = Arc::new(ScriptedLlm::scripted(vec!["no marker yet", "FINAL(done)"]));
        let budget = BudgetManager::new(PricingTable::builtin(), 0.00001);
        let mut orchestrator = Orchestrator::new(
            llm.clone(),
            unreachable_sandbox(),
            SandboxConfig::default(),
            EgressFilter::new(EgressConfig::default()),
            budget,
            5,
        );

        let result = orchestrator.run("anything", None).await.expect("run should surface the budget error as terminal");
        assert!(!result.success);
        assert_eq!(result.iterations, 1);
        assert!(result.terminal_error.as_deref().unwrap().contains("budget"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1, "a second llm call must not happen once the ceiling is reached");
    }
}
