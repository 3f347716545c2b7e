//! Command-line entry point: wires `Settings`, a concrete `LlmClient`, and
//! the `SandboxSupervisor` into one `Orchestrator::run` call.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden_budget::{BudgetManager, PricingTable};
use warden_config::Settings;
use warden_egress::EgressFilter;
use warden_llm::OpenAiCompatibleClient;
use warden_orchestrator::{AgentStep, Orchestrator};
use warden_sandbox::SandboxSupervisor;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Sandboxed code-execution agent loop")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one query through the agent loop.
    Run {
        query: String,
        /// Optional read-only file to mount for the Context Handle.
        #[arg(long)]
        context: Option<PathBuf>,
        /// Append each step as a JSON line to this file.
        #[arg(long)]
        transcript: Option<PathBuf>,
        /// Print every step, not just the final answer.
        #[arg(long)]
        verbose: bool,
    },
    /// Validate settings and probe the container daemon without running
    /// any model-generated code.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Doctor => run_doctor().await,
        Commands::Run { query, context, transcript, verbose } => {
            run_query(&query, context.as_deref(), transcript.as_deref(), verbose).await
        }
    }
}

async fn run_doctor() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;
    println!("container_image: {}", settings.sandbox.image);
    println!("runtime selector: {:?}", settings.sandbox.runtime);
    println!("allow_unsafe_runtime: {}", settings.sandbox.allow_unsafe_runtime);

    let sandbox = SandboxSupervisor::connect().context("connecting to container daemon")?;
    match sandbox.available_runtimes().await {
        Ok(runtimes) => {
            println!("daemon reachable; advertised runtimes: {runtimes:?}");
            let secure_present = runtimes.iter().any(|r| r == "runsc");
            if !secure_present && !settings.sandbox.allow_unsafe_runtime {
                println!(
                    "WARNING: no secure (runsc-class) runtime advertised and \
                     allow_unsafe_runtime is false — execution will refuse to run."
                );
            }
        }
        Err(e) => println!("daemon unreachable: {e}"),
    }

    match &settings.llm_api_key {
        Some(_) => println!("llm_api_key: present"),
        None => println!("llm_api_key: unset ({} may reject unauthenticated requests)", settings.llm_base_url),
    }

    Ok(())
}

async fn run_query(query: &str, context: Option<&std::path::Path>, transcript: Option<&std::path::Path>, verbose: bool) -> Result<()> {
    let settings = Settings::load().context("loading settings")?;

    let llm = Arc::new(OpenAiCompatibleClient::new(
        settings.llm_base_url.clone(),
        settings.llm_model.clone(),
        settings.llm_api_key.clone(),
    ));
    let sandbox = SandboxSupervisor::connect().context("connecting to container daemon")?;
    let pricing = PricingTable::load(settings.pricing_path.as_deref());
    let budget = BudgetManager::new(pricing, settings.max_budget_dollars);
    let egress = EgressFilter::new(settings.egress.clone());

    let mut orchestrator = Orchestrator::new(llm, sandbox, settings.sandbox.clone(), egress, budget, settings.max_iterations);

    let result = orchestrator.run(query, context).await?;

    if let Some(path) = transcript {
        append_transcript(path, &result.steps).context("writing transcript")?;
    }

    if verbose {
        for step in &result.steps {
            println!(
                "[{:>3}] {:?} :: {} -> {}{}",
                step.iteration,
                step.action,
                step.input_summary,
                step.output_summary,
                step.error.as_deref().map(|e| format!(" (error: {e})")).unwrap_or_default(),
            );
        }
        println!("---");
    }

    match result.final_answer {
        Some(answer) => println!("{answer}"),
        None => {
            println!("{}", result.budget_summary);
            if let Some(error) = &result.terminal_error {
                bail!("run did not produce a final answer: {error}");
            }
            bail!("run exhausted {} iterations without a final answer", result.iterations);
        }
    }

    Ok(())
}

fn append_transcript(path: &std::path::Path, steps: &[AgentStep]) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for step in steps {
        let line = serde_json::to_string(step)?;
        writeln!(file, "{line}")?;
    }
    Ok(())
}
