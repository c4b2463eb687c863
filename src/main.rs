//! sandagent CLI
//!
//! Usage:
//!   sandagent --prompt "What is the 20th Fibonacci number?"
//!   echo "Plot nothing, just sum 1..100" | sandagent --model ollama/qwen3
//!   sandagent -p "..." --max-turns 5 --reflect --sandbox process
//!
//! The final answer goes to stdout and logs to stderr. Exit code 0 means the
//! model finished, 2 that the budget ran out, 1 a fatal error.

use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sandagent::agent::{Budget, Outcome, SessionRecord, SessionStore};
use sandagent::config::{SandboxBackend, Settings};
use sandagent::provider::{ProviderConfig, DEFAULT_MODEL_SPEC};
use sandagent::sandbox::{ProcessSandbox, ResourceLimits, SandboxManager};
use sandagent::metrics;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "sandagent")]
#[command(version, about = "Run an LLM agent that executes its code in a sandbox")]
struct Cli {
    /// Task for the agent; read from stdin when omitted
    #[arg(short, long)]
    prompt: Option<String>,

    /// Model as provider/model (ollama, openai, gemini, anthropic)
    #[arg(short, long, env = "SANDAGENT_MODEL", default_value = DEFAULT_MODEL_SPEC)]
    model: String,

    /// Override the provider endpoint
    #[arg(long, env = "SANDAGENT_BASE_URL")]
    base_url: Option<String>,

    /// Maximum model rounds
    #[arg(long, alias = "max-callbacks", default_value_t = 10)]
    max_turns: usize,

    /// Wall-clock limit for the whole session
    #[arg(long)]
    max_seconds: Option<u64>,

    /// Ask the model to reflect once on its answer
    #[arg(long)]
    reflect: bool,

    /// Run the code the model writes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    execute_code: bool,

    /// Advertise a native execute_code tool to the provider
    #[arg(long)]
    native_tools: bool,

    #[arg(long, value_enum, default_value_t = SandboxBackend::Auto)]
    sandbox: SandboxBackend,

    /// Docker image for the container sandbox
    #[arg(long)]
    image: Option<String>,

    /// Root directory of the process sandbox
    #[arg(long)]
    sandbox_root: Option<PathBuf>,

    /// Put process-sandbox sessions in cgroups (needs privileges)
    #[arg(long)]
    cgroups: bool,

    /// Run process-sandbox children without user/mount/PID namespaces
    #[arg(long)]
    no_confine: bool,

    /// Per-execution wall-clock limit in seconds
    #[arg(long, default_value_t = 30.0)]
    timeout_secs: f64,

    /// Memory ceiling per sandbox in MiB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// CPU cores per sandbox
    #[arg(long)]
    cpus: Option<f64>,

    /// Let executed code reach the network
    #[arg(long)]
    allow_network: bool,

    /// Per-request provider timeout in seconds
    #[arg(long, default_value_t = 120)]
    provider_timeout_secs: u64,

    /// Export spans to this OTLP endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Save the transcript as JSON
    #[arg(long)]
    save_session: bool,

    /// Where saved transcripts go (default ~/.sandagent/sessions)
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    print_metrics: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut provider = ProviderConfig::from_model_spec(&self.model);
        if let Some(base_url) = &self.base_url {
            provider = provider.with_base_url(base_url.clone());
        }
        provider.timeout = Duration::from_secs(self.provider_timeout_secs);
        provider.native_tools = self.native_tools;

        let mut limits = ResourceLimits::default()
            .with_timeout(Duration::from_secs_f64(self.timeout_secs.max(0.1)))
            .with_network(self.allow_network);
        if let Some(memory_mb) = self.memory_mb {
            limits.memory_bytes = memory_mb * 1024 * 1024;
        }
        if let Some(cpus) = self.cpus {
            limits.cpu_cores = cpus;
        }

        let mut settings = Settings {
            provider,
            backend: self.sandbox,
            ..Settings::default()
        }
        .with_limits(limits);

        settings.agent.budget = Budget {
            max_turns: self.max_turns,
            max_duration: self.max_seconds.map(Duration::from_secs),
        };
        settings.agent.reflect = self.reflect;
        settings.agent.execute_code = self.execute_code;
        settings.agent.provider_timeout = Duration::from_secs(self.provider_timeout_secs);

        if let Some(image) = &self.image {
            settings.docker = settings.docker.with_image(image.clone());
        }
        if let Some(root) = &self.sandbox_root {
            settings.process.root = root.clone();
        }
        settings.process.use_cgroups = self.cgroups;
        settings.process.confine = !self.no_confine;
        settings
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = sandagent::tracing::init_tracing("sandagent", cli.otlp_endpoint.as_deref()) {
        eprintln!("warning: failed to initialize tracing: {}", e);
    }
    metrics::init();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "sandagent failed before the session started");
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    };

    if cli.print_metrics {
        eprintln!("{}", metrics::gather_text());
    }
    sandagent::tracing::shutdown_tracing();
    code
}

async fn run(cli: &Cli) -> Result<ExitCode, BoxError> {
    let prompt = match &cli.prompt {
        Some(prompt) => prompt.clone(),
        None => read_prompt()?,
    };
    if prompt.trim().is_empty() {
        return Err("the prompt is empty".into());
    }

    let settings = cli.settings();
    let sandbox: Arc<dyn SandboxManager> = if settings.agent.execute_code {
        settings.select_sandbox().await?
    } else {
        // Never acquired
        Arc::new(ProcessSandbox::new(settings.process.clone()))
    };
    let controller = settings.build_controller(sandbox)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            on_interrupt.cancel();
        }
    });

    let run = controller.run_with_cancel(&prompt, cancel).await;
    println!("{}", run.answer);

    match &run.outcome {
        Outcome::Success => {}
        Outcome::BudgetExhausted(exhaustion) => {
            eprintln!("note: {} after {} turns; the answer is partial", exhaustion, run.turns_used)
        }
        Outcome::Fatal(e) => eprintln!("error ({}): {}", e.boundary(), e),
    }

    if cli.save_session {
        let store = match &cli.session_dir {
            Some(dir) => SessionStore::new(dir)?,
            None => SessionStore::default_store()?,
        };
        let path = store.save(&SessionRecord::from_run(&run, &prompt, &cli.model))?;
        info!(path = %path.display(), "Session saved");
    }

    Ok(ExitCode::from(run.exit_code()))
}

/// Read the task from stdin, asking for it on a terminal
fn read_prompt() -> std::io::Result<String> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Enter your prompt: ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        stdin.read_line(&mut line)?;
        Ok(line.trim().to_string())
    } else {
        let mut text = String::new();
        stdin.lock().read_to_string(&mut text)?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["sandagent", "--prompt", "hi"]);
        let settings = cli.settings();
        assert_eq!(settings.agent.budget.max_turns, 10);
        assert!(settings.agent.execute_code);
        assert!(!settings.agent.reflect);
        assert!(settings.agent.limits.network_disabled);
        assert_eq!(settings.backend, SandboxBackend::Auto);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "sandagent",
            "-p",
            "hi",
            "--model",
            "ollama/qwen3",
            "--max-callbacks",
            "3",
            "--execute-code",
            "false",
            "--reflect",
            "--sandbox",
            "process",
            "--memory-mb",
            "256",
        ]);
        let settings = cli.settings();
        assert_eq!(settings.provider.model, "qwen3");
        assert_eq!(settings.agent.budget.max_turns, 3);
        assert!(!settings.agent.execute_code);
        assert!(settings.agent.reflect);
        assert_eq!(settings.backend, SandboxBackend::Process);
        assert_eq!(settings.process.limits.memory_bytes, 256 * 1024 * 1024);
        assert!(settings.process.confine);

        let cli = Cli::parse_from(["sandagent", "-p", "hi", "--no-confine"]);
        assert!(!cli.settings().process.confine);
    }
}
