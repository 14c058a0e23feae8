mod demo;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_core::config::AppConfig;
use waypoint_core::event::EventBus;
use waypoint_core::types::{Execution, ExecutionId, LogFragment, LogKind, RunStatus};

use waypoint_agent::{Engine, FragmentSink, RunLogger, Walker};

use demo::Demo;

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Graph execution engine for multi-step agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in agent on the async engine
    Run {
        #[arg(value_enum, default_value_t = Demo::Counter)]
        demo: Demo,
        /// Execution ID (auto-generated if not provided)
        #[arg(long)]
        id: Option<String>,
        /// Integer input for the agent's initial state
        #[arg(long)]
        input: Option<i64>,
    },
    /// Walk a built-in agent synchronously, without retries
    Walk {
        #[arg(value_enum, default_value_t = Demo::Counter)]
        demo: Demo,
        #[arg(long)]
        input: Option<i64>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "waypoint", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Walk { demo, input } => {
            let definition = demo.definition(input);
            // The walker blocks; keep it off the async workers.
            let trace =
                tokio::task::spawn_blocking(move || Walker::new().trace(&definition)).await??;
            println!("path: {}", trace.path.join(" -> "));
            println!("{}", serde_json::to_string_pretty(&trace.output)?);
        }
        Commands::Run { demo, id, input } => {
            let execution = run_demo(&config, demo, id, input).await?;
            if execution.status == RunStatus::Failed {
                anyhow::bail!(execution
                    .error_message
                    .unwrap_or_else(|| "execution failed".to_string()));
            }
            if let Some(output) = &execution.output {
                println!("{}", serde_json::to_string_pretty(output)?);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_demo(
    config: &AppConfig,
    demo: Demo,
    id: Option<String>,
    input: Option<i64>,
) -> anyhow::Result<Execution> {
    let engine = Engine::new(
        config.clone(),
        Arc::new(EventBus::new(config.engine.bus_capacity)),
    );
    let id = id.map(ExecutionId::from).unwrap_or_else(ExecutionId::generate);
    let definition = demo.definition(input);
    let agent = definition.name().to_string();
    engine.create(id.clone(), definition)?;

    let cancel = CancellationToken::new();
    let logger = config
        .log
        .as_ref()
        .filter(|log| log.enabled)
        .map(|log| {
            RunLogger::new(log.dir(), log.level).spawn(engine.bus(), id.clone(), cancel.clone())
        });

    let mut state_rx = engine.subscribe_state(&id);
    let printer = tokio::spawn(async move {
        let mut reported = 0;
        while let Ok(snapshot) = state_rx.recv().await {
            for step in snapshot.steps.iter().skip(reported) {
                if !step.status.is_terminal() {
                    break;
                }
                eprintln!(
                    "[{}] {} ({}, {} attempt(s))",
                    reported + 1,
                    step.node,
                    step.status,
                    step.attempts
                );
                reported += 1;
            }
            if snapshot.is_finished() {
                break;
            }
        }
    });

    let sink: FragmentSink = Arc::new(|fragment: &LogFragment| match fragment.kind {
        LogKind::Output => {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(fragment.text.as_bytes());
            let _ = stdout.flush();
        }
        LogKind::Retry => eprintln!("retrying: {}", fragment.text),
        _ => {}
    });

    engine.start_with_sink(&id, sink)?;
    info!(execution_id = %id, agent = %agent, "Execution started");

    let execution = tokio::select! {
        result = engine.wait(&id) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling execution");
            engine.shutdown();
            engine.wait(&id).await?
        }
    };

    printer.await.ok();
    if let Some(handle) = logger {
        match handle.await {
            Ok(Some(path)) => info!(path = %path.display(), "Run log written"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Run logger task failed"),
        }
    }
    cancel.cancel();

    eprintln!("{} {} after {} step(s)", execution.id, execution.status, execution.steps.len());
    Ok(execution)
}
