//! Vesper
//!
//! Runs a project of configured handlers and schedules.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use vesper::Runtime;
use vesper::compiler::ScriptCompiler;
use vesper::project::ProjectWatcher;

/// Configuration-driven script dispatch and scheduling
#[derive(Parser, Debug)]
#[command(name = "vesper")]
#[command(about = "Configuration-driven script dispatch and scheduling", long_about = None)]
struct Args {
    /// Path to the project directory
    #[arg(short, long, default_value = "./project", global = true)]
    project: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start schedules and watch the project until interrupted
    Run {
        /// Don't start the file watcher
        #[arg(long)]
        no_watch: bool,
    },
    /// Invoke a dispatcher once
    Fire {
        /// Dispatcher id
        dispatcher: String,

        /// JSON payload exposed to scripts as `&event`
        #[arg(long)]
        event: Option<String>,
    },
    /// Load the project and report anything that failed to compile
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vesper=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting Vesper v{}", env!("CARGO_PKG_VERSION"));

    let runtime = Runtime::open(&args.project)
        .await
        .with_context(|| format!("failed to load project from {}", args.project.display()))?;

    match args.command.unwrap_or(Command::Run { no_watch: false }) {
        Command::Run { no_watch } => run(Arc::new(runtime), no_watch).await,
        Command::Fire { dispatcher, event } => fire(&runtime, &dispatcher, event.as_deref()).await,
        Command::Check => Ok(check(&runtime)),
    }
}

async fn run(runtime: Arc<Runtime>, no_watch: bool) -> Result<ExitCode> {
    runtime.start();

    if !no_watch {
        match ProjectWatcher::new(Arc::clone(&runtime)) {
            Ok(watcher) => {
                tokio::spawn(watcher.run());
                info!("File watcher started");
            }
            Err(e) => {
                error!("Failed to start file watcher: {}", e);
            }
        }
    }

    info!(
        dispatchers = runtime.dispatchers().len(),
        handlers = runtime.handlers().registry().len(),
        schedules = runtime.schedules().registry().len(),
        "Running, press Ctrl+C to stop"
    );
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;

    info!("Shutting down");
    runtime.shutdown();
    Ok(ExitCode::SUCCESS)
}

async fn fire(runtime: &Runtime, dispatcher: &str, event: Option<&str>) -> Result<ExitCode> {
    let event = match event {
        Some(raw) => serde_json::from_str(raw).context("--event is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    match runtime.fire_event(dispatcher, event).await {
        Ok(count) => {
            info!(dispatcher, handlers = count, "Dispatch complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn check(runtime: &Runtime) -> ExitCode {
    let mut failures = 0;

    for handler in runtime.handlers().registry().list() {
        if handler.compiled().is_none() {
            warn!(handler = handler.id(), "Handler has no compiled script");
            failures += 1;
        }
        let bound = handler.dispatchers().len();
        if bound < handler.binding().len() {
            warn!(handler = handler.id(), "Handler is bound to fewer dispatchers than configured");
        }
    }
    for dispatcher in runtime.dispatchers().list() {
        if dispatcher.compiled().is_none() {
            warn!(dispatcher = dispatcher.id(), "Dispatcher has no compiled script");
            failures += 1;
        }
    }
    for task in runtime.schedules().registry().list() {
        if task.compiled().is_none() {
            warn!(schedule = task.id(), "Schedule has no compiled script");
            failures += 1;
        }
    }

    if failures == 0 {
        info!("Project OK");
        ExitCode::SUCCESS
    } else {
        error!(failures, "Project has scripts that failed to compile");
        ExitCode::FAILURE
    }
}
