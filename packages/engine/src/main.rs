// packages/engine/src/main.rs
//! fnrt engine binary
//!
//! `serve` runs the HTTP API, the scheduler and the worker pool. `worker` is
//! the child-process side of the process backend. `check` validates a source
//! file the same way registration does.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fnrt_engine::api::ApiServer;
use fnrt_engine::functions::Function;
use fnrt_engine::observability::{init_metrics, init_tracing};
use fnrt_engine::runtime::run_worker;
use fnrt_engine::script::validate_and_instrument;
use fnrt_engine::security::PatternGate;
use fnrt_engine::triggers::{Manifest, Scheduler};
use fnrt_engine::{BuildInfo, EngineConfig, FunctionRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "fnrt-engine", version, about = "Function execution runtime")]
struct Cli {
    /// Configuration file (TOML or YAML); `FNRT__*` variables override it
    #[arg(long, global = true, env = "FNRT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the API server, scheduler and worker pool
    Serve,

    /// Serve the worker protocol on stdin/stdout
    Worker {
        #[arg(long)]
        worker_id: String,
    },

    /// Validate and instrument a function source file
    Check {
        file: PathBuf,

        #[arg(long, default_value = "local")]
        namespace: String,

        /// Defaults to the file stem
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        trusted: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Worker { worker_id } => {
            // stdout carries the worker protocol
            init_tracing(&config.observability, true)?;
            run_worker(&worker_id, &config.execution).await?;
            Ok(())
        }
        Command::Check {
            file,
            namespace,
            name,
            trusted,
        } => check(&file, namespace, name, trusted),
    }
}

async fn serve(config: EngineConfig) -> Result<()> {
    init_tracing(&config.observability, false)?;
    let metrics = init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        "Starting fnrt engine"
    );

    let runtime = Arc::new(FunctionRuntime::from_config(&config)?);
    let scheduler = Arc::new(Scheduler::new(runtime.clone()));
    let gate = Arc::new(PatternGate::from_config(&config.permissions)?);

    if let Some(path) = &config.manifest {
        let manifest = Manifest::load(path)
            .with_context(|| format!("loading manifest {}", path.display()))?;
        manifest.apply(runtime.registry(), &scheduler)?;
    }

    runtime.start().await?;

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.child_token()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let server = ApiServer::new(
        runtime.clone(),
        scheduler,
        gate,
        metrics,
        config.server.max_body_bytes,
    );
    let server_token = shutdown.child_token();
    let server_task = tokio::spawn(async move { server.run(listener, server_token).await });

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing CTRL+C handler")?;
            info!("Received shutdown signal, cleaning up...");
            Ok(())
        }
        result = server_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!(e)),
            Err(e) => Err(anyhow!("server task panicked: {}", e)),
        },
    };

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!("scheduler task failed: {}", e);
    }
    runtime.shutdown().await;

    match &served {
        Ok(()) => info!("Engine stopped gracefully"),
        Err(e) => error!("Server error: {}", e),
    }
    served
}

fn check(file: &Path, namespace: String, name: Option<String>, trusted: bool) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let name = match name {
        Some(name) => name,
        None => file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cannot derive a function name from {}", file.display()))?,
    };

    let mut function = Function::new(namespace, name, code);
    if trusted {
        function = function.trusted();
    }

    let instrumented = validate_and_instrument(function)?;
    println!("function:     {}", instrumented.function_ref);
    println!("entry:        {} ({} params)", instrumented.entry, instrumented.entry_params());
    println!("functions:    {}", instrumented.module.function_names().join(", "));
    if !instrumented.imports.is_empty() {
        println!("imports:      {}", instrumented.imports.join(", "));
    }
    if !instrumented.requirements.is_empty() {
        println!("requirements: {}", instrumented.requirements.join(", "));
    }
    if !instrumented.remote_calls.is_empty() {
        let calls: Vec<String> = instrumented
            .remote_calls
            .iter()
            .map(|r| r.to_string())
            .collect();
        println!("remote calls: {}", calls.join(", "));
    }
    Ok(())
}
