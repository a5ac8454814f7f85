//! jobstream CLI and REST API entry point.
//!
//! Binary name: `jobstream`
//!
//! Parses CLI arguments, initializes tracing, the database, and the dispatcher,
//! then dispatches to the appropriate command handler or starts the REST API
//! server alongside the worker runtime.

mod cli;
mod http;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use jobstream_observe::{TracingOptions, directive_for_verbosity, init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        default_directive: directive_for_verbosity(cli.verbose).to_string(),
        json: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await?;
        }

        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, cli.json).await?;
        }

        Commands::Ingest {
            provider,
            event_type,
            payload,
        } => {
            cli::execution::handle_ingest(
                provider,
                event_type,
                payload.as_deref(),
                &state,
                cli.json,
            )
            .await?;
        }

        Commands::Serve { port, host } => serve(state, &host, port).await?,
    }

    Ok(())
}

async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let report = state.runtime.startup().await?;
    if let Some(report) = &report {
        tracing::info!(started = ?report.started, "worker runtime started");
        if report.is_degraded() {
            tracing::warn!(degraded = ?report.degraded, "running without optional providers");
        }
    }

    let recovered = state.dispatcher.recover_orphaned().await?;
    if recovered > 0 {
        tracing::info!(recovered, "marked orphaned executions as failed");
    }

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "  {} jobstream API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let runtime = state.runtime.clone();
    let router = http::router::build_router(state);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(report) = runtime.shutdown().await {
        tracing::info!(
            runtime_secs = report.runtime.as_secs(),
            failures = report.failures.len(),
            "worker runtime stopped"
        );
        for failure in &report.failures {
            tracing::warn!(%failure, "shutdown failure");
        }
    }

    served?;
    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
