//! Startup and shutdown of the Kira agent service.
//!
//! Order: configuration, checkpointer (local store plus optional replica),
//! conversation graph, HTTP server. On shutdown the checkpointer is closed
//! after the server has drained.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use crate::agent::{ConversationGraph, OpenRouterChatModel, TurnExecutor};
use crate::checkpoint::{ReplicationStatus, SyncedCheckpointer};
use crate::config::{AppConfig, Environment};
use crate::server::{self, AppState};

/// Run the server (used by the `kira-agent` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting Kira Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(serve(config)) {
        tracing::error!("Server error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Build the checkpointer and shared state from `config`.
///
/// # Errors
/// Returns an error if the local store cannot be opened or the model client
/// cannot be built.
pub async fn initialize(config: &AppConfig) -> anyhow::Result<Arc<AppState>> {
    tracing::info!(environment = %config.environment, "Initializing checkpointer");

    let checkpointer = Arc::new(
        SyncedCheckpointer::new(config.checkpointer.clone())
            .await
            .context("failed to prepare checkpoint storage")?,
    );
    match checkpointer.replication_status() {
        ReplicationStatus::Configured => {
            tracing::info!(
                interval_secs = config.checkpointer.sync_interval.as_secs(),
                "Cloud sync enabled"
            );
        }
        _ if config.environment == Environment::Prod => {
            tracing::warn!("Running in prod without cloud sync; checkpoints stay on local disk");
        }
        _ => tracing::info!("Using local checkpoint storage only"),
    }

    let store = checkpointer
        .get_checkpointer()
        .await
        .context("failed to open checkpoint store")?;

    let model = OpenRouterChatModel::new(&config.model).context("failed to build model client")?;
    tracing::info!(model = %config.model.model, "Model client ready");

    let graph = ConversationGraph::new(store, TurnExecutor::new(Arc::new(model)));
    Ok(AppState::new(graph, checkpointer, config.agent_path.clone()))
}

/// Serve until a shutdown signal arrives, then release persistence.
///
/// # Errors
/// Returns an error if initialization or serving fails. Once the server
/// has started, the checkpointer is closed whether serving succeeded or not.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let state = initialize(&config).await?;
    let checkpointer = Arc::clone(&state.checkpointer);

    tracing::info!(path = %config.agent_path, "Agent endpoint registered");
    let served = server::run_server_with_shutdown(
        state,
        &config.allowed_origins,
        config.port,
        shutdown_signal(),
    )
    .await
    .context("http server failed");

    tracing::info!("Shutting down checkpointer");
    checkpointer.close().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
