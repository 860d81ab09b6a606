//! Checkpointer facade: one local store, one optional remote replica, one
//! lifecycle.
//!
//! Local failures are fatal to the caller; replication failures are logged
//! and contained. `close` releases everything in a fixed order:
//! 1. final sync to the remote,
//! 2. local store handle,
//! 3. replication worker and remote client.
//!
//! Every step runs even when an earlier one fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::checkpoint::errors::{CheckpointError, CheckpointResult};
use crate::checkpoint::replica::{
    HttpConnector, RemoteSettings, ReplicaConnector, Replication, ReplicationStatus, SyncReport,
};
use crate::checkpoint::store::SqliteCheckpointStore;

/// Default interval between automatic replica pushes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default local database path.
pub const DEFAULT_DB_PATH: &str = "data/checkpoints.db";

/// Construction parameters for [`SyncedCheckpointer`].
#[derive(Clone, Debug)]
pub struct CheckpointerConfig {
    /// Local `SQLite` file.
    pub local_path: PathBuf,
    /// Remote replica; `None` means local-only.
    pub remote: Option<RemoteSettings>,
    /// Replica push cadence; zero disables the background worker.
    pub sync_interval: Duration,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self::local(DEFAULT_DB_PATH)
    }
}

impl CheckpointerConfig {
    /// Local-only configuration.
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: path.into(),
            remote: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Enable replication when both URL and token are present.
    #[must_use]
    pub fn with_remote(mut self, url: Option<String>, auth_token: Option<String>) -> Self {
        self.remote = match (url, auth_token) {
            (Some(url), Some(auth_token)) => Some(RemoteSettings { url, auth_token }),
            _ => None,
        };
        self
    }

    /// Set the replica push cadence.
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

enum Lifecycle {
    Idle,
    Acquired(Arc<SqliteCheckpointStore>),
    Closed,
}

/// Persistence backend for the conversation graph.
pub struct SyncedCheckpointer {
    local_path: PathBuf,
    replication: Replication,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncedCheckpointer {
    /// Build the facade, connecting to the remote replica when configured.
    ///
    /// # Errors
    /// Returns an error only if the local database directory cannot be
    /// created. Remote problems degrade to local-only mode.
    pub async fn new(config: CheckpointerConfig) -> CheckpointResult<Self> {
        Self::with_connector(config, &HttpConnector).await
    }

    /// Build the facade with a custom remote connector.
    ///
    /// # Errors
    /// Returns an error only if the local database directory cannot be created.
    pub async fn with_connector(
        config: CheckpointerConfig,
        connector: &dyn ReplicaConnector,
    ) -> CheckpointResult<Self> {
        if let Some(parent) = config.local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let replication = Replication::establish(
            &config.local_path,
            config.remote.as_ref(),
            config.sync_interval,
            connector,
        )
        .await;

        Ok(Self {
            local_path: config.local_path,
            replication,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Local database path.
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Current replication state.
    #[must_use]
    pub fn replication_status(&self) -> ReplicationStatus {
        self.replication.status()
    }

    /// Open the local store and return it.
    ///
    /// Only one handle is ever opened: later calls return the same store.
    ///
    /// # Errors
    /// Returns [`CheckpointError::Closed`] after [`Self::close`], or the
    /// underlying error if the file cannot be opened or initialized.
    pub async fn get_checkpointer(&self) -> CheckpointResult<Arc<SqliteCheckpointStore>> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Closed => return Err(CheckpointError::Closed),
            Lifecycle::Acquired(store) => {
                debug!("Checkpoint store already open; reusing handle");
                return Ok(Arc::clone(store));
            }
            Lifecycle::Idle => {}
        }

        let store = Arc::new(SqliteCheckpointStore::open(&self.local_path).await?);
        *lifecycle = Lifecycle::Acquired(Arc::clone(&store));
        info!(path = %self.local_path.display(), "Checkpointer initialized");
        Ok(store)
    }

    /// Push local writes to the remote now.
    ///
    /// Returns `None` in local-only mode or when the sync failed; failures
    /// are logged and never propagate.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        match &self.replication {
            Replication::Absent => {
                info!("No cloud sync configured (local-only mode)");
                None
            }
            Replication::Active(active) => {
                info!("Manually syncing to remote replica");
                match active.sync().await {
                    Ok(report) => {
                        info!(pushed = report.pushed, "Sync completed");
                        Some(report)
                    }
                    Err(err) => {
                        warn!(%err, "Manual sync failed");
                        None
                    }
                }
            }
        }
    }

    /// Release every resource. Later [`Self::get_checkpointer`] calls fail.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Closed) {
            debug!("Checkpointer already closed");
            return;
        }
        info!("Closing checkpointer resources");

        if let Replication::Active(active) = &self.replication {
            match active.sync().await {
                Ok(report) => info!(pushed = report.pushed, "Final sync completed"),
                Err(err) => warn!(%err, "Final sync failed"),
            }
        }

        if let Lifecycle::Acquired(store) = std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            match store.close().await {
                Ok(()) => info!("Local checkpoint store closed"),
                Err(err) => warn!(%err, "Failed to close local checkpoint store"),
            }
        }

        if let Replication::Active(active) = &self.replication {
            match active.close().await {
                Ok(()) => info!("Remote replica closed"),
                Err(err) => warn!(%err, "Failed to close remote replica"),
            }
        }

        info!("Checkpointer resources cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::checkpoint::replica::fakes::{FakeConnector, settings};
    use crate::checkpoint::store::CheckpointStore;
    use crate::checkpoint::types::{
        ChatMessage, CheckpointMetadata, CheckpointSource, ConversationState, ThreadId,
    };

    fn remote_config(path: PathBuf) -> CheckpointerConfig {
        let remote = settings();
        CheckpointerConfig::local(path)
            .with_remote(Some(remote.url), Some(remote.auth_token))
            .with_sync_interval(Duration::ZERO)
    }

    async fn write(store: &SqliteCheckpointStore, thread: &str, texts: &[&str]) {
        let mut state = ConversationState::default();
        state.merge(texts.iter().map(|text| ChatMessage::user(*text)));
        let metadata = CheckpointMetadata {
            source: CheckpointSource::Loop,
            step: 1,
        };
        store.put(ThreadId::from(thread), metadata, state).await.unwrap();
    }

    #[test]
    fn test_remote_requires_url_and_token() {
        let config = CheckpointerConfig::default().with_remote(Some("libsql://x".into()), None);
        assert!(config.remote.is_none());
        assert_eq!(config.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(config.local_path, PathBuf::from(DEFAULT_DB_PATH));
    }

    #[tokio::test]
    async fn test_local_only_sync_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = SyncedCheckpointer::new(CheckpointerConfig::local(dir.path().join("cp.db")))
            .await
            .unwrap();

        assert_eq!(checkpointer.replication_status(), ReplicationStatus::Absent);
        assert!(checkpointer.sync_now().await.is_none());
        checkpointer.close().await;
    }

    #[tokio::test]
    async fn test_construction_creates_directory_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("cp.db");

        for _ in 0..2 {
            let checkpointer = SyncedCheckpointer::new(CheckpointerConfig::local(&path))
                .await
                .unwrap();
            let store = checkpointer.get_checkpointer().await.unwrap();
            write(&store, "abc", &["hi"]).await;
            checkpointer.close().await;
        }

        assert!(path.parent().unwrap().is_dir());
        let checkpointer = SyncedCheckpointer::new(CheckpointerConfig::local(&path))
            .await
            .unwrap();
        let store = checkpointer.get_checkpointer().await.unwrap();
        assert_eq!(store.list(ThreadId::from("abc"), 10).await.unwrap().len(), 2);
        checkpointer.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_remote_falls_back_to_local_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointerConfig::local(dir.path().join("cp.db"))
            .with_remote(Some("http://127.0.0.1:9".into()), Some("token".into()));
        let checkpointer = SyncedCheckpointer::new(config).await.unwrap();

        assert_eq!(checkpointer.replication_status(), ReplicationStatus::Absent);
        let store = checkpointer.get_checkpointer().await.unwrap();
        write(&store, "abc", &["hello"]).await;
        assert!(checkpointer.sync_now().await.is_none());
        checkpointer.close().await;
    }

    #[tokio::test]
    async fn test_get_checkpointer_reuses_handle_and_rejects_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = SyncedCheckpointer::new(CheckpointerConfig::local(dir.path().join("cp.db")))
            .await
            .unwrap();

        let first = checkpointer.get_checkpointer().await.unwrap();
        let second = checkpointer.get_checkpointer().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        checkpointer.close().await;
        assert!(matches!(
            checkpointer.get_checkpointer().await,
            Err(CheckpointError::Closed)
        ));
        // Closing twice is harmless.
        checkpointer.close().await;
    }

    #[tokio::test]
    async fn test_close_runs_every_step_when_final_sync_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (connector, remote) = FakeConnector::working();
        let checkpointer =
            SyncedCheckpointer::with_connector(remote_config(dir.path().join("cp.db")), &connector)
                .await
                .unwrap();
        let store = checkpointer.get_checkpointer().await.unwrap();
        write(&store, "abc", &["hello"]).await;

        remote.fail_push.store(true, Ordering::SeqCst);
        checkpointer.close().await;

        assert!(remote.attempts.load(Ordering::SeqCst) >= 1);
        assert!(store.is_closed());
        assert!(store.latest(ThreadId::from("abc")).await.unwrap_err().is_closed());
        assert!(remote.closed.load(Ordering::SeqCst));
        assert_eq!(checkpointer.replication_status(), ReplicationStatus::Closed);
    }

    #[tokio::test]
    async fn test_history_survives_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("test.db");

        let checkpointer = SyncedCheckpointer::new(CheckpointerConfig::local(&path))
            .await
            .unwrap();
        let store = checkpointer.get_checkpointer().await.unwrap();
        write(&store, "abc", &["hello"]).await;
        checkpointer.close().await;

        let reopened = SqliteCheckpointStore::open(&path).await.unwrap();
        let latest = reopened.latest(ThreadId::from("abc")).await.unwrap().unwrap();
        let texts: Vec<_> = latest.state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_explicit_and_final_sync_both_reach_remote() {
        let dir = tempfile::tempdir().unwrap();
        let (connector, remote) = FakeConnector::working();
        let checkpointer =
            SyncedCheckpointer::with_connector(remote_config(dir.path().join("cp.db")), &connector)
                .await
                .unwrap();
        assert_eq!(checkpointer.replication_status(), ReplicationStatus::Configured);

        let store = checkpointer.get_checkpointer().await.unwrap();
        write(&store, "abc", &["hello"]).await;
        write(&store, "abc", &["hello", "again"]).await;

        let report = checkpointer.sync_now().await.unwrap();
        assert_eq!(report.pushed, 2);
        checkpointer.close().await;

        assert!(remote.attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(remote.rows.lock().unwrap().len(), 2);
    }
}
