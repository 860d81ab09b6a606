//! Remote replication of the local checkpoint file.
//!
//! The local `SQLite` file stays the source of truth. When remote settings
//! are present, a [`Replication::Active`] session owns:
//! - its own connection to the local file, used only to read unsynced rows,
//! - a [`RemoteReplica`] client (libSQL HTTP pipeline by default),
//! - a background worker pushing on a fixed cadence.
//!
//! Missing settings or a failed connection yield [`Replication::Absent`],
//! on which every operation is a no-op.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};
use url::Url;

use crate::checkpoint::errors::{CheckpointError, CheckpointResult};
use crate::checkpoint::store::{
    CheckpointRow, StoreFuture, ensure_schema, load_unsynced, mark_synced,
};

/// Rows pushed per remote round trip.
const SYNC_BATCH: usize = 128;

/// HTTP connect timeout for the remote replica.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// HTTP request timeout for the remote replica.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const REMOTE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    source TEXT NOT NULL,
    step INTEGER NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (thread_id, seq)
)";

const REMOTE_INSERT: &str = "INSERT OR IGNORE INTO checkpoints
    (thread_id, seq, created_at, source, step, state)
    VALUES (?, ?, ?, ?, ?, ?)";

/// Remote endpoint and credential.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    /// Remote database URL (`libsql://`, `https://` or `http://`).
    pub url: String,
    /// Bearer token.
    pub auth_token: String,
}

impl std::fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("url", &self.url)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

/// Remote store receiving checkpoint rows.
pub trait RemoteReplica: Send + Sync {
    /// Push rows to the remote store. Called once per sync event, possibly
    /// with an empty batch. Pushing the same row twice must be harmless.
    ///
    /// # Errors
    /// Returns an error if the remote rejects or cannot receive the rows.
    fn push(&self, rows: Vec<CheckpointRow>) -> StoreFuture<'_, CheckpointResult<()>>;
    /// Release the remote client.
    ///
    /// # Errors
    /// Returns an error if the client fails to shut down.
    fn close(&self) -> StoreFuture<'_, CheckpointResult<()>>;
}

/// Factory establishing a [`RemoteReplica`] from settings.
pub trait ReplicaConnector: Send + Sync {
    /// Connect to the remote store.
    ///
    /// # Errors
    /// Returns an error if the remote is unreachable or rejects the credential.
    fn connect<'a>(
        &'a self,
        settings: &'a RemoteSettings,
    ) -> StoreFuture<'a, CheckpointResult<Arc<dyn RemoteReplica>>>;
}

/// Connector for libSQL servers speaking the HTTP pipeline protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpConnector;

impl ReplicaConnector for HttpConnector {
    fn connect<'a>(
        &'a self,
        settings: &'a RemoteSettings,
    ) -> StoreFuture<'a, CheckpointResult<Arc<dyn RemoteReplica>>> {
        Box::pin(async move {
            let replica = HttpReplica::connect(settings).await?;
            Ok(Arc::new(replica) as Arc<dyn RemoteReplica>)
        })
    }
}

/// Rewrite `libsql://` URLs to the HTTPS endpoint serving the pipeline API.
///
/// # Errors
/// Returns an error if the URL cannot be parsed.
pub fn pipeline_url(raw: &str) -> CheckpointResult<Url> {
    let raw = raw.trim();
    let normalized = raw
        .strip_prefix("libsql://")
        .map_or_else(|| raw.to_string(), |rest| format!("https://{rest}"));
    let base = Url::parse(&normalized)?;
    match base.scheme() {
        "http" | "https" => Ok(base.join("v2/pipeline")?),
        other => Err(CheckpointError::InvalidConfig(format!(
            "unsupported replica scheme: {other}"
        ))),
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PipelineValue {
    Integer { value: String },
    Text { value: String },
}

impl PipelineValue {
    fn integer(value: i64) -> Self {
        Self::Integer {
            value: value.to_string(),
        }
    }

    fn text(value: String) -> Self {
        Self::Text { value }
    }
}

#[derive(Deserialize)]
struct PipelineResponse {
    #[serde(default)]
    results: Vec<PipelineResult>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PipelineResult {
    Ok,
    Error { error: PipelineError },
}

#[derive(Deserialize)]
struct PipelineError {
    message: String,
}

/// Remote replica over the libSQL HTTP pipeline API.
pub struct HttpReplica {
    client: Client,
    endpoint: Url,
    auth_token: String,
    closed: AtomicBool,
}

impl HttpReplica {
    /// Connect and create the remote schema if needed.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the handshake fails.
    pub async fn connect(settings: &RemoteSettings) -> CheckpointResult<Self> {
        let endpoint = pipeline_url(&settings.url)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let replica = Self {
            client,
            endpoint,
            auth_token: settings.auth_token.clone(),
            closed: AtomicBool::new(false),
        };
        replica
            .execute(vec![json!({
                "type": "execute",
                "stmt": { "sql": REMOTE_SCHEMA }
            })])
            .await?;
        Ok(replica)
    }

    async fn execute(&self, mut requests: Vec<serde_json::Value>) -> CheckpointResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckpointError::Closed);
        }
        requests.push(json!({ "type": "close" }));
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.auth_token)
            .json(&json!({ "baton": null, "requests": requests }))
            .send()
            .await?
            .error_for_status()?;
        let body: PipelineResponse = response.json().await?;
        for result in body.results {
            if let PipelineResult::Error { error } = result {
                return Err(CheckpointError::Remote(error.message));
            }
        }
        Ok(())
    }
}

impl RemoteReplica for HttpReplica {
    fn push(&self, rows: Vec<CheckpointRow>) -> StoreFuture<'_, CheckpointResult<()>> {
        Box::pin(async move {
            if rows.is_empty() {
                return Ok(());
            }
            let requests = rows
                .into_iter()
                .map(|row| {
                    let args = vec![
                        PipelineValue::text(row.thread_id),
                        PipelineValue::integer(row.seq),
                        PipelineValue::integer(row.created_at),
                        PipelineValue::text(row.source),
                        PipelineValue::integer(row.step),
                        PipelineValue::text(row.state),
                    ];
                    json!({
                        "type": "execute",
                        "stmt": { "sql": REMOTE_INSERT, "args": args }
                    })
                })
                .collect();
            self.execute(requests).await
        })
    }

    fn close(&self) -> StoreFuture<'_, CheckpointResult<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}

/// Externally observable replication state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    /// No remote configured, or connecting failed.
    Absent,
    /// Connected; syncing on cadence and on demand.
    Configured,
    /// Shut down.
    Closed,
}

/// Outcome of one sync event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Rows pushed to the remote.
    pub pushed: usize,
}

struct SyncWorker {
    remote: Arc<dyn RemoteReplica>,
    local: Connection,
    remote_key: String,
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl SyncWorker {
    async fn sync(&self) -> CheckpointResult<SyncReport> {
        let _guard = self.lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckpointError::Closed);
        }

        let mut report = SyncReport::default();
        loop {
            let rows = load_unsynced(&self.local, &self.remote_key, SYNC_BATCH).await?;
            let count = rows.len();
            let last_id = rows.last().map(|row| row.id);
            self.remote.push(rows).await?;
            if let Some(last_id) = last_id {
                mark_synced(&self.local, &self.remote_key, last_id).await?;
            }
            report.pushed += count;
            if count < SYNC_BATCH {
                break;
            }
        }
        Ok(report)
    }
}

/// A live replication session.
pub struct ActiveReplication {
    worker: Arc<SyncWorker>,
    cadence: Duration,
    shutdown: Arc<Notify>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ActiveReplication {
    async fn start(
        local_path: &Path,
        settings: &RemoteSettings,
        cadence: Duration,
        connector: &dyn ReplicaConnector,
    ) -> CheckpointResult<Self> {
        let local = Connection::open(local_path).await?;
        ensure_schema(&local).await?;
        let remote = connector.connect(settings).await?;

        let worker = Arc::new(SyncWorker {
            remote,
            local,
            remote_key: settings.url.clone(),
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        let shutdown = Arc::new(Notify::new());
        let task = (!cadence.is_zero())
            .then(|| spawn_periodic_sync(Arc::clone(&worker), cadence, Arc::clone(&shutdown)));

        Ok(Self {
            worker,
            cadence,
            shutdown,
            task: StdMutex::new(task),
        })
    }

    /// Sync cadence; zero means explicit syncs only.
    #[must_use]
    pub const fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Push every unsynced local row now.
    ///
    /// # Errors
    /// Returns an error if reading local rows or pushing them fails, or if
    /// the session is closed.
    pub async fn sync(&self) -> CheckpointResult<SyncReport> {
        self.worker.sync().await
    }

    fn is_closed(&self) -> bool {
        self.worker.closed.load(Ordering::Acquire)
    }

    /// Stop the background worker and release the remote client and the
    /// local read connection. Every part is attempted; the first error is
    /// returned.
    ///
    /// # Errors
    /// Returns the first failure among the release steps.
    pub async fn close(&self) -> CheckpointResult<()> {
        {
            // Wait for an in-flight sync, then refuse new ones.
            let _guard = self.worker.lock.lock().await;
            if self.worker.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        let mut first_error = None;
        self.shutdown.notify_one();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, "Sync worker ended abnormally");
                first_error.get_or_insert(CheckpointError::Remote(format!(
                    "sync worker join failed: {err}"
                )));
            }
        }

        if let Err(err) = self.worker.remote.close().await {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.worker.local.clone().close().await {
            first_error.get_or_insert(err.into());
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn spawn_periodic_sync(
    worker: Arc<SyncWorker>,
    cadence: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?cadence, "Starting periodic replica sync");
        loop {
            tokio::select! {
                () = tokio::time::sleep(cadence) => {
                    match worker.sync().await {
                        Ok(report) if report.pushed > 0 => {
                            info!(pushed = report.pushed, "Periodic sync completed");
                        }
                        Ok(_) => debug!("Periodic sync completed with nothing to push"),
                        Err(CheckpointError::Closed) => break,
                        Err(err) => warn!(%err, "Periodic sync failed"),
                    }
                }
                () = shutdown.notified() => {
                    info!("Periodic replica sync shutting down");
                    break;
                }
            }
        }
    })
}

/// Replication session: either absent or active.
pub enum Replication {
    /// Local-only mode.
    Absent,
    /// Remote replica connected.
    Active(ActiveReplication),
}

impl Replication {
    /// Establish replication for `local_path`.
    ///
    /// Never fails: missing settings or any connection error yield
    /// [`Replication::Absent`].
    pub async fn establish(
        local_path: &Path,
        settings: Option<&RemoteSettings>,
        cadence: Duration,
        connector: &dyn ReplicaConnector,
    ) -> Self {
        let Some(settings) = settings else {
            debug!("No remote replica configured; running local-only");
            return Self::Absent;
        };

        info!(
            local = %local_path.display(),
            remote = %settings.url,
            ?cadence,
            "Initializing remote replica"
        );
        match ActiveReplication::start(local_path, settings, cadence, connector).await {
            Ok(active) => {
                info!("Remote replica sync enabled");
                Self::Active(active)
            }
            Err(err) => {
                warn!(%err, "Failed to initialize remote replica; continuing in local-only mode");
                Self::Absent
            }
        }
    }

    /// Current externally observable state.
    #[must_use]
    pub fn status(&self) -> ReplicationStatus {
        match self {
            Self::Absent => ReplicationStatus::Absent,
            Self::Active(active) if active.is_closed() => ReplicationStatus::Closed,
            Self::Active(_) => ReplicationStatus::Configured,
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// In-memory remote recording every push.
    #[derive(Default)]
    pub(crate) struct RecordingReplica {
        pub(crate) attempts: AtomicUsize,
        pub(crate) rows: StdMutex<Vec<CheckpointRow>>,
        pub(crate) fail_push: AtomicBool,
        pub(crate) closed: AtomicBool,
    }

    impl RemoteReplica for RecordingReplica {
        fn push(&self, rows: Vec<CheckpointRow>) -> StoreFuture<'_, CheckpointResult<()>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                if self.fail_push.load(Ordering::SeqCst) {
                    return Err(CheckpointError::Remote("injected failure".to_string()));
                }
                self.rows.lock().unwrap().extend(rows);
                Ok(())
            })
        }

        fn close(&self) -> StoreFuture<'_, CheckpointResult<()>> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    /// Connector handing out a shared [`RecordingReplica`], or failing.
    pub(crate) struct FakeConnector {
        pub(crate) replica: Option<Arc<RecordingReplica>>,
    }

    impl FakeConnector {
        pub(crate) fn working() -> (Self, Arc<RecordingReplica>) {
            let replica = Arc::new(RecordingReplica::default());
            (
                Self {
                    replica: Some(Arc::clone(&replica)),
                },
                replica,
            )
        }

        pub(crate) const fn unreachable() -> Self {
            Self { replica: None }
        }
    }

    impl ReplicaConnector for FakeConnector {
        fn connect<'a>(
            &'a self,
            _settings: &'a RemoteSettings,
        ) -> StoreFuture<'a, CheckpointResult<Arc<dyn RemoteReplica>>> {
            Box::pin(async move {
                match &self.replica {
                    Some(replica) => Ok(Arc::clone(replica) as Arc<dyn RemoteReplica>),
                    None => Err(CheckpointError::Remote("connection refused".to_string())),
                }
            })
        }
    }

    pub(crate) fn settings() -> RemoteSettings {
        RemoteSettings {
            url: "libsql://kira-test.turso.io".to_string(),
            auth_token: "token".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{FakeConnector, settings};
    use super::*;
    use crate::checkpoint::store::{CheckpointStore, SqliteCheckpointStore};
    use crate::checkpoint::types::{
        ChatMessage, CheckpointMetadata, CheckpointSource, ConversationState, ThreadId,
    };

    async fn write_checkpoint(store: &SqliteCheckpointStore, thread: &str) {
        let mut state = ConversationState::default();
        state.merge(vec![ChatMessage::user("hello")]);
        let metadata = CheckpointMetadata {
            source: CheckpointSource::Input,
            step: 0,
        };
        store.put(ThreadId::from(thread), metadata, state).await.unwrap();
    }

    #[test]
    fn test_pipeline_url_rewrites_libsql_scheme() {
        let url = pipeline_url("libsql://kira-db.turso.io").unwrap();
        assert_eq!(url.as_str(), "https://kira-db.turso.io/v2/pipeline");

        let url = pipeline_url("http://127.0.0.1:8080").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/v2/pipeline");

        assert!(pipeline_url("ftp://nope").is_err());
    }

    #[test]
    fn test_settings_debug_redacts_token() {
        let rendered = format!("{:?}", settings());
        assert!(!rendered.contains("\"token\""));
        assert!(rendered.contains("redacted"));
    }

    #[tokio::test]
    async fn test_absent_without_settings() {
        let dir = tempfile::tempdir().unwrap();
        let replication = Replication::establish(
            &dir.path().join("cp.db"),
            None,
            Duration::from_secs(60),
            &HttpConnector,
        )
        .await;
        assert_eq!(replication.status(), ReplicationStatus::Absent);
    }

    #[tokio::test]
    async fn test_connect_failure_falls_back_to_absent() {
        let dir = tempfile::tempdir().unwrap();
        let replication = Replication::establish(
            &dir.path().join("cp.db"),
            Some(&settings()),
            Duration::from_secs(60),
            &FakeConnector::unreachable(),
        )
        .await;
        assert_eq!(replication.status(), ReplicationStatus::Absent);
    }

    #[tokio::test]
    async fn test_http_replica_unreachable_endpoint_errors() {
        let unreachable = RemoteSettings {
            url: "http://127.0.0.1:9".to_string(),
            auth_token: "token".to_string(),
        };
        assert!(HttpReplica::connect(&unreachable).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_pushes_only_new_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        let store = SqliteCheckpointStore::open(&path).await.unwrap();
        let (connector, remote) = FakeConnector::working();
        let Replication::Active(active) =
            Replication::establish(&path, Some(&settings()), Duration::ZERO, &connector).await
        else {
            panic!("expected an active replica");
        };

        write_checkpoint(&store, "t1").await;
        write_checkpoint(&store, "t2").await;
        assert_eq!(active.sync().await.unwrap().pushed, 2);
        assert_eq!(active.sync().await.unwrap().pushed, 0);

        write_checkpoint(&store, "t1").await;
        assert_eq!(active.sync().await.unwrap().pushed, 1);

        assert_eq!(remote.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(remote.rows.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_push_is_retried_on_next_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        let store = SqliteCheckpointStore::open(&path).await.unwrap();
        let (connector, remote) = FakeConnector::working();
        let Replication::Active(active) =
            Replication::establish(&path, Some(&settings()), Duration::ZERO, &connector).await
        else {
            panic!("expected an active replica");
        };

        write_checkpoint(&store, "t1").await;
        remote.fail_push.store(true, Ordering::SeqCst);
        assert!(active.sync().await.is_err());

        remote.fail_push.store(false, Ordering::SeqCst);
        assert_eq!(active.sync().await.unwrap().pushed, 1);
    }

    #[tokio::test]
    async fn test_periodic_sync_runs_on_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        let store = SqliteCheckpointStore::open(&path).await.unwrap();
        write_checkpoint(&store, "t1").await;

        let (connector, remote) = FakeConnector::working();
        let replication = Replication::establish(
            &path,
            Some(&settings()),
            Duration::from_millis(20),
            &connector,
        )
        .await;

        let mut waited = Duration::ZERO;
        while remote.rows.lock().unwrap().is_empty() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert_eq!(remote.rows.lock().unwrap().len(), 1);

        let Replication::Active(active) = &replication else {
            panic!("expected an active replica");
        };
        active.close().await.unwrap();
        assert_eq!(replication.status(), ReplicationStatus::Closed);
        assert!(remote.closed.load(Ordering::SeqCst));
        assert!(matches!(active.sync().await, Err(CheckpointError::Closed)));
    }
}
