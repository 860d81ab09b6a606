//! Conversation checkpoint persistence.
//!
//! - `types`: threads, messages and checkpoint records
//! - `store`: append-only `SQLite` checkpoint store
//! - `replica`: optional remote replica with background sync
//! - `checkpointer`: facade owning both with an ordered shutdown

pub mod checkpointer;
pub mod errors;
pub mod replica;
pub mod store;
pub mod types;

pub use checkpointer::{CheckpointerConfig, DEFAULT_DB_PATH, DEFAULT_SYNC_INTERVAL, SyncedCheckpointer};
pub use errors::{CheckpointError, CheckpointResult};
pub use replica::{
    HttpConnector, HttpReplica, RemoteReplica, RemoteSettings, ReplicaConnector, Replication,
    ReplicationStatus, SyncReport,
};
pub use store::{CheckpointRow, CheckpointStore, SqliteCheckpointStore, StoreFuture};
pub use types::{
    ChatMessage, ChatRole, Checkpoint, CheckpointMetadata, CheckpointSource, ConversationState,
    ThreadId, ToolCall,
};
