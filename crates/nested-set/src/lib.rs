mod author;
mod engine;
mod lock;
pub(crate) mod model;
mod mutator;
mod query;
mod registry;
mod settings;
mod sqlite;
mod store;
pub mod sweep;

pub use author::effective_author;
pub use engine::ThreadTree;
pub use lock::{LockManager, MemoryLockManager, TreeLock, TreeLockGuard, TreeLockKey, lock_tree};
pub use model::{Author, Comment, CommentDraft, CommentUpdate, Interval, Placement};
pub use mutator::NestedSetMutator;
pub use query::{AncestorQuery, check_tree};
pub use registry::TreeRegistry;
pub use settings::{LockBackend, LockSettings, RetryPolicy, Settings};
pub use sqlite::{SqliteStore, SqliteTx};
pub use store::{BoundOrder, CommentStore, StoreTx};
pub use threadtree_types::{CommentId, TreeId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Tree {tree_id} is locked by another writer")]
    LockContention { tree_id: TreeId },
    #[error("Parent comment not found: {parent_id}")]
    InvalidParent { parent_id: CommentId },
    #[error("Comment not found: {comment_id}")]
    CommentNotFound { comment_id: CommentId },
    #[error("Storage is busy")]
    StorageBusy,
    #[error("Failed to release lock on tree {tree_id}: {source}")]
    ReleaseFailed {
        tree_id: TreeId,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockContention { .. } | Error::StorageBusy)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Error::StorageBusy
            }
            _ => Error::Sqlite(err),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(
            Error::LockContention {
                tree_id: TreeId::from(1)
            }
            .is_retryable()
        );
        assert!(Error::StorageBusy.is_retryable());
        assert!(
            !Error::ReleaseFailed {
                tree_id: TreeId::from(1),
                source: Box::new(Error::StorageBusy)
            }
            .is_retryable()
        );
        assert!(
            !Error::InvalidParent {
                parent_id: CommentId::from(3)
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_busy_sqlite_error_maps_to_storage_busy() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(Error::from(err), Error::StorageBusy));
    }
}
