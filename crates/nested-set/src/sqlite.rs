use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use rusqlite_from_row::FromRow;

use crate::lock::{LockManager, TreeLock, TreeLockKey};
use crate::model::{Author, Comment, CommentDraft, CommentUpdate, Interval, Placement};
use crate::settings::{RetryPolicy, Settings};
use crate::store::{BoundOrder, CommentStore, StoreTx};
use crate::{CommentId, Error, Result, TreeId};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS trees (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tree_id INTEGER NOT NULL REFERENCES trees(id),
        parent_id INTEGER REFERENCES comments(id),
        lft INTEGER NOT NULL CHECK (lft > 0),
        rgt INTEGER NOT NULL,
        target TEXT NOT NULL,
        author_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        body TEXT NOT NULL,
        ip_address TEXT,
        is_anonymous INTEGER NOT NULL DEFAULT 0,
        is_public INTEGER NOT NULL DEFAULT 1,
        is_removed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (lft < rgt)
    );
    CREATE INDEX IF NOT EXISTS idx_comments_tree_bounds ON comments(tree_id, lft, rgt);
    CREATE INDEX IF NOT EXISTS idx_comments_target ON comments(target, created_at);
    CREATE TABLE IF NOT EXISTS tree_locks (
        lock_key TEXT PRIMARY KEY,
        tree_id INTEGER NOT NULL,
        token TEXT NOT NULL,
        acquired_at TEXT NOT NULL
    );
"#;

const COMMENT_COLUMNS: &str = "id, tree_id, parent_id, lft, rgt, target, author_id, author_name, \
     body, ip_address, is_anonymous, is_public, is_removed, created_at, updated_at";

#[derive(Debug, FromRow)]
struct CommentRow {
    id: CommentId,
    tree_id: TreeId,
    parent_id: Option<CommentId>,
    lft: i64,
    rgt: i64,
    target: String,
    author_id: String,
    author_name: String,
    body: String,
    ip_address: Option<String>,
    is_anonymous: bool,
    is_public: bool,
    is_removed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Comment {
            id: row.id,
            tree_id: row.tree_id,
            parent_id: row.parent_id,
            interval: Interval {
                left: row.lft,
                right: row.rgt,
            },
            target: row.target,
            author: Author {
                id: row.author_id,
                name: row.author_name,
            },
            body: row.body,
            ip_address: row.ip_address,
            is_anonymous: row.is_anonymous,
            is_public: row.is_public,
            is_removed: row.is_removed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct LockRow {
    lock_key: String,
    tree_id: TreeId,
    token: String,
    acquired_at: DateTime<Utc>,
}

impl From<LockRow> for TreeLock {
    fn from(row: LockRow) -> Self {
        TreeLock {
            tree_id: row.tree_id,
            key: TreeLockKey::from(row.lock_key),
            token: row.token,
            acquired_at: row.acquired_at,
        }
    }
}

fn order_sql(order: BoundOrder) -> &'static str {
    match order {
        BoundOrder::LeftAscending => "ASC",
        BoundOrder::LeftDescending => "DESC",
    }
}

/// Comment trees and their locks in one SQLite database.
///
/// A `SqliteStore` wraps a single connection. Writers in other threads or
/// processes open their own store on the same file; the lock table and
/// `IMMEDIATE` transactions keep them from interleaving tree rewrites.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    /// Applied to lock releases that find the database busy.
    release_retry: RetryPolicy,
}

impl SqliteStore {
    pub fn open(path: &Path, settings: &Settings) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self::configure(conn, settings.busy_timeout(), settings.retry)?;
        log::info!("opened comment store at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::configure(
            Connection::open_in_memory()?,
            Duration::ZERO,
            RetryPolicy::default(),
        )
    }

    fn configure(
        conn: Connection,
        busy_timeout: Duration,
        release_retry: RetryPolicy,
    ) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        log::debug!("journal mode: {}", mode);
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            release_retry,
        })
    }

    fn query_comments(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Comment>> {
        let mut stmt = self.conn.prepare(sql)?;
        let comments = stmt
            .query_map(params, CommentRow::try_from_row)?
            .map(|row| row.map(Comment::from))
            .collect::<rusqlite::Result<_>>()?;
        Ok(comments)
    }
}

/// A write transaction on a [`SqliteStore`].
#[derive(Debug)]
pub struct SqliteTx<'a> {
    tx: Transaction<'a>,
}

impl StoreTx for SqliteTx<'_> {
    fn allocate_tree(&self) -> Result<TreeId> {
        self.tx
            .execute("INSERT INTO trees (created_at) VALUES (?1)", [Utc::now()])?;
        Ok(TreeId::from(self.tx.last_insert_rowid()))
    }

    fn locate(&self, id: CommentId) -> Result<Option<(TreeId, Interval)>> {
        let located = self
            .tx
            .query_row(
                "SELECT tree_id, lft, rgt FROM comments WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, TreeId>(0)?,
                        Interval {
                            left: row.get(1)?,
                            right: row.get(2)?,
                        },
                    ))
                },
            )
            .optional()?;
        Ok(located)
    }

    fn shift_intervals(&self, tree_id: TreeId, from_bound: i64, delta: i64) -> Result<usize> {
        let touched = self.tx.execute(
            "UPDATE comments
             SET lft = CASE WHEN lft >= ?2 THEN lft + ?3 ELSE lft END,
                 rgt = CASE WHEN rgt >= ?2 THEN rgt + ?3 ELSE rgt END
             WHERE tree_id = ?1
               AND rgt >= ?2",
            params![tree_id, from_bound, delta],
        )?;
        log::debug!(
            "shifted {} intervals in tree {} from bound {} by {}",
            touched,
            tree_id,
            from_bound,
            delta
        );
        Ok(touched)
    }

    fn insert_comment(&self, draft: &CommentDraft, placement: Placement) -> Result<Comment> {
        if !placement.interval.is_valid() {
            return Err(Error::Internal(format!(
                "refusing to store invalid interval {:?}",
                placement.interval
            )));
        }
        let now = Utc::now();
        self.tx.execute(
            "INSERT INTO comments
             (tree_id, parent_id, lft, rgt, target, author_id, author_name, body,
              ip_address, is_anonymous, is_public, is_removed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 0, ?11, ?11)",
            params![
                placement.tree_id,
                placement.parent_id,
                placement.interval.left,
                placement.interval.right,
                draft.target,
                draft.author.id,
                draft.author.name,
                draft.body,
                draft.ip_address,
                draft.is_anonymous,
                now,
            ],
        )?;

        Ok(Comment {
            id: CommentId::from(self.tx.last_insert_rowid()),
            tree_id: placement.tree_id,
            parent_id: placement.parent_id,
            interval: placement.interval,
            target: draft.target.clone(),
            author: draft.author.clone(),
            body: draft.body.clone(),
            ip_address: draft.ip_address.clone(),
            is_anonymous: draft.is_anonymous,
            is_public: true,
            is_removed: false,
            created_at: now,
            updated_at: now,
        })
    }

    fn release_lock(&self, lock: &TreeLock) -> Result<bool> {
        let deleted = self.tx.execute(
            "DELETE FROM tree_locks WHERE lock_key = ?1 AND token = ?2",
            params![lock.key.as_str(), lock.token],
        )?;
        Ok(deleted > 0)
    }

    fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

impl CommentStore for SqliteStore {
    type Tx<'a> = SqliteTx<'a>;

    fn begin(&self) -> Result<SqliteTx<'_>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        Ok(SqliteTx { tx })
    }

    fn get_comment(&self, id: CommentId) -> Result<Option<Comment>> {
        let sql = format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?1");
        let comment = self
            .conn
            .query_row(&sql, [id], CommentRow::try_from_row)
            .optional()?;
        Ok(comment.map(Comment::from))
    }

    fn find_containing(
        &self,
        tree_id: TreeId,
        lo: i64,
        hi: i64,
        order: BoundOrder,
    ) -> Result<Vec<Comment>> {
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM comments
             WHERE tree_id = ?1 AND lft <= ?2 AND rgt >= ?3
               AND is_public = 1 AND is_removed = 0
             ORDER BY lft {}",
            order_sql(order)
        );
        self.query_comments(&sql, params![tree_id, lo, hi])
    }

    fn find_contained(
        &self,
        tree_id: TreeId,
        lo: i64,
        hi: i64,
        order: BoundOrder,
    ) -> Result<Vec<Comment>> {
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM comments
             WHERE tree_id = ?1 AND lft >= ?2 AND rgt <= ?3
               AND is_public = 1 AND is_removed = 0
             ORDER BY lft {}",
            order_sql(order)
        );
        self.query_comments(&sql, params![tree_id, lo, hi])
    }

    fn tree_comments(&self, tree_id: TreeId) -> Result<Vec<Comment>> {
        let sql =
            format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE tree_id = ?1 ORDER BY lft ASC");
        self.query_comments(&sql, [tree_id])
    }

    fn comments_for_target(&self, target: &str, include_moderated: bool) -> Result<Vec<Comment>> {
        let filter = if include_moderated {
            ""
        } else {
            "AND is_public = 1 AND is_removed = 0"
        };
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM comments
             WHERE target = ?1 {filter}
             ORDER BY created_at DESC, id DESC"
        );
        self.query_comments(&sql, [target])
    }

    fn update_comment(&self, id: CommentId, update: &CommentUpdate) -> Result<Comment> {
        let changed = self.conn.execute(
            "UPDATE comments
             SET body = COALESCE(?2, body),
                 is_public = COALESCE(?3, is_public),
                 is_removed = COALESCE(?4, is_removed),
                 updated_at = ?5
             WHERE id = ?1",
            params![id, update.body, update.is_public, update.is_removed, Utc::now()],
        )?;
        if changed == 0 {
            return Err(Error::CommentNotFound { comment_id: id });
        }
        self.get_comment(id)?
            .ok_or(Error::CommentNotFound { comment_id: id })
    }
}

impl LockManager for SqliteStore {
    fn acquire(&self, tree_id: TreeId) -> Result<TreeLock> {
        let lock = TreeLock::new(tree_id);
        // The primary key on lock_key makes this an atomic insert-or-fail.
        let inserted = self.conn.execute(
            "INSERT INTO tree_locks (lock_key, tree_id, token, acquired_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (lock_key) DO NOTHING",
            params![lock.key.as_str(), tree_id, lock.token, lock.acquired_at],
        )?;
        if inserted == 0 {
            return Err(Error::LockContention { tree_id });
        }
        Ok(lock)
    }

    fn release(&self, lock: &TreeLock) -> Result<()> {
        // A release that gives up leaves the tree locked until a sweep, so a
        // busy database is waited out like contention on insert.
        let policy = self.release_retry;
        let mut attempt = 0;
        let deleted = loop {
            let result = self
                .conn
                .execute(
                    "DELETE FROM tree_locks WHERE lock_key = ?1 AND token = ?2",
                    params![lock.key.as_str(), lock.token],
                )
                .map_err(Error::from);
            match result {
                Ok(deleted) => break deleted,
                Err(Error::StorageBusy) if attempt + 1 < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    log::debug!(
                        "releasing lock for tree {} found the database busy, retrying in {:?}",
                        lock.tree_id,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };
        if deleted == 0 {
            log::warn!(
                "lock for tree {} was no longer held by token {}",
                lock.tree_id,
                lock.token
            );
        }
        Ok(())
    }

    fn held(&self) -> Result<Vec<TreeLock>> {
        let mut stmt = self.conn.prepare(
            "SELECT lock_key, tree_id, token, acquired_at FROM tree_locks ORDER BY acquired_at",
        )?;
        let locks = stmt
            .query_map([], LockRow::try_from_row)?
            .map(|row| row.map(TreeLock::from))
            .collect::<rusqlite::Result<_>>()?;
        Ok(locks)
    }

    fn force_release(&self, tree_id: TreeId) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM tree_locks WHERE lock_key = ?1",
            [TreeLockKey::for_tree(tree_id).as_str()],
        )?;
        Ok(deleted > 0)
    }
}
