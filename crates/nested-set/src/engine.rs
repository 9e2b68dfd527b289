use crate::author::effective_author;
use crate::lock::LockManager;
use crate::model::{Author, Comment, CommentDraft, CommentUpdate};
use crate::mutator::NestedSetMutator;
use crate::query::AncestorQuery;
use crate::settings::Settings;
use crate::store::CommentStore;
use crate::{CommentId, Error, Result, TreeId};

/// Entry point for callers that work with comment ids.
///
/// Wraps the mutator and the query engine over one store and one lock
/// manager, resolving ids to rows first.
pub struct ThreadTree<'a, S, L: ?Sized> {
    store: &'a S,
    locks: &'a L,
    settings: &'a Settings,
}

impl<'a, S, L> ThreadTree<'a, S, L>
where
    S: CommentStore,
    L: LockManager + ?Sized,
{
    pub fn new(store: &'a S, locks: &'a L, settings: &'a Settings) -> Self {
        Self {
            store,
            locks,
            settings,
        }
    }

    pub fn get(&self, id: CommentId) -> Result<Comment> {
        self.store
            .get_comment(id)?
            .ok_or(Error::CommentNotFound { comment_id: id })
    }

    /// Insert a comment as a new root or as the last reply to `parent_id`.
    ///
    /// Fails with [`Error::InvalidParent`] when `parent_id` does not exist and
    /// with [`Error::LockContention`] when another writer holds the tree.
    pub fn insert(&self, draft: &CommentDraft, parent_id: Option<CommentId>) -> Result<Comment> {
        let parent = match parent_id {
            Some(parent_id) => Some(
                self.store
                    .get_comment(parent_id)?
                    .ok_or(Error::InvalidParent { parent_id })?,
            ),
            None => None,
        };
        NestedSetMutator::new(self.store, self.locks).insert(draft, parent.as_ref())
    }

    /// [`ThreadTree::insert`], repeated with backoff while it fails on contention.
    pub fn insert_with_retry(
        &self,
        draft: &CommentDraft,
        parent_id: Option<CommentId>,
    ) -> Result<Comment> {
        let policy = self.settings.retry;
        let mut attempt = 0;
        loop {
            match self.insert(draft, parent_id) {
                Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    log::warn!(
                        "insert attempt {} failed: {}, retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    pub fn get_ancestors(
        &self,
        id: CommentId,
        include_self: bool,
        ascending: bool,
    ) -> Result<Vec<Comment>> {
        let node = self.get(id)?;
        AncestorQuery::new(self.store).get_ancestors(&node, include_self, ascending)
    }

    pub fn get_descendants(&self, id: CommentId, include_self: bool) -> Result<Vec<Comment>> {
        let node = self.get(id)?;
        AncestorQuery::new(self.store).get_descendants(&node, include_self)
    }

    pub fn tree(&self, tree_id: TreeId) -> Result<Vec<Comment>> {
        self.store.tree_comments(tree_id)
    }

    pub fn comments_for_target(&self, target: &str, include_moderated: bool) -> Result<Vec<Comment>> {
        self.store.comments_for_target(target, include_moderated)
    }

    pub fn set_public(&self, id: CommentId, is_public: bool) -> Result<Comment> {
        self.update(
            id,
            CommentUpdate {
                is_public: Some(is_public),
                ..Default::default()
            },
        )
    }

    /// Soft removal: the row and its bounds stay, readers stop seeing it.
    pub fn set_removed(&self, id: CommentId, is_removed: bool) -> Result<Comment> {
        self.update(
            id,
            CommentUpdate {
                is_removed: Some(is_removed),
                ..Default::default()
            },
        )
    }

    pub fn edit_body(&self, id: CommentId, body: String) -> Result<Comment> {
        self.update(
            id,
            CommentUpdate {
                body: Some(body),
                ..Default::default()
            },
        )
    }

    pub fn update(&self, id: CommentId, update: CommentUpdate) -> Result<Comment> {
        if update.is_empty() {
            return self.get(id);
        }
        let comment = self.store.update_comment(id, &update)?;
        log::info!("updated comment {}", id);
        Ok(comment)
    }

    pub fn author_of<'c>(&'c self, comment: &'c Comment) -> &'c Author {
        effective_author(comment, &self.settings.anonymous)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use test_db::TestDb;

    use super::*;
    use crate::lock::{MemoryLockManager, lock_tree};
    use crate::model::Interval;
    use crate::query::check_tree;
    use crate::settings::RetryPolicy;
    use crate::sqlite::SqliteStore;

    fn draft(body: &str) -> CommentDraft {
        CommentDraft::new("article:1", Author::new("u1", "alice"), body)
    }

    fn ids(comments: &[Comment]) -> Vec<CommentId> {
        comments.iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_scenarios() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = Settings::default();
        let tree = ThreadTree::new(&store, &store, &settings);

        let a = tree.insert(&draft("A"), None).unwrap();
        assert_eq!(a.interval, Interval { left: 1, right: 2 });

        let b = tree.insert(&draft("B"), Some(a.id)).unwrap();
        assert_eq!(b.interval, Interval { left: 2, right: 3 });
        assert_eq!(tree.get(a.id).unwrap().interval, Interval { left: 1, right: 4 });

        let c = tree.insert(&draft("C"), Some(a.id)).unwrap();
        assert_eq!(c.interval, Interval { left: 4, right: 5 });
        assert_eq!(tree.get(a.id).unwrap().interval, Interval { left: 1, right: 6 });
        assert_eq!(tree.get(b.id).unwrap().interval, Interval { left: 2, right: 3 });

        assert_eq!(ids(&tree.get_ancestors(c.id, false, false).unwrap()), vec![a.id]);
        assert_eq!(
            ids(&tree.get_ancestors(b.id, true, false).unwrap()),
            vec![a.id, b.id]
        );
    }

    #[test]
    fn test_insert_with_unknown_parent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = Settings::default();
        let tree = ThreadTree::new(&store, &store, &settings);

        let err = tree
            .insert_with_retry(&draft("orphan"), Some(CommentId::from(42)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent { .. }));
        assert!(matches!(
            tree.get_ancestors(CommentId::from(42), false, false),
            Err(Error::CommentNotFound { .. })
        ));
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = Settings {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            ..Default::default()
        };
        let tree = ThreadTree::new(&store, &store, &settings);
        let root = tree.insert(&draft("root"), None).unwrap();

        let _held = lock_tree(&store, root.tree_id).unwrap();
        let err = tree.insert_with_retry(&draft("reply"), Some(root.id)).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
        assert_eq!(tree.tree(root.tree_id).unwrap().len(), 1);
    }

    #[test]
    fn test_moderation_keeps_bounds() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = Settings::default();
        let tree = ThreadTree::new(&store, &store, &settings);
        let root = tree.insert(&draft("root"), None).unwrap();
        let reply = tree.insert(&draft("reply"), Some(root.id)).unwrap();

        let removed = tree.set_removed(reply.id, true).unwrap();
        assert!(removed.is_removed);
        assert_eq!(removed.interval, reply.interval);
        assert!(tree.get_descendants(root.id, false).unwrap().is_empty());
        assert_eq!(tree.comments_for_target("article:1", true).unwrap().len(), 2);
        assert_eq!(tree.comments_for_target("article:1", false).unwrap().len(), 1);

        let hidden = tree.set_public(root.id, false).unwrap();
        assert!(!hidden.is_public);
        let edited = tree.edit_body(root.id, "edited".to_string()).unwrap();
        assert_eq!(edited.body, "edited");
        assert!(!edited.is_public);

        // A later reply still lands after the removed one.
        let next = tree.insert(&draft("next"), Some(root.id)).unwrap();
        assert_eq!(next.interval, Interval { left: 4, right: 5 });
        check_tree(&tree.tree(root.tree_id).unwrap()).unwrap();
    }

    #[test]
    fn test_anonymous_author_resolution() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = Settings::default();
        let tree = ThreadTree::new(&store, &store, &settings);
        let comment = tree.insert(&draft("psst").anonymous(), None).unwrap();

        assert_eq!(tree.author_of(&comment).name, "Anonymous User");
        assert_eq!(tree.get(comment.id).unwrap().author.name, "alice");
    }

    #[test]
    fn test_concurrent_replies_across_connections() {
        let db = TestDb::new().unwrap();
        let settings = Arc::new(Settings {
            retry: RetryPolicy {
                max_attempts: 200,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            ..Default::default()
        });

        let root = {
            let store = SqliteStore::open(db.path(), &settings).unwrap();
            ThreadTree::new(&store, &store, settings.as_ref())
                .insert(&draft("root"), None)
                .unwrap()
        };

        let writers = 8;
        let per_writer = 5;
        let mut handles = vec![];
        for w in 0..writers {
            let path = db.path().to_path_buf();
            let settings = Arc::clone(&settings);
            let root_id = root.id;
            handles.push(thread::spawn(move || {
                let store = SqliteStore::open(&path, &settings).unwrap();
                let tree = ThreadTree::new(&store, &store, settings.as_ref());
                for i in 0..per_writer {
                    tree.insert_with_retry(&draft(&format!("w{w}-{i}")), Some(root_id))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteStore::open(db.path(), &settings).unwrap();
        let nodes = store.tree_comments(root.tree_id).unwrap();
        assert_eq!(nodes.len(), 1 + writers * per_writer);
        check_tree(&nodes).unwrap();
        assert!(store.held().unwrap().is_empty());
    }

    #[test]
    fn test_two_racing_replies_one_wins_without_retry() {
        let db = TestDb::new().unwrap();
        let settings = Settings::default();
        let store = SqliteStore::open(db.path(), &settings).unwrap();
        let tree = ThreadTree::new(&store, &store, &settings);
        let root = tree.insert(&draft("root"), None).unwrap();

        let contended = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|n| {
                let path = db.path().to_path_buf();
                let settings = settings.clone();
                let contended = Arc::clone(&contended);
                let root_id = root.id;
                thread::spawn(move || {
                    let store = SqliteStore::open(&path, &settings).unwrap();
                    let tree = ThreadTree::new(&store, &store, &settings);
                    match tree.insert(&draft(&format!("r{n}")), Some(root_id)) {
                        Ok(_) => {}
                        Err(Error::LockContention { .. } | Error::StorageBusy) => {
                            contended.fetch_add(1, Ordering::SeqCst);
                            tree.insert_with_retry(&draft(&format!("r{n}")), Some(root_id))
                                .unwrap();
                        }
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(contended.load(Ordering::SeqCst) <= 1);
        let nodes = tree.tree(root.tree_id).unwrap();
        assert_eq!(nodes.len(), 3);
        check_tree(&nodes).unwrap();
    }

    #[test]
    fn test_memory_locks_with_shared_store_file() {
        let db = TestDb::new().unwrap();
        let settings = Arc::new(Settings {
            retry: RetryPolicy {
                max_attempts: 500,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            ..Default::default()
        });
        let locks = Arc::new(MemoryLockManager::new());

        let root = {
            let store = SqliteStore::open(db.path(), &settings).unwrap();
            ThreadTree::new(&store, locks.as_ref(), settings.as_ref())
                .insert(&draft("root"), None)
                .unwrap()
        };

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let path = db.path().to_path_buf();
                let settings = Arc::clone(&settings);
                let locks = Arc::clone(&locks);
                let root_id = root.id;
                thread::spawn(move || {
                    let store = SqliteStore::open(&path, &settings).unwrap();
                    let tree = ThreadTree::new(&store, locks.as_ref(), settings.as_ref());
                    let reply = tree
                        .insert_with_retry(&draft(&format!("r{n}")), Some(root_id))
                        .unwrap();
                    tree.insert_with_retry(&draft(&format!("r{n}-nested")), Some(reply.id))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteStore::open(db.path(), &settings).unwrap();
        let nodes = store.tree_comments(root.tree_id).unwrap();
        assert_eq!(nodes.len(), 9);
        check_tree(&nodes).unwrap();
        assert!(locks.held().unwrap().is_empty());
    }
}
