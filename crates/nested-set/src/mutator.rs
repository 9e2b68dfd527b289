use crate::lock::{LockManager, TreeLock, lock_tree};
use crate::model::{Comment, CommentDraft, Interval, Placement};
use crate::registry::TreeRegistry;
use crate::store::{CommentStore, StoreTx};
use crate::{Error, Result};

/// Places new comments into nested-set trees.
///
/// Roots open a tree of their own and need no lock. A reply is appended as
/// the rightmost child of its parent while the parent's tree is locked:
/// every bound at or past the parent's right bound moves up by
/// [`Interval::NODE_WIDTH`] and the reply takes the freed slot. The shift and
/// the new row commit together. When the store also keeps the locks, the
/// lock row is deleted in that same transaction; otherwise it is released
/// right after. A lock that cannot be released fails the insert with
/// [`Error::ReleaseFailed`].
pub struct NestedSetMutator<'a, S, L: ?Sized> {
    store: &'a S,
    locks: &'a L,
}

impl<'a, S, L> NestedSetMutator<'a, S, L>
where
    S: CommentStore,
    L: LockManager + ?Sized,
{
    pub fn new(store: &'a S, locks: &'a L) -> Self {
        Self { store, locks }
    }

    pub fn insert(&self, draft: &CommentDraft, parent: Option<&Comment>) -> Result<Comment> {
        match parent {
            None => self.insert_root(draft),
            Some(parent) => self.insert_child(draft, parent),
        }
    }

    fn insert_root(&self, draft: &CommentDraft) -> Result<Comment> {
        let tx = self.store.begin()?;
        let tree_id = TreeRegistry::resolve_tree(&tx, None)?;
        let comment = tx.insert_comment(
            draft,
            Placement {
                tree_id,
                parent_id: None,
                interval: Interval::ROOT,
            },
        )?;
        tx.commit()?;
        log::info!("inserted root comment {} in tree {}", comment.id, tree_id);
        Ok(comment)
    }

    fn insert_child(&self, draft: &CommentDraft, parent: &Comment) -> Result<Comment> {
        let guard = lock_tree(self.locks, parent.tree_id)?;

        let (comment, released_on_commit) = match self.insert_locked(draft, parent, guard.lock())
        {
            Ok(inserted) => inserted,
            Err(err) => {
                if let Err(release_err) = guard.release() {
                    log::error!(
                        "insert under {} failed: {}; the lock on tree {} is still held",
                        parent.id,
                        err,
                        parent.tree_id
                    );
                    return Err(Error::ReleaseFailed {
                        tree_id: parent.tree_id,
                        source: Box::new(release_err),
                    });
                }
                return Err(err);
            }
        };

        if released_on_commit {
            guard.dismiss();
        } else {
            guard.release().map_err(|err| Error::ReleaseFailed {
                tree_id: comment.tree_id,
                source: Box::new(err),
            })?;
        }

        log::info!(
            "inserted comment {} under {} at ({}, {}) in tree {}",
            comment.id,
            parent.id,
            comment.interval.left,
            comment.interval.right,
            comment.tree_id
        );
        Ok(comment)
    }

    /// Shift and insert under `lock`. Also reports whether the lock was
    /// released by the committed transaction.
    fn insert_locked(
        &self,
        draft: &CommentDraft,
        parent: &Comment,
        lock: &TreeLock,
    ) -> Result<(Comment, bool)> {
        let tx = self.store.begin()?;
        let tree_id = TreeRegistry::resolve_tree(&tx, Some(parent))?;

        // The caller's copy of the parent may predate other writers' shifts.
        let (current_tree, parent_interval) =
            tx.locate(parent.id)?.ok_or(Error::InvalidParent {
                parent_id: parent.id,
            })?;
        if current_tree != tree_id {
            return Err(Error::Internal(format!(
                "comment {} moved from tree {} to tree {}",
                parent.id, tree_id, current_tree
            )));
        }

        let insertion_point = parent_interval.right;
        tx.shift_intervals(tree_id, insertion_point, Interval::NODE_WIDTH)?;
        let comment = tx.insert_comment(
            draft,
            Placement {
                tree_id,
                parent_id: Some(parent.id),
                interval: Interval::leaf_at(insertion_point),
            },
        )?;
        let released = tx.release_lock(lock)?;
        tx.commit()?;
        Ok((comment, released))
    }
}
