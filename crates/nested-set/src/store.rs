use crate::lock::TreeLock;
use crate::model::{Comment, CommentDraft, CommentUpdate, Interval, Placement};
use crate::{CommentId, Result, TreeId};

/// Ordering of query results by left bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundOrder {
    LeftAscending,
    LeftDescending,
}

/// One all-or-nothing unit of work against the comment store.
///
/// Dropping a transaction without calling [`StoreTx::commit`] discards every
/// write made through it.
pub trait StoreTx {
    /// Create a new tree record and return its id.
    fn allocate_tree(&self) -> Result<TreeId>;

    /// Current tree and bounds of a comment, read inside this transaction.
    fn locate(&self, id: CommentId) -> Result<Option<(TreeId, Interval)>>;

    /// Add `delta` to every left bound `>= from_bound` and every right bound
    /// `>= from_bound` within `tree_id`, as one bulk update.
    ///
    /// Returns the number of rows touched.
    fn shift_intervals(&self, tree_id: TreeId, from_bound: i64, delta: i64) -> Result<usize>;

    fn insert_comment(&self, draft: &CommentDraft, placement: Placement) -> Result<Comment>;

    /// Release `lock` as part of this transaction when the store also keeps
    /// the locks. Returns `false` when it holds no such lock, leaving the
    /// release to the lock manager.
    fn release_lock(&self, lock: &TreeLock) -> Result<bool>;

    fn commit(self) -> Result<()>
    where
        Self: Sized;
}

/// Persistence collaborator of the tree engine.
pub trait CommentStore {
    type Tx<'a>: StoreTx
    where
        Self: 'a;

    /// Open a write transaction.
    fn begin(&self) -> Result<Self::Tx<'_>>;

    fn get_comment(&self, id: CommentId) -> Result<Option<Comment>>;

    /// Visible nodes of `tree_id` with `left <= lo` and `right >= hi`.
    fn find_containing(
        &self,
        tree_id: TreeId,
        lo: i64,
        hi: i64,
        order: BoundOrder,
    ) -> Result<Vec<Comment>>;

    /// Visible nodes of `tree_id` with `left >= lo` and `right <= hi`.
    fn find_contained(
        &self,
        tree_id: TreeId,
        lo: i64,
        hi: i64,
        order: BoundOrder,
    ) -> Result<Vec<Comment>>;

    /// Every node of a tree, moderated ones included, by left bound.
    fn tree_comments(&self, tree_id: TreeId) -> Result<Vec<Comment>>;

    /// Comments attached to `target`, newest first.
    fn comments_for_target(&self, target: &str, include_moderated: bool) -> Result<Vec<Comment>>;

    /// Apply content or moderation changes and bump `updated_at`.
    fn update_comment(&self, id: CommentId, update: &CommentUpdate) -> Result<Comment>;
}
