use crate::model::Comment;
use crate::store::StoreTx;
use crate::{Result, TreeId};

/// Hands out tree identities.
pub struct TreeRegistry;

impl TreeRegistry {
    /// The tree a new comment belongs to.
    ///
    /// A parentless comment starts a tree of its own; a reply joins the tree
    /// of its parent. Allocation happens in `tx`, so an aborted root
    /// insertion leaves no empty tree behind.
    pub fn resolve_tree<T: StoreTx>(tx: &T, parent: Option<&Comment>) -> Result<TreeId> {
        match parent {
            Some(parent) => Ok(parent.tree_id),
            None => {
                let tree_id = tx.allocate_tree()?;
                log::info!("allocated tree {}", tree_id);
                Ok(tree_id)
            }
        }
    }
}
