use crate::model::Comment;
use crate::store::{BoundOrder, CommentStore};
use crate::{Error, Result};

/// Read-only ancestor and descendant lookups by interval containment.
///
/// Queries never take a tree lock. Moderated (non-public or removed) nodes
/// are left out of the results.
pub struct AncestorQuery<'a, S> {
    store: &'a S,
}

impl<'a, S: CommentStore> AncestorQuery<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Ancestors of `node`, optionally including `node` itself.
    ///
    /// With `ascending == false` the result runs root first, by left bound.
    /// With `ascending == true` it walks upwards from `node` towards the root.
    pub fn get_ancestors(
        &self,
        node: &Comment,
        include_self: bool,
        ascending: bool,
    ) -> Result<Vec<Comment>> {
        if node.is_root() {
            return Ok(if include_self {
                vec![node.clone()]
            } else {
                Vec::new()
            });
        }

        let (mut lo, mut hi) = (node.interval.left, node.interval.right);
        if !include_self {
            lo -= 1;
            hi += 1;
        }
        let order = if ascending {
            BoundOrder::LeftDescending
        } else {
            BoundOrder::LeftAscending
        };
        self.store.find_containing(node.tree_id, lo, hi, order)
    }

    /// Descendants of `node` in document order, optionally including `node`.
    pub fn get_descendants(&self, node: &Comment, include_self: bool) -> Result<Vec<Comment>> {
        if node.interval.descendant_count() == 0 && !include_self {
            return Ok(Vec::new());
        }
        let (mut lo, mut hi) = (node.interval.left, node.interval.right);
        if !include_self {
            lo += 1;
            hi -= 1;
        }
        self.store
            .find_contained(node.tree_id, lo, hi, BoundOrder::LeftAscending)
    }
}

/// Check the nested-set invariants over every node of one tree.
///
/// Every interval must be valid, pairwise intervals must be disjoint or
/// strictly nested, no two nodes may share a bound, and each node must sit
/// directly inside its parent's interval.
pub fn check_tree(nodes: &[Comment]) -> Result<()> {
    let violation = |message: String| Err(Error::Internal(message));

    for node in nodes {
        if !node.interval.is_valid() {
            return violation(format!("comment {} has invalid bounds {:?}", node.id, node.interval));
        }
    }

    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            let (x, y) = (a.interval, b.interval);
            let shares_bound =
                x.left == y.left || x.left == y.right || x.right == y.left || x.right == y.right;
            if shares_bound {
                return violation(format!("comments {} and {} share a bound", a.id, b.id));
            }
            if !(x.is_disjoint(&y) || x.contains(&y) || y.contains(&x)) {
                return violation(format!(
                    "comments {} {:?} and {} {:?} overlap",
                    a.id, x, b.id, y
                ));
            }
        }
    }

    for node in nodes {
        let Some(parent_id) = node.parent_id else {
            continue;
        };
        let Some(parent) = nodes.iter().find(|n| n.id == parent_id) else {
            return violation(format!("parent {} of {} is not in the tree", parent_id, node.id));
        };
        if !parent.interval.contains(&node.interval) {
            return violation(format!(
                "comment {} lies outside its parent {}",
                node.id, parent_id
            ));
        }
    }

    if let Some(max_right) = nodes.iter().map(|n| n.interval.right).max() {
        let expected = 2 * nodes.len() as i64;
        if max_right != expected {
            return violation(format!(
                "tree of {} nodes ends at {} instead of {}",
                nodes.len(),
                max_right,
                expected
            ));
        }
    }

    Ok(())
}
