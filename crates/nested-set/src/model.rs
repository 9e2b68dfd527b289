use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommentId, TreeId};

/// The `(left, right)` bounds of one node in a nested-set tree.
///
/// Within a tree, two intervals are either disjoint or one contains the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub left: i64,
    pub right: i64,
}

impl Interval {
    /// Bounds of the first node of every tree.
    pub const ROOT: Interval = Interval { left: 1, right: 2 };

    /// Interval space consumed by one inserted node.
    pub const NODE_WIDTH: i64 = 2;

    /// A leaf placed at `point`, which becomes its left bound.
    pub fn leaf_at(point: i64) -> Self {
        Self {
            left: point,
            right: point + 1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.left > 0 && self.left < self.right
    }

    /// `other` lies within `self`, bounds included.
    pub fn contains(&self, other: &Interval) -> bool {
        self.left <= other.left && self.right >= other.right
    }

    pub fn is_disjoint(&self, other: &Interval) -> bool {
        self.right < other.left || other.right < self.left
    }

    /// Number of descendants encoded by this interval.
    pub fn descendant_count(&self) -> i64 {
        (self.right - self.left - 1) / 2
    }

    /// The bounds this interval has after a shift of `delta` starting at `from_bound`.
    pub fn shifted(&self, from_bound: i64, delta: i64) -> Self {
        Self {
            left: if self.left >= from_bound {
                self.left + delta
            } else {
                self.left
            },
            right: if self.right >= from_bound {
                self.right + delta
            } else {
                self.right
            },
        }
    }
}

/// Identity of whoever wrote a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
}

impl Author {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A submitted comment that has not been placed in a tree yet.
#[derive(Debug, Clone)]
pub struct CommentDraft {
    /// Key of the discussed object, e.g. `article:42`.
    pub target: String,
    pub author: Author,
    pub body: String,
    pub ip_address: Option<String>,
    pub is_anonymous: bool,
}

impl CommentDraft {
    pub fn new(target: impl Into<String>, author: Author, body: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            author,
            body: body.into(),
            ip_address: None,
            is_anonymous: false,
        }
    }

    pub fn anonymous(mut self) -> Self {
        self.is_anonymous = true;
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// Where a new node lands: its tree, parent and bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub tree_id: TreeId,
    pub parent_id: Option<CommentId>,
    pub interval: Interval,
}

/// A persisted node of a comment tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub tree_id: TreeId,
    pub parent_id: Option<CommentId>,
    #[serde(flatten)]
    pub interval: Interval,
    pub target: String,
    pub author: Author,
    pub body: String,
    pub ip_address: Option<String>,
    pub is_anonymous: bool,
    pub is_public: bool,
    pub is_removed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Visible to readers that do not see moderated content.
    pub fn is_visible(&self) -> bool {
        self.is_public && !self.is_removed
    }
}

/// Content and moderation changes that leave the tree shape alone.
#[derive(Debug, Clone, Default)]
pub struct CommentUpdate {
    pub body: Option<String>,
    pub is_public: Option<bool>,
    pub is_removed: Option<bool>,
}

impl CommentUpdate {
    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.is_public.is_none() && self.is_removed.is_none()
    }
}
