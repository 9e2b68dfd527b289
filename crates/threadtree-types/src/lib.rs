mod ids;

pub use ids::{CommentId, TreeId};
