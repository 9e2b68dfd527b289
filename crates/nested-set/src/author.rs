use crate::model::{Author, Comment};

/// The author to display for `comment`.
///
/// Anonymous comments keep their real author in storage; readers get the
/// configured `anonymous` sentinel instead.
pub fn effective_author<'a>(comment: &'a Comment, anonymous: &'a Author) -> &'a Author {
    if comment.is_anonymous {
        anonymous
    } else {
        &comment.author
    }
}
