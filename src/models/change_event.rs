use super::document::Document;
use serde::{Deserialize, Serialize};

/// One update delivered by a change feed subscription.
///
/// `seq` is the feed position; it increases strictly within a namespace and is
/// what listeners acknowledge. `before`/`after` are `None` when the feed could
/// not supply that side of the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: i64,
    pub namespace: String,
    pub document_id: String,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

impl ChangeEvent {
    /// Path of the changed document, e.g. `pending_users/u-123`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.namespace, self.document_id)
    }
}
