use crate::models::{Document, UserRecord};

/// True only on the `verified: false` → `verified: true` edge.
///
/// Both values must be JSON booleans; a missing snapshot, a missing field, or
/// a record that was already verified never counts as a transition.
pub fn is_verification_transition(before: Option<&Document>, after: Option<&Document>) -> bool {
    let (Some(before), Some(after)) = (before, after) else {
        return false;
    };

    UserRecord::new(before).verified() == Some(false)
        && UserRecord::new(after).verified() == Some(true)
}
