use super::document::{Document, DocumentWrite};
use serde_json::Value;

pub const FIELD_EMAIL: &str = "email";
pub const FIELD_NAME: &str = "name";
pub const FIELD_VERIFIED: &str = "verified";
pub const FIELD_ACTIVATED: &str = "activated";
pub const FIELD_APPROVED_AT: &str = "approvedAt";

pub const DEFAULT_DISPLAY_NAME: &str = "User";

/// Read-only view over the fields of a user record.
#[derive(Debug, Clone, Copy)]
pub struct UserRecord<'a> {
    fields: &'a Document,
}

impl<'a> UserRecord<'a> {
    pub fn new(fields: &'a Document) -> Self {
        Self { fields }
    }

    /// `Some` only when `verified` is a JSON boolean.
    pub fn verified(&self) -> Option<bool> {
        self.fields.get(FIELD_VERIFIED).and_then(Value::as_bool)
    }

    pub fn email(&self) -> Option<&'a str> {
        self.fields
            .get(FIELD_EMAIL)
            .and_then(Value::as_str)
            .filter(|email| !email.trim().is_empty())
    }

    /// The record's `name`, or `"User"` when missing or empty.
    pub fn display_name(&self) -> &'a str {
        self.fields
            .get(FIELD_NAME)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DISPLAY_NAME)
    }
}

/// Build the verified-collection write for a pending record.
///
/// Every field of `pending` is carried over; `activated` and `verified` are
/// forced to `true` and `approvedAt` is left for the store to stamp.
pub fn verified_record(pending: &Document) -> DocumentWrite {
    let mut fields = pending.clone();
    fields.insert(FIELD_ACTIVATED.to_string(), Value::Bool(true));
    fields.insert(FIELD_VERIFIED.to_string(), Value::Bool(true));
    fields.remove(FIELD_APPROVED_AT);

    DocumentWrite::new(fields).with_server_timestamp(FIELD_APPROVED_AT)
}
