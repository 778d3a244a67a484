use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Field mapping of a single document, as stored and as delivered by the change feed.
pub type Document = Map<String, Value>;

/// A full-document write.
///
/// Fields listed in `server_timestamps` are filled in by the store with the
/// timestamp it assigns to the write, overriding any value the caller put in
/// `fields` under the same name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentWrite {
    pub fields: Document,
    pub server_timestamps: Vec<String>,
}

impl DocumentWrite {
    pub fn new(fields: Document) -> Self {
        Self {
            fields,
            server_timestamps: Vec::new(),
        }
    }

    pub fn with_server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.server_timestamps.push(field.into());
        self
    }

    /// Resolve the server timestamp placeholders into the final document.
    pub fn resolve(self, update_time: DateTime<Utc>) -> Document {
        let mut fields = self.fields;
        let stamp = Value::String(format_timestamp(update_time));
        for field in self.server_timestamps {
            fields.insert(field, stamp.clone());
        }
        fields
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub update_time: DateTime<Utc>,
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
