pub mod change_event;
pub mod document;
pub mod user;

pub use change_event::ChangeEvent;
pub use document::{Document, DocumentWrite, WriteResult};
pub use user::{verified_record, UserRecord};
