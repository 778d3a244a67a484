pub mod document_repository;

pub use document_repository::{
    DocumentStore, RepositoryError, RepositoryResult, SqliteDocumentStore, StoredDocument,
};
