//! Document store port - the shared collection/document database

use crate::domain::result::Result;
use crate::domain::{Document, FieldPath, Filter, Page};

/// Shared document store
///
/// Collections hold JSON documents keyed by `_id`. Every call is atomic on
/// its own; `put` replaces a whole document in one step, which is what lets
/// the migration runner be interrupted at any point.
pub trait DocumentStore: Send + Sync {
    /// Names of all non-empty collections, sorted
    fn collections(&self) -> Result<Vec<String>>;

    /// Number of documents in `collection` matching `filter`
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Documents matching `filter`, ordered by `_id`, starting after `page.after`
    fn find(&self, collection: &str, filter: &Filter, page: &Page) -> Result<Vec<Document>>;

    /// Fetch one document by id
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Insert or replace a document (the document must carry an `_id`)
    fn put(&self, collection: &str, doc: &Document) -> Result<()>;

    /// Delete a document, returning whether it existed
    fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Replace the whole content of a collection in one transaction
    fn replace_collection(&self, collection: &str, docs: &[Document]) -> Result<()>;

    /// Maintain an equality index on `field` (indexes existing documents too)
    fn ensure_index(&self, collection: &str, field: &FieldPath) -> Result<()>;

    /// Documents whose `field` is a string equal to `value`.
    ///
    /// Uses the equality index when one exists, otherwise scans.
    fn find_by_field(&self, collection: &str, field: &FieldPath, value: &str) -> Result<Vec<Document>>;

    /// Name of the database, recorded in backup manifests
    fn database_name(&self) -> String;
}
