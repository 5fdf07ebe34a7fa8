//! DuckDB document store implementation

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use duckdb::{params, Connection};

use crate::domain::result::{Error, Result};
use crate::domain::{Document, FieldPath, Filter, Page};
use crate::migrations::MIGRATIONS;
use crate::ports::DocumentStore;
use crate::services::{SchemaMigrationResult, SchemaMigrationService};

/// Maximum number of retries when database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400, 800ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
}

/// Document store backed by a single DuckDB file
///
/// Bodies are stored as JSON text and filters are evaluated in Rust; the
/// `field_index` table gives equality lookups on indexed fields without
/// touching other documents.
pub struct DuckDbDocumentStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl DuckDbDocumentStore {
    /// Open (or create) the store at `db_path` and apply pending migrations
    ///
    /// Retries with exponential backoff while another process holds the file.
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    let store = Self {
                        conn: Mutex::new(conn),
                        db_path: Some(db_path.to_path_buf()),
                    };
                    store.ensure_schema()?;
                    return Ok(store);
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        tracing::warn!(
                            "Database busy, retrying in {}ms (attempt {}/{}): {}",
                            delay.as_millis(),
                            attempt + 1,
                            MAX_RETRIES,
                            err_msg
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::store(format!("Failed to open database after {} retries", MAX_RETRIES))
        }))
    }

    /// Throwaway in-memory store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory_with_flags(config)?),
            db_path: None,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn try_open_connection(db_path: &Path) -> Result<Connection> {
        // Extension autoloading stays off; JSON is linked statically via the "json" feature
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Ok(Connection::open_with_flags(db_path, config)?)
    }

    /// Run pending schema migrations
    pub fn run_migrations(&self) -> Result<SchemaMigrationResult> {
        let conn = self.lock()?;
        SchemaMigrationService::new(&conn, MIGRATIONS).run_pending()
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.run_migrations()?;
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Size of the database file on disk (0 for in-memory stores)
    pub fn get_db_size(&self) -> Result<u64> {
        match &self.db_path {
            Some(path) => Ok(std::fs::metadata(path)?.len()),
            None => Ok(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::store(format!("Lock poisoned: {}", e)))
    }
}

/// Fields with an equality index in `collection`
fn indexed_fields(conn: &Connection, collection: &str) -> Result<Vec<FieldPath>> {
    let mut stmt = conn.prepare("SELECT field FROM sys_indexes WHERE collection = ? ORDER BY field")?;
    let mut rows = stmt.query([collection])?;
    let mut fields = Vec::new();
    while let Some(row) = rows.next()? {
        let field: String = row.get(0)?;
        fields.push(field.parse()?);
    }
    Ok(fields)
}

/// Write `doc` and its index entries; caller owns the transaction
fn write_document(
    conn: &Connection,
    collection: &str,
    id: &str,
    doc: &Document,
    indexed: &[FieldPath],
) -> Result<()> {
    let body = serde_json::to_string(doc)?;
    conn.execute(
        "INSERT INTO documents (collection, doc_id, body) VALUES (?, ?, ?)",
        params![collection, id, body],
    )?;
    for field in indexed {
        if let Some(value) = doc.get_str(field) {
            conn.execute(
                "INSERT INTO field_index (collection, field, value, doc_id) VALUES (?, ?, ?, ?)",
                params![collection, field.to_string(), value, id],
            )?;
        }
    }
    Ok(())
}

fn remove_document(conn: &Connection, collection: &str, id: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM documents WHERE collection = ? AND doc_id = ?",
        params![collection, id],
    )?;
    conn.execute(
        "DELETE FROM field_index WHERE collection = ? AND doc_id = ?",
        params![collection, id],
    )?;
    Ok(removed)
}

/// Ids must be non-empty: keyset paging starts after the empty string
fn document_id(doc: &Document) -> Result<String> {
    let id = doc.require_id()?;
    if id.is_empty() {
        return Err(Error::validation("document _id must not be empty"));
    }
    Ok(id)
}

fn parse_body(body: &str) -> Result<Document> {
    Ok(serde_json::from_str(body)?)
}

impl DocumentStore for DuckDbDocumentStore {
    fn collections(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT collection FROM documents ORDER BY collection")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut result = Vec::new();
        for name in names {
            result.push(name?);
        }
        Ok(result)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let conn = self.lock()?;
        if *filter == Filter::All {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?",
                [collection],
                |row| row.get(0),
            )?;
            return Ok(count as u64);
        }

        let mut stmt = conn.prepare("SELECT body FROM documents WHERE collection = ?")?;
        let mut rows = stmt.query([collection])?;
        let mut count = 0u64;
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            if filter.matches(&parse_body(&body)?) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn find(&self, collection: &str, filter: &Filter, page: &Page) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        let after = page.after.as_deref().unwrap_or("");
        let mut stmt = conn.prepare(
            "SELECT body FROM documents WHERE collection = ? AND doc_id > ? ORDER BY doc_id",
        )?;
        let mut rows = stmt.query(params![collection, after])?;

        let mut docs = Vec::new();
        while let Some(row) = rows.next()? {
            // limit 0 means unbounded
            if page.limit > 0 && docs.len() >= page.limit {
                break;
            }
            let body: String = row.get(0)?;
            let doc = parse_body(&body)?;
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM documents WHERE collection = ? AND doc_id = ?")?;
        let mut rows = stmt.query(params![collection, id])?;
        match rows.next()? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(parse_body(&body)?))
            }
            None => Ok(None),
        }
    }

    fn put(&self, collection: &str, doc: &Document) -> Result<()> {
        let id = document_id(doc)?;
        let mut conn = self.lock()?;
        let indexed = indexed_fields(&conn, collection)?;

        let tx = conn.transaction()?;
        remove_document(&tx, collection, &id)?;
        write_document(&tx, collection, &id, doc, &indexed)?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = remove_document(&tx, collection, id)?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn replace_collection(&self, collection: &str, docs: &[Document]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = document_id(doc)?;
            if !seen.insert(id.clone()) {
                return Err(Error::validation(format!(
                    "duplicate _id '{}' in collection '{}'",
                    id, collection
                )));
            }
            ids.push(id);
        }

        let mut conn = self.lock()?;
        let indexed = indexed_fields(&conn, collection)?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM documents WHERE collection = ?", [collection])?;
        tx.execute("DELETE FROM field_index WHERE collection = ?", [collection])?;
        for (doc, id) in docs.iter().zip(&ids) {
            write_document(&tx, collection, id, doc, &indexed)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn ensure_index(&self, collection: &str, field: &FieldPath) -> Result<()> {
        let mut conn = self.lock()?;
        if indexed_fields(&conn, collection)?.contains(field) {
            return Ok(());
        }

        let mut entries = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT doc_id, body FROM documents WHERE collection = ?")?;
            let mut rows = stmt.query([collection])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let body: String = row.get(1)?;
                if let Some(value) = parse_body(&body)?.get_str(field) {
                    entries.push((id, value.to_string()));
                }
            }
        }

        let field_name = field.to_string();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sys_indexes (collection, field) VALUES (?, ?)",
            params![collection, field_name],
        )?;
        for (id, value) in &entries {
            tx.execute(
                "INSERT INTO field_index (collection, field, value, doc_id) VALUES (?, ?, ?, ?)",
                params![collection, field_name, value, id],
            )?;
        }
        tx.commit()?;
        tracing::debug!(collection, field = %field, "created field index");
        Ok(())
    }

    fn find_by_field(&self, collection: &str, field: &FieldPath, value: &str) -> Result<Vec<Document>> {
        let indexed = {
            let conn = self.lock()?;
            indexed_fields(&conn, collection)?.contains(field)
        };
        if !indexed {
            return self.find(
                collection,
                &Filter::Equals(field.clone(), value.to_string()),
                &Page::default(),
            );
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.body
             FROM field_index f
             JOIN documents d ON d.collection = f.collection AND d.doc_id = f.doc_id
             WHERE f.collection = ? AND f.field = ? AND f.value = ?
             ORDER BY d.doc_id",
        )?;
        let mut rows = stmt.query(params![collection, field.to_string(), value])?;
        let mut docs = Vec::new();
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            docs.push(parse_body(&body)?);
        }
        Ok(docs)
    }

    fn database_name(&self) -> String {
        self.db_path
            .as_deref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "memory".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn store() -> DuckDbDocumentStore {
        DuckDbDocumentStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_put_get_replace() {
        let store = store();
        store.put("patients", &doc(json!({"_id": "p1", "mrn": "A1"}))).unwrap();
        store.put("patients", &doc(json!({"_id": "p1", "mrn": "B2"}))).unwrap();

        let fetched = store.get("patients", "p1").unwrap().unwrap();
        assert_eq!(fetched.as_map()["mrn"], "B2");
        assert_eq!(store.count("patients", &Filter::All).unwrap(), 1);
        assert!(store.get("patients", "missing").unwrap().is_none());
        assert!(store.get("episodes", "p1").unwrap().is_none());
    }

    #[test]
    fn test_put_requires_id() {
        let store = store();
        assert!(matches!(
            store.put("patients", &doc(json!({"mrn": "A1"}))),
            Err(Error::Validation(_))
        ));
        assert!(store.put("patients", &doc(json!({"_id": ""}))).is_err());
    }

    #[test]
    fn test_keyset_pages() {
        let store = store();
        for i in 0..7 {
            store.put("patients", &doc(json!({"_id": format!("p{i}")}))).unwrap();
        }

        let first = store.find("patients", &Filter::All, &Page::first(3)).unwrap();
        assert_eq!(first.len(), 3);
        let last_id = first.last().unwrap().id().unwrap();
        let second = store
            .find("patients", &Filter::All, &Page::after(last_id, 3))
            .unwrap();
        assert_eq!(second[0].id().as_deref(), Some("p3"));

        let all = store.find("patients", &Filter::All, &Page::default()).unwrap();
        assert_eq!(all.len(), 7);
    }

    #[test]
    fn test_count_with_filter() {
        let store = store();
        store.put("patients", &doc(json!({"_id": "1", "mrn": "ENC:x"}))).unwrap();
        store.put("patients", &doc(json!({"_id": "2", "mrn": "plain"}))).unwrap();
        store.put("patients", &doc(json!({"_id": "3"}))).unwrap();

        let mrn: FieldPath = "mrn".parse().unwrap();
        let encrypted = Filter::StartsWith(mrn.clone(), "ENC:".into());
        assert_eq!(store.count("patients", &encrypted).unwrap(), 1);
        assert_eq!(store.count("patients", &Filter::Missing(mrn)).unwrap(), 1);
    }

    #[test]
    fn test_field_index_tracks_updates() {
        let store = store();
        let hash: FieldPath = "mrn_hash".parse().unwrap();
        store.put("patients", &doc(json!({"_id": "1", "mrn_hash": "aa"}))).unwrap();
        store.ensure_index("patients", &hash).unwrap();
        store.ensure_index("patients", &hash).unwrap();

        assert_eq!(store.find_by_field("patients", &hash, "aa").unwrap().len(), 1);

        store.put("patients", &doc(json!({"_id": "1", "mrn_hash": "bb"}))).unwrap();
        assert!(store.find_by_field("patients", &hash, "aa").unwrap().is_empty());
        assert_eq!(store.find_by_field("patients", &hash, "bb").unwrap().len(), 1);

        assert!(store.delete("patients", "1").unwrap());
        assert!(!store.delete("patients", "1").unwrap());
        assert!(store.find_by_field("patients", &hash, "bb").unwrap().is_empty());
    }

    #[test]
    fn test_find_by_unindexed_field_scans() {
        let store = store();
        store.put("patients", &doc(json!({"_id": "1", "ward": "A"}))).unwrap();
        store.put("patients", &doc(json!({"_id": "2", "ward": "B"}))).unwrap();
        let found = store.find_by_field("patients", &"ward".parse().unwrap(), "B").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id().as_deref(), Some("2"));
    }

    #[test]
    fn test_replace_collection() {
        let store = store();
        store.put("patients", &doc(json!({"_id": "old"}))).unwrap();
        store.put("episodes", &doc(json!({"_id": "e1"}))).unwrap();

        store
            .replace_collection("patients", &[doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))])
            .unwrap();
        assert!(store.get("patients", "old").unwrap().is_none());
        assert_eq!(store.count("patients", &Filter::All).unwrap(), 2);
        assert_eq!(store.collections().unwrap(), vec!["episodes", "patients"]);

        let dup = [doc(json!({"_id": "a"})), doc(json!({"_id": "a"}))];
        assert!(store.replace_collection("patients", &dup).is_err());
        assert_eq!(store.count("patients", &Filter::All).unwrap(), 2);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error("IO Error: Could not set lock on file: Resource temporarily unavailable"));
        assert!(is_retryable_error("The process cannot access the file because it is being used by another process"));
        assert!(!is_retryable_error("Catalog Error: Table does not exist"));
    }
}
