//! Migration runner - moves a collection to encrypted, hashed fields
//!
//! Only documents that still need work are selected, and each one is
//! rewritten with a single `put`. Running the migration again after an
//! interruption (or after it finished) converges on the same state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::cipher::{is_encrypted, ENCRYPTION_MARKER};
use super::transform::DocumentTransform;
use crate::domain::result::{Error, Result};
use crate::domain::{Document, FieldStatus, Filter, Page};
use crate::ports::DocumentStore;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_VERIFY_SAMPLE: usize = 10;

/// Page size used when scanning a whole collection
const SCAN_PAGE: usize = 500;
/// Failed document ids kept in a report
const MAX_FAILED_IDS: usize = 50;

/// Status counts for one sensitive field
#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldAnalysis {
    pub field: String,
    pub absent: u64,
    pub plaintext: u64,
    pub encrypted_no_hash: u64,
    pub encrypted_with_hash: u64,
}

impl FieldAnalysis {
    pub fn pending(&self) -> u64 {
        self.plaintext + self.encrypted_no_hash
    }

    fn record(&mut self, status: FieldStatus) {
        match status {
            FieldStatus::Absent => self.absent += 1,
            FieldStatus::Plaintext => self.plaintext += 1,
            FieldStatus::EncryptedNoHash => self.encrypted_no_hash += 1,
            FieldStatus::EncryptedWithHash => self.encrypted_with_hash += 1,
        }
    }
}

/// Migration state of a whole collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionAnalysis {
    pub collection: String,
    pub total_documents: u64,
    /// Documents with at least one field that needs work
    pub pending_documents: u64,
    pub fields: Vec<FieldAnalysis>,
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    /// Count what would change without writing
    pub dry_run: bool,
    /// Documents sampled per field after a real run; 0 skips verification
    pub verify_sample: usize,
    /// Stop after selecting this many documents
    pub max_documents: Option<u64>,
    /// Checked between batches
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            verify_sample: DEFAULT_VERIFY_SAMPLE,
            max_documents: None,
            cancel: None,
        }
    }
}

/// Reported after each batch
#[derive(Debug, Clone, Serialize)]
pub struct MigrationProgress {
    pub batch: u64,
    pub processed: u64,
    pub migrated: u64,
    pub errors: u64,
    /// Documents needing work when the run started
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationFailure {
    pub id: String,
    pub field: String,
    pub reason: String,
}

/// Outcome of decrypting a sample of migrated values
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub collection: String,
    pub checked: u64,
    pub failures: Vec<VerificationFailure>,
    /// Encrypted fields with no encrypted value to sample
    pub fields_without_samples: Vec<String>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(MigrationIntegrity)` if any sampled value failed
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }
        let fields: Vec<&str> = {
            let mut f: Vec<&str> = self.failures.iter().map(|f| f.field.as_str()).collect();
            f.dedup();
            f
        };
        Err(Error::MigrationIntegrity(format!(
            "{} of {} sampled values in '{}' failed verification (fields: {})",
            self.failures.len(),
            self.checked,
            self.collection,
            fields.join(", ")
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub collection: String,
    pub dry_run: bool,
    /// Documents selected as needing work
    pub scanned: u64,
    /// Documents rewritten (or that would be, in a dry run)
    pub migrated: u64,
    /// Selected but already in their final form
    pub unchanged: u64,
    pub errors: u64,
    pub failed_ids: Vec<String>,
    /// Stopped by cancellation or `max_documents` before the end
    pub interrupted: bool,
    pub verification: Option<VerificationReport>,
}

pub struct MigrationRunner {
    store: Arc<dyn DocumentStore>,
    transform: DocumentTransform,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn DocumentStore>, transform: DocumentTransform) -> Self {
        Self { store, transform }
    }

    /// Count field states across the collection; never writes
    pub fn analyze(&self, collection: &str) -> Result<CollectionAnalysis> {
        let config = self.transform.config();
        let mut fields: Vec<FieldAnalysis> = config
            .fields()
            .iter()
            .map(|f| FieldAnalysis {
                field: f.name(),
                ..FieldAnalysis::default()
            })
            .collect();
        let mut total = 0u64;
        let mut pending = 0u64;

        self.scan(collection, &Filter::All, |doc| {
            total += 1;
            let mut needs_work = false;
            for (field, analysis) in config.fields().iter().zip(fields.iter_mut()) {
                let status = self.transform.field_status(doc, field);
                needs_work |= status.needs_work();
                analysis.record(status);
            }
            if needs_work {
                pending += 1;
            }
        })?;

        Ok(CollectionAnalysis {
            collection: collection.to_string(),
            total_documents: total,
            pending_documents: pending,
            fields,
        })
    }

    /// Migrate the collection in batches.
    ///
    /// Per-document failures are counted and logged; the run continues with
    /// the next document. Store failures while selecting abort the run.
    pub fn run(
        &self,
        collection: &str,
        options: &MigrationOptions,
        mut progress: impl FnMut(&MigrationProgress),
    ) -> Result<MigrationReport> {
        if options.batch_size == 0 {
            return Err(Error::validation("batch size must be at least 1"));
        }

        let filter = self.transform.pending_filter();
        let pending = self.store.count(collection, &filter)?;
        if !options.dry_run {
            for field in self.transform.config().hashable_fields() {
                self.store.ensure_index(collection, &field.hash_path())?;
            }
        }

        let mut report = MigrationReport {
            collection: collection.to_string(),
            dry_run: options.dry_run,
            scanned: 0,
            migrated: 0,
            unchanged: 0,
            errors: 0,
            failed_ids: Vec::new(),
            interrupted: false,
            verification: None,
        };
        let mut after: Option<String> = None;
        let mut batch_no = 0u64;

        loop {
            if options
                .cancel
                .as_ref()
                .map(|c| c.load(Ordering::SeqCst))
                .unwrap_or(false)
            {
                tracing::warn!(collection, scanned = report.scanned, "migration cancelled");
                report.interrupted = true;
                break;
            }

            let mut limit = options.batch_size;
            if let Some(max) = options.max_documents {
                let remaining = max.saturating_sub(report.scanned);
                if remaining == 0 {
                    report.interrupted = true;
                    break;
                }
                limit = limit.min(remaining as usize);
            }

            let page = Page {
                after: after.clone(),
                limit,
            };
            let batch = self.store.find(collection, &filter, &page)?;
            let Some(last) = batch.last() else {
                break;
            };
            after = last.id();
            batch_no += 1;

            for doc in &batch {
                report.scanned += 1;
                if options.dry_run {
                    report.migrated += 1;
                    continue;
                }
                match self.migrate_document(collection, doc) {
                    Ok(true) => report.migrated += 1,
                    Ok(false) => report.unchanged += 1,
                    Err(e) => {
                        let id = doc.id().unwrap_or_default();
                        // no field values in the message; ids only
                        tracing::warn!(collection, id = %id, error = %e, "failed to migrate document");
                        report.errors += 1;
                        if report.failed_ids.len() < MAX_FAILED_IDS {
                            report.failed_ids.push(id);
                        }
                    }
                }
            }

            tracing::debug!(collection, batch = batch_no, scanned = report.scanned, "migration batch done");
            progress(&MigrationProgress {
                batch: batch_no,
                processed: report.scanned,
                migrated: report.migrated,
                errors: report.errors,
                pending,
            });

            if batch.len() < limit {
                break;
            }
        }

        if !options.dry_run && options.verify_sample > 0 && report.migrated > 0 {
            report.verification = Some(self.verify(collection, options.verify_sample)?);
        }

        tracing::info!(
            collection,
            migrated = report.migrated,
            errors = report.errors,
            dry_run = options.dry_run,
            "field migration finished"
        );
        Ok(report)
    }

    /// Rewrite one document in its sealed form; `false` if nothing changed
    fn migrate_document(&self, collection: &str, doc: &Document) -> Result<bool> {
        let sealed = self.transform.seal_document(doc)?;
        if sealed == *doc {
            return Ok(false);
        }
        self.store.put(collection, &sealed)?;
        Ok(true)
    }

    /// Decrypt a sample of encrypted values per field and check them.
    ///
    /// A value fails if it doesn't decrypt, decrypts to itself, still carries
    /// the marker, or its stored search hash doesn't match.
    pub fn verify(&self, collection: &str, sample_size: usize) -> Result<VerificationReport> {
        let mut report = VerificationReport {
            collection: collection.to_string(),
            checked: 0,
            failures: Vec::new(),
            fields_without_samples: Vec::new(),
        };

        for field in self.transform.config().encrypted_fields() {
            let filter = Filter::StartsWith(field.path.clone(), ENCRYPTION_MARKER.to_string());
            let sample = self.store.find(collection, &filter, &Page::first(sample_size))?;
            if sample.is_empty() {
                report.fields_without_samples.push(field.name());
                continue;
            }

            for doc in &sample {
                report.checked += 1;
                let Some(stored) = doc.get_str(&field.path) else {
                    continue;
                };
                let mut fail = |reason: &str| {
                    report.failures.push(VerificationFailure {
                        id: doc.id().unwrap_or_default(),
                        field: field.name(),
                        reason: reason.to_string(),
                    })
                };

                let decrypted = match self.transform.cipher().decrypt_field(&field.name(), stored) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        fail(&format!("decryption failed: {e}"));
                        continue;
                    }
                };
                if decrypted == stored {
                    fail("value unchanged by decryption");
                    continue;
                }
                if is_encrypted(&decrypted) {
                    fail("decrypted value still carries the marker");
                    continue;
                }
                if field.hashable {
                    // only this field is rehashed; sibling fields are checked on their own turn
                    let expected = match self.transform.hasher().generate_search_hash(
                        &field.name(),
                        &decrypted,
                        field.case_insensitive,
                    ) {
                        Ok(expected) => expected,
                        Err(e) => {
                            fail(&format!("search hash could not be computed: {e}"));
                            continue;
                        }
                    };
                    match (doc.get_str(&field.hash_path()), expected) {
                        (None, None) => {}
                        (None, Some(_)) => fail("search hash missing"),
                        (Some(hash), expected) if expected.as_deref() != Some(hash) => {
                            fail("search hash does not match value")
                        }
                        (Some(_), _) => {}
                    }
                }
            }
        }

        if !report.fields_without_samples.is_empty() {
            tracing::info!(
                collection,
                fields = ?report.fields_without_samples,
                "no encrypted values to sample"
            );
        }
        Ok(report)
    }

    /// Visit every document matching `filter`, page by page
    fn scan(&self, collection: &str, filter: &Filter, mut visit: impl FnMut(&Document)) -> Result<()> {
        let mut after: Option<String> = None;
        loop {
            let page = Page {
                after: after.clone(),
                limit: SCAN_PAGE,
            };
            let docs = self.store.find(collection, filter, &page)?;
            for doc in &docs {
                visit(doc);
            }
            match docs.last() {
                Some(last) if docs.len() == SCAN_PAGE => after = last.id(),
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::duckdb::DuckDbDocumentStore;
    use crate::domain::SensitiveFieldConfig;
    use crate::services::cipher::FieldCipher;
    use crate::services::keys::KeyRing;
    use crate::services::search_hash::SearchHasher;
    use serde_json::json;

    fn setup() -> (Arc<DuckDbDocumentStore>, MigrationRunner) {
        let store = Arc::new(DuckDbDocumentStore::open_in_memory().unwrap());
        let keys = KeyRing::for_tests(11);
        let transform = DocumentTransform::new(
            FieldCipher::new(keys.clone()),
            SearchHasher::new(keys),
            SensitiveFieldConfig::patients(),
        );
        let runner = MigrationRunner::new(store.clone(), transform);
        (store, runner)
    }

    fn put(store: &DuckDbDocumentStore, value: serde_json::Value) {
        store.put("patients", &Document::from_value(value).unwrap()).unwrap();
    }

    #[test]
    fn test_analyze_counts_states() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "1", "mrn": "X1"}));
        put(&store, json!({"_id": "2", "mrn": ""}));
        put(&store, json!({"_id": "3"}));

        let analysis = runner.analyze("patients").unwrap();
        assert_eq!(analysis.total_documents, 3);
        assert_eq!(analysis.pending_documents, 1);
        let mrn = analysis.fields.iter().find(|f| f.field == "mrn").unwrap();
        assert_eq!(mrn.plaintext, 1);
        assert_eq!(mrn.absent, 2);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "1", "mrn": "X1"}));

        let options = MigrationOptions {
            dry_run: true,
            ..MigrationOptions::default()
        };
        let report = runner.run("patients", &options, |_| {}).unwrap();
        assert_eq!(report.migrated, 1);
        assert!(report.verification.is_none());
        assert_eq!(store.get("patients", "1").unwrap().unwrap().as_map()["mrn"], "X1");
    }

    #[test]
    fn test_bad_document_is_counted_and_skipped() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "1", "mrn": {"nested": true}}));
        put(&store, json!({"_id": "2", "mrn": "X2"}));

        let report = runner.run("patients", &MigrationOptions::default(), |_| {}).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed_ids, vec!["1"]);
        assert_eq!(report.migrated, 1);
        assert!(report.verification.unwrap().is_ok());
    }

    #[test]
    fn test_progress_per_batch() {
        let (store, runner) = setup();
        for i in 0..5 {
            put(&store, json!({"_id": format!("p{i}"), "mrn": format!("M{i}")}));
        }
        let mut batches = Vec::new();
        let options = MigrationOptions {
            batch_size: 2,
            ..MigrationOptions::default()
        };
        runner
            .run("patients", &options, |p| batches.push(p.processed))
            .unwrap();
        assert_eq!(batches, vec![2, 4, 5]);
    }

    #[test]
    fn test_cancellation_between_batches() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "1", "mrn": "X1"}));
        let cancel = Arc::new(AtomicBool::new(true));
        let options = MigrationOptions {
            cancel: Some(cancel),
            ..MigrationOptions::default()
        };
        let report = runner.run("patients", &options, |_| {}).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn test_verify_detects_wrong_hash() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "1", "mrn": "X1"}));
        runner.run("patients", &MigrationOptions::default(), |_| {}).unwrap();

        let mut doc = store.get("patients", "1").unwrap().unwrap();
        doc.set_path(&"mrn_hash".parse().unwrap(), json!("00")).unwrap();
        store.put("patients", &doc).unwrap();

        let report = runner.verify("patients", 10).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.into_result(), Err(Error::MigrationIntegrity(_))));
    }

    #[test]
    fn test_verify_reports_foreign_sibling_without_aborting() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "1", "mrn": "X1"}));
        runner.run("patients", &MigrationOptions::default(), |_| {}).unwrap();

        // nhs_number sealed under a different key, mrn left intact
        let foreign = FieldCipher::new(KeyRing::for_tests(12));
        let mut doc = store.get("patients", "1").unwrap().unwrap();
        doc.set_path(
            &"nhs_number".parse().unwrap(),
            json!(foreign.encrypt_field("nhs_number", "9434765919").unwrap()),
        )
        .unwrap();
        store.put("patients", &doc).unwrap();

        let report = runner.verify("patients", 10).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].field, "nhs_number");
        assert!(report.failures[0].reason.starts_with("decryption failed"));
    }

    #[test]
    fn test_blank_identifier_does_not_stay_pending() {
        let (store, runner) = setup();
        put(&store, json!({"_id": "w1", "mrn": "   "}));
        put(&store, json!({"_id": "w2", "mrn": "X2"}));

        let first = runner.run("patients", &MigrationOptions::default(), |_| {}).unwrap();
        assert_eq!(first.migrated, 1);

        let second = runner.run("patients", &MigrationOptions::default(), |_| {}).unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(runner.analyze("patients").unwrap().pending_documents, 0);
        assert_eq!(store.get("patients", "w1").unwrap().unwrap().as_map()["mrn"], "   ");
    }
}
