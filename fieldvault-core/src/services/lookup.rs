//! Record lookup by identifier
//!
//! Reads go through the search hash, so only matching records are decrypted.

use std::sync::Arc;

use super::transform::DocumentTransform;
use crate::domain::result::{Error, OperationResult, Result};
use crate::domain::Document;
use crate::ports::DocumentStore;

pub struct LookupService {
    store: Arc<dyn DocumentStore>,
    transform: DocumentTransform,
}

impl LookupService {
    pub fn new(store: Arc<dyn DocumentStore>, transform: DocumentTransform) -> Self {
        Self { store, transform }
    }

    /// Decrypted records whose `field` equals `raw_value` after normalization
    pub fn find_by_identifier(&self, collection: &str, field: &str, raw_value: &str) -> Result<Vec<Document>> {
        let sensitive = self
            .transform
            .config()
            .field(field)
            .ok_or_else(|| Error::validation(format!("'{field}' is not a sensitive field of {collection}")))?;
        if !sensitive.hashable {
            return Err(Error::validation(format!(
                "'{field}' has no search hash and can't be looked up"
            )));
        }

        let Some(hash) = self.transform.hasher().generate_search_hash(
            &sensitive.name(),
            raw_value,
            sensitive.case_insensitive,
        )?
        else {
            return Ok(Vec::new());
        };

        let matches = self
            .store
            .find_by_field(collection, &sensitive.hash_path(), &hash)?;
        tracing::debug!(collection, field, matches = matches.len(), "identifier lookup");
        matches
            .iter()
            .map(|doc| self.transform.decrypt_document(doc))
            .collect()
    }

    /// One decrypted record by id
    pub fn get(&self, collection: &str, id: &str) -> Result<Document> {
        let doc = self
            .store
            .get(collection, id)?
            .ok_or_else(|| Error::not_found(format!("record {id} in {collection}")))?;
        self.transform.decrypt_document(&doc)
    }

    /// [`find_by_identifier`](Self::find_by_identifier) for outward callers;
    /// sealed-data failures come back as a generic message
    pub fn lookup(&self, collection: &str, field: &str, raw_value: &str) -> OperationResult<Vec<Document>> {
        OperationResult::from_sealed(self.find_by_identifier(collection, field, raw_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::duckdb::DuckDbDocumentStore;
    use crate::domain::result::GENERIC_READ_FAILURE;
    use crate::domain::SensitiveFieldConfig;
    use crate::services::cipher::FieldCipher;
    use crate::services::keys::KeyRing;
    use crate::services::search_hash::SearchHasher;
    use serde_json::json;

    fn transform(seed: u8) -> DocumentTransform {
        let keys = KeyRing::for_tests(seed);
        DocumentTransform::new(
            FieldCipher::new(keys.clone()),
            SearchHasher::new(keys),
            SensitiveFieldConfig::patients(),
        )
    }

    fn seeded_store(t: &DocumentTransform) -> Arc<dyn DocumentStore> {
        let store = DuckDbDocumentStore::open_in_memory().unwrap();
        for (id, nhs) in [("p1", "943 476 5919"), ("p2", "401 023 2137")] {
            let doc = Document::from_value(json!({"_id": id, "nhs_number": nhs})).unwrap();
            store.put("patients", &t.seal_document(&doc).unwrap()).unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn test_lookup_ignores_formatting() {
        let t = transform(1);
        let lookup = LookupService::new(seeded_store(&t), t);

        let found = lookup.find_by_identifier("patients", "nhs_number", "9434765919").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_map()["nhs_number"], "943 476 5919");

        assert!(lookup
            .find_by_identifier("patients", "nhs_number", "0000000000")
            .unwrap()
            .is_empty());
        assert!(lookup.find_by_identifier("patients", "nhs_number", "  ").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_or_unhashed_field_is_rejected() {
        let t = transform(1);
        let lookup = LookupService::new(seeded_store(&t), t);
        assert!(matches!(
            lookup.find_by_identifier("patients", "ward", "B3"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            lookup.find_by_identifier("patients", "demographics.first_name", "Ada"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_get_decrypts_and_reports_missing() {
        let t = transform(1);
        let lookup = LookupService::new(seeded_store(&t), t);
        assert_eq!(lookup.get("patients", "p2").unwrap().as_map()["nhs_number"], "401 023 2137");
        assert!(matches!(lookup.get("patients", "p9"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_crypto_failure_is_generic_at_boundary() {
        let sealing = transform(1);
        let store = seeded_store(&sealing);

        // a hash computed under key 1 so the match is found, decrypted under key 2
        let hash = sealing
            .hasher()
            .generate_search_hash("nhs_number", "9434765919", false)
            .unwrap()
            .unwrap();
        let matches = store
            .find_by_field("patients", &"nhs_number_hash".parse().unwrap(), &hash)
            .unwrap();
        assert_eq!(matches.len(), 1);

        let reading = transform(2);
        let failure: Result<Vec<Document>> = matches.iter().map(|d| reading.decrypt_document(d)).collect();
        let result = OperationResult::from_sealed(failure);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(GENERIC_READ_FAILURE));
    }
}
