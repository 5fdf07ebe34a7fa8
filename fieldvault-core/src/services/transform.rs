//! Document transform - applies the field cipher and search hashes to the
//! configured sensitive fields of a record
//!
//! Every operation returns a new document; the input is never mutated.
//! Attributes outside the sensitive field table pass through untouched.

use serde_json::Value;

use super::cipher::{is_encrypted, FieldCipher, ENCRYPTION_MARKER};
use super::search_hash::SearchHasher;
use crate::domain::result::{Error, Result};
use crate::domain::{json_kind, Document, FieldStatus, Filter, SensitiveField, SensitiveFieldConfig};

#[derive(Clone)]
pub struct DocumentTransform {
    cipher: FieldCipher,
    hasher: SearchHasher,
    config: SensitiveFieldConfig,
}

/// Scalar text to encrypt or hash; `None` when the field counts as absent
fn scalar_text(field: &SensitiveField, value: Option<&Value>) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        // blank strings carry nothing to protect and normalize to no search hash
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(Error::validation(format!(
            "sensitive field '{}' holds a {}; only scalar values can be encrypted",
            field.path,
            json_kind(other)
        ))),
    }
}

impl DocumentTransform {
    pub fn new(cipher: FieldCipher, hasher: SearchHasher, config: SensitiveFieldConfig) -> Self {
        Self { cipher, hasher, config }
    }

    pub fn config(&self) -> &SensitiveFieldConfig {
        &self.config
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    pub fn hasher(&self) -> &SearchHasher {
        &self.hasher
    }

    /// Copy of `doc` with every present, non-blank, not yet encrypted
    /// sensitive value replaced by its ciphertext.
    ///
    /// Numbers and booleans are encrypted as their text form.
    pub fn encrypt_document(&self, doc: &Document) -> Result<Document> {
        let mut out = doc.clone();
        for field in self.config.encrypted_fields() {
            let value = doc.get_path(&field.path);
            if let Some(Value::String(s)) = value {
                if is_encrypted(s) {
                    continue;
                }
            }
            if let Some(plaintext) = scalar_text(field, value)? {
                let sealed = self.cipher.encrypt_field(&field.name(), &plaintext)?;
                out.set_path(&field.path, Value::String(sealed))?;
            }
        }
        Ok(out)
    }

    /// Copy of `doc` with encrypted values replaced by plaintext.
    ///
    /// Legacy plaintext passes through, so partially migrated collections
    /// read correctly. Cryptographic failures propagate.
    pub fn decrypt_document(&self, doc: &Document) -> Result<Document> {
        let mut out = doc.clone();
        for field in self.config.encrypted_fields() {
            if let Some(value) = doc.get_str(&field.path) {
                if is_encrypted(value) {
                    let plaintext = self.cipher.decrypt_field(&field.name(), value)?;
                    out.set_path(&field.path, Value::String(plaintext))?;
                }
            }
        }
        Ok(out)
    }

    /// Plaintext of one sensitive field, decrypting if needed
    pub fn plaintext_of(&self, doc: &Document, field: &SensitiveField) -> Result<Option<String>> {
        match doc.get_str(&field.path) {
            Some(value) if is_encrypted(value) => {
                Ok(Some(self.cipher.decrypt_field(&field.name(), value)?))
            }
            _ => scalar_text(field, doc.get_path(&field.path)),
        }
    }

    /// Copy of `doc` with the search hash set for every hashable field that
    /// has a value
    pub fn add_search_hashes(&self, doc: &Document) -> Result<Document> {
        let mut out = doc.clone();
        for field in self.config.hashable_fields() {
            let Some(plaintext) = self.plaintext_of(doc, field)? else {
                continue;
            };
            let hash = self
                .hasher
                .generate_search_hash(&field.name(), &plaintext, field.case_insensitive)?;
            if let Some(hash) = hash {
                out.set_path(&field.hash_path(), Value::String(hash))?;
            }
        }
        Ok(out)
    }

    /// Hash then encrypt: the form in which records are written
    pub fn seal_document(&self, doc: &Document) -> Result<Document> {
        let hashed = self.add_search_hashes(doc)?;
        self.encrypt_document(&hashed)
    }

    pub fn field_status(&self, doc: &Document, field: &SensitiveField) -> FieldStatus {
        FieldStatus::of(doc, field, ENCRYPTION_MARKER)
    }

    /// Any configured field still plaintext or missing its hash
    pub fn needs_migration(&self, doc: &Document) -> bool {
        self.config
            .fields()
            .iter()
            .any(|f| self.field_status(doc, f).needs_work())
    }

    /// Store-side filter matching documents that [`needs_migration`](Self::needs_migration)
    pub fn pending_filter(&self) -> Filter {
        let mut clauses = Vec::new();
        for field in self.config.fields() {
            if field.encrypted {
                clauses.push(Filter::And(vec![
                    Filter::NonEmpty(field.path.clone()),
                    Filter::not(Filter::StartsWith(
                        field.path.clone(),
                        ENCRYPTION_MARKER.to_string(),
                    )),
                ]));
            }
            if field.hashable {
                clauses.push(Filter::And(vec![
                    Filter::NonEmpty(field.path.clone()),
                    Filter::Missing(field.hash_path()),
                ]));
            }
        }
        Filter::Or(clauses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::keys::KeyRing;
    use serde_json::json;

    fn transform() -> DocumentTransform {
        let keys = KeyRing::for_tests(5);
        DocumentTransform::new(
            FieldCipher::new(keys.clone()),
            SearchHasher::new(keys),
            SensitiveFieldConfig::patients(),
        )
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_encrypt_only_touches_sensitive_fields() {
        let t = transform();
        let input = doc(json!({
            "_id": "p1",
            "nhs_number": "9434765919",
            "ward": "B3",
            "demographics": {"first_name": "Ada", "postcode": "AB1 2CD", "sex": "F"}
        }));
        let out = t.encrypt_document(&input).unwrap();

        assert!(is_encrypted(out.as_map()["nhs_number"].as_str().unwrap()));
        assert!(is_encrypted(out.as_map()["demographics"]["postcode"].as_str().unwrap()));
        assert_eq!(out.as_map()["ward"], "B3");
        assert_eq!(out.as_map()["demographics"]["sex"], "F");
        assert_eq!(input.as_map()["nhs_number"], "9434765919");
    }

    #[test]
    fn test_encrypt_is_idempotent() {
        let t = transform();
        let once = t.encrypt_document(&doc(json!({"_id": "p1", "mrn": "X1"}))).unwrap();
        let twice = t.encrypt_document(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_absent_null_and_empty_are_left_alone() {
        let t = transform();
        let input = doc(json!({"_id": "p1", "mrn": "", "hospital_number": null}));
        let out = t.encrypt_document(&input).unwrap();
        assert_eq!(out, input);
        assert!(out.get_path(&"demographics.postcode".parse().unwrap()).is_none());
    }

    #[test]
    fn test_numbers_are_encrypted_as_text() {
        let t = transform();
        let out = t
            .encrypt_document(&doc(json!({"_id": "p1", "hospital_number": 12345})))
            .unwrap();
        let back = t.decrypt_document(&out).unwrap();
        assert_eq!(back.as_map()["hospital_number"], "12345");
    }

    #[test]
    fn test_structured_value_is_rejected() {
        let t = transform();
        let result = t.encrypt_document(&doc(json!({"_id": "p1", "mrn": ["a", "b"]})));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_decrypt_mixed_document() {
        let t = transform();
        let sealed = t.encrypt_document(&doc(json!({"_id": "p1", "mrn": "X1"}))).unwrap();
        let mut mixed = sealed.as_map().clone();
        mixed.insert("nhs_number".into(), json!("9434765919"));

        let out = t.decrypt_document(&Document::from_map(mixed)).unwrap();
        assert_eq!(out.as_map()["mrn"], "X1");
        assert_eq!(out.as_map()["nhs_number"], "9434765919");
    }

    #[test]
    fn test_search_hashes_from_plain_and_sealed() {
        let t = transform();
        let plain = doc(json!({"_id": "p1", "mrn": "ab 12"}));
        let from_plain = t.add_search_hashes(&plain).unwrap();
        let from_sealed = t.add_search_hashes(&t.encrypt_document(&plain).unwrap()).unwrap();

        assert_eq!(from_plain.as_map()["mrn_hash"], from_sealed.as_map()["mrn_hash"]);
        assert!(from_plain.as_map().get("nhs_number_hash").is_none());
    }

    #[test]
    fn test_seal_reaches_terminal_state() {
        let t = transform();
        let sealed = t
            .seal_document(&doc(json!({"_id": "p1", "nhs_number": "943 476 5919", "mrn": "X1"})))
            .unwrap();
        assert!(!t.needs_migration(&sealed));
        assert!(!t.pending_filter().matches(&sealed));

        let field = t.config().field("nhs_number").unwrap().clone();
        assert_eq!(t.field_status(&sealed, &field), FieldStatus::EncryptedWithHash);
    }

    #[test]
    fn test_pending_filter_agrees_with_status() {
        let t = transform();
        let cases = [
            json!({"_id": "1"}),
            json!({"_id": "2", "mrn": "X1"}),
            json!({"_id": "3", "mrn": "ENC:abc"}),
            json!({"_id": "4", "mrn": "ENC:abc", "mrn_hash": "00"}),
            json!({"_id": "5", "demographics": {"last_name": "Lovelace"}}),
            json!({"_id": "6", "mrn": ""}),
        ];
        for case in cases {
            let d = doc(case);
            assert_eq!(t.pending_filter().matches(&d), t.needs_migration(&d), "{:?}", d);
        }
    }
}
