//! Sensitive field configuration
//!
//! A static table (field path -> flags) is the single source of truth for
//! which values get encrypted and which get a search hash. Attributes not in
//! the table pass through untouched.

use serde::{Deserialize, Serialize};

use super::document::{Document, FieldPath};
use super::result::{Error, Result};

/// Suffix of the sibling field holding a search hash
pub const HASH_SUFFIX: &str = "_hash";

/// Collection the default table applies to
pub const PATIENTS_COLLECTION: &str = "patients";

/// (path, encrypted, hashable, case_insensitive)
const PATIENT_FIELDS: &[(&str, bool, bool, bool)] = &[
    ("nhs_number", true, true, false),
    ("mrn", true, true, true),
    ("hospital_number", true, false, false),
    ("demographics.first_name", true, false, false),
    ("demographics.last_name", true, false, false),
    ("demographics.date_of_birth", true, false, false),
    ("demographics.deceased_date", true, false, false),
    ("demographics.postcode", true, false, false),
];

/// One row of the sensitive field table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveField {
    pub path: FieldPath,
    #[serde(default = "default_true")]
    pub encrypted: bool,
    #[serde(default)]
    pub hashable: bool,
    /// Search hash folds case before hashing (identifiers such as MRNs)
    #[serde(default)]
    pub case_insensitive: bool,
}

fn default_true() -> bool {
    true
}

impl SensitiveField {
    pub fn new(path: FieldPath) -> Self {
        Self {
            path,
            encrypted: true,
            hashable: false,
            case_insensitive: false,
        }
    }

    pub fn hashable(mut self) -> Self {
        self.hashable = true;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Path of the sibling search-hash field
    pub fn hash_path(&self) -> FieldPath {
        self.path.with_leaf_suffix(HASH_SUFFIX)
    }

    /// Name bound into every ciphertext of this field
    pub fn name(&self) -> String {
        self.path.to_string()
    }
}

/// Sensitive field table for one collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SensitiveField>", into = "Vec<SensitiveField>")]
pub struct SensitiveFieldConfig {
    fields: Vec<SensitiveField>,
}

impl TryFrom<Vec<SensitiveField>> for SensitiveFieldConfig {
    type Error = Error;

    fn try_from(fields: Vec<SensitiveField>) -> Result<Self> {
        Self::new(fields)
    }
}

impl From<SensitiveFieldConfig> for Vec<SensitiveField> {
    fn from(config: SensitiveFieldConfig) -> Self {
        config.fields
    }
}

impl SensitiveFieldConfig {
    pub fn new(fields: Vec<SensitiveField>) -> Result<Self> {
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.path == field.path) {
                return Err(Error::configuration(format!(
                    "sensitive field '{}' is listed twice",
                    field.path
                )));
            }
            if field.path.leaf().ends_with(HASH_SUFFIX) {
                return Err(Error::configuration(format!(
                    "sensitive field '{}' collides with the search hash naming scheme",
                    field.path
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Table used for the patients collection
    pub fn patients() -> Self {
        let fields = PATIENT_FIELDS
            .iter()
            .map(|(path, encrypted, hashable, case_insensitive)| SensitiveField {
                path: match path.split_once('.') {
                    Some((parent, leaf)) => FieldPath::nested(parent, leaf),
                    None => FieldPath::top(*path),
                },
                encrypted: *encrypted,
                hashable: *hashable,
                case_insensitive: *case_insensitive,
            })
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[SensitiveField] {
        &self.fields
    }

    pub fn encrypted_fields(&self) -> impl Iterator<Item = &SensitiveField> {
        self.fields.iter().filter(|f| f.encrypted)
    }

    pub fn hashable_fields(&self) -> impl Iterator<Item = &SensitiveField> {
        self.fields.iter().filter(|f| f.hashable)
    }

    /// Look up a row by its dotted path
    pub fn field(&self, path: &str) -> Option<&SensitiveField> {
        self.fields.iter().find(|f| f.path.to_string() == path)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-field migration state: `Absent -> Plaintext -> EncryptedNoHash -> EncryptedWithHash`.
///
/// Fields without a search hash go straight from `Plaintext` to
/// `EncryptedWithHash`, which is terminal for every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Absent,
    Plaintext,
    EncryptedNoHash,
    EncryptedWithHash,
}

impl FieldStatus {
    /// Classify a field of `doc` given the encryption marker
    pub fn of(doc: &Document, field: &SensitiveField, marker: &str) -> Self {
        let value = match doc.get_path(&field.path) {
            None | Some(serde_json::Value::Null) => return FieldStatus::Absent,
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => return FieldStatus::Absent,
            Some(v) => v,
        };
        let encrypted = value.as_str().map(|s| s.starts_with(marker)).unwrap_or(false);
        let hash_present = !matches!(
            doc.get_path(&field.hash_path()),
            None | Some(serde_json::Value::Null)
        );

        let hash_missing = field.hashable && !hash_present;

        if field.encrypted && !encrypted {
            return FieldStatus::Plaintext;
        }
        match (encrypted, hash_missing) {
            (true, true) => FieldStatus::EncryptedNoHash,
            // hash-only field whose hash has not been computed yet
            (false, true) => FieldStatus::Plaintext,
            (_, false) => FieldStatus::EncryptedWithHash,
        }
    }

    pub fn needs_work(self) -> bool {
        matches!(self, FieldStatus::Plaintext | FieldStatus::EncryptedNoHash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patients_table() {
        let config = SensitiveFieldConfig::patients();
        assert_eq!(config.encrypted_fields().count(), 8);
        let hashable: Vec<String> = config.hashable_fields().map(|f| f.name()).collect();
        assert_eq!(hashable, vec!["nhs_number", "mrn"]);
        assert!(config.field("mrn").unwrap().case_insensitive);
        assert_eq!(
            config.field("demographics.postcode").unwrap().hash_path().to_string(),
            "demographics.postcode_hash"
        );
    }

    #[test]
    fn test_duplicate_fields_rejected() {
        let f = SensitiveField::new("mrn".parse().unwrap());
        assert!(SensitiveFieldConfig::new(vec![f.clone(), f]).is_err());
        let bad = SensitiveField::new("mrn_hash".parse().unwrap());
        assert!(SensitiveFieldConfig::new(vec![bad]).is_err());
    }

    #[test]
    fn test_field_status_transitions() {
        let field = SensitiveField::new("nhs_number".parse().unwrap()).hashable();
        let status = |v| FieldStatus::of(&Document::from_value(v).unwrap(), &field, "ENC:");

        assert_eq!(status(json!({"_id": "1"})), FieldStatus::Absent);
        assert_eq!(status(json!({"_id": "1", "nhs_number": null})), FieldStatus::Absent);
        assert_eq!(status(json!({"_id": "1", "nhs_number": ""})), FieldStatus::Absent);
        assert_eq!(status(json!({"_id": "1", "nhs_number": " \t "})), FieldStatus::Absent);
        assert_eq!(status(json!({"_id": "1", "nhs_number": "943"})), FieldStatus::Plaintext);
        assert_eq!(
            status(json!({"_id": "1", "nhs_number": "ENC:xx"})),
            FieldStatus::EncryptedNoHash
        );
        assert_eq!(
            status(json!({"_id": "1", "nhs_number": "ENC:xx", "nhs_number_hash": "ab"})),
            FieldStatus::EncryptedWithHash
        );
    }

    #[test]
    fn test_unhashed_field_is_terminal_once_encrypted() {
        let field = SensitiveField::new("demographics.postcode".parse().unwrap());
        let doc = Document::from_value(json!({"_id": "1", "demographics": {"postcode": "ENC:zz"}})).unwrap();
        assert_eq!(FieldStatus::of(&doc, &field, "ENC:"), FieldStatus::EncryptedWithHash);
        assert!(!FieldStatus::of(&doc, &field, "ENC:").needs_work());
    }
}
