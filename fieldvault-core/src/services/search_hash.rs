//! Search hash generator - keyed digests for equality lookup
//!
//! A search hash lets a record be found by an identifier without decrypting
//! every record. It is HMAC-SHA256 under the search sub-key, so an attacker
//! with the database but without the key can't brute-force short
//! identifiers.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::keys::KeyRing;
use crate::domain::result::{Error, Result};
use crate::domain::{FieldPath, HASH_SUFFIX};

type HmacSha256 = Hmac<Sha256>;

/// Canonical form hashed for a raw identifier: all whitespace removed,
/// folded to lower case when the field is case-insensitive
pub fn normalize(raw: &str, case_insensitive: bool) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if case_insensitive {
        compact.to_lowercase()
    } else {
        compact
    }
}

/// Sibling field that stores the search hash of `path`
pub fn hash_field_name(path: &FieldPath) -> FieldPath {
    path.with_leaf_suffix(HASH_SUFFIX)
}

#[derive(Clone)]
pub struct SearchHasher {
    keys: Arc<KeyRing>,
}

impl SearchHasher {
    pub fn new(keys: Arc<KeyRing>) -> Self {
        Self { keys }
    }

    /// Lowercase hex digest of the normalized value, or `None` when nothing
    /// is left after normalization.
    ///
    /// The field name is mixed in, so equal values in different fields hash
    /// differently.
    pub fn generate_search_hash(
        &self,
        field_name: &str,
        plaintext: &str,
        case_insensitive: bool,
    ) -> Result<Option<String>> {
        let normalized = normalize(plaintext, case_insensitive);
        if normalized.is_empty() {
            return Ok(None);
        }

        let mut mac = HmacSha256::new_from_slice(self.keys.search_key())
            .map_err(|e| Error::configuration(format!("invalid search key: {e}")))?;
        mac.update(field_name.as_bytes());
        mac.update(&[0u8]);
        mac.update(normalized.as_bytes());
        Ok(Some(hex::encode(mac.finalize().into_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher(seed: u8) -> SearchHasher {
        SearchHasher::new(KeyRing::for_tests(seed))
    }

    #[test]
    fn test_whitespace_insensitive() {
        let h = hasher(1);
        let a = h.generate_search_hash("nhs_number", "943 476 5919", false).unwrap();
        let b = h.generate_search_hash("nhs_number", "9434765919", false).unwrap();
        let c = h.generate_search_hash("nhs_number", " 943\t476\n5919 ", false).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);

        let digest = a.unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_case_folding_only_when_requested() {
        let h = hasher(1);
        assert_eq!(
            h.generate_search_hash("mrn", "ab12", true).unwrap(),
            h.generate_search_hash("mrn", "AB12", true).unwrap()
        );
        assert_ne!(
            h.generate_search_hash("nhs_number", "ab12", false).unwrap(),
            h.generate_search_hash("nhs_number", "AB12", false).unwrap()
        );
    }

    #[test]
    fn test_empty_input_has_no_hash() {
        let h = hasher(1);
        assert_eq!(h.generate_search_hash("mrn", "", true).unwrap(), None);
        assert_eq!(h.generate_search_hash("mrn", "  \t ", true).unwrap(), None);
    }

    #[test]
    fn test_keyed_and_field_separated() {
        let a = hasher(1).generate_search_hash("mrn", "X1", true).unwrap();
        let b = hasher(2).generate_search_hash("mrn", "X1", true).unwrap();
        let c = hasher(1).generate_search_hash("hospital_number", "X1", true).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_field_name() {
        let nested: FieldPath = "demographics.postcode".parse().unwrap();
        assert_eq!(hash_field_name(&nested).to_string(), "demographics.postcode_hash");
    }
}
