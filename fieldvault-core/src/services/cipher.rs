//! Field cipher - authenticated encryption of single scalar values
//!
//! An encrypted value is the text `ENC:` followed by URL-safe base64 (no
//! padding) of `version || nonce || ciphertext || tag`. The field name is
//! bound as associated data, so a ciphertext copied into another field does
//! not decrypt.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;

use super::keys::KeyRing;
use crate::domain::result::{CryptoFailure, Error, Result};

/// Prefix that marks a stored value as encrypted
pub const ENCRYPTION_MARKER: &str = "ENC:";

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// True iff `value` carries the encryption marker
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTION_MARKER)
}

fn associated_data(version: u8, field_name: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + field_name.len());
    aad.push(version);
    aad.extend_from_slice(field_name.as_bytes());
    aad
}

/// Encrypts and decrypts individual field values with the field sub-key
#[derive(Clone)]
pub struct FieldCipher {
    keys: Arc<KeyRing>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyRing>) -> Self {
        Self { keys }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.keys.field_key()))
    }

    /// Encrypt `plaintext` for `field_name` with a fresh random nonce.
    ///
    /// Does not check for an existing marker; callers test
    /// [`is_encrypted`] first so values are never double-encrypted.
    pub fn encrypt_field(&self, field_name: &str, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = associated_data(FORMAT_VERSION, field_name);
        let sealed = self
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| Error::encoding(format!("could not encrypt value for '{field_name}'")))?;

        let mut payload = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        payload.push(FORMAT_VERSION);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        Ok(format!("{}{}", ENCRYPTION_MARKER, URL_SAFE_NO_PAD.encode(payload)))
    }

    /// Decrypt a marker-bearing value produced by [`encrypt_field`](Self::encrypt_field)
    /// for the same field name.
    pub fn decrypt_field(&self, field_name: &str, value: &str) -> Result<String> {
        let encoded = value
            .strip_prefix(ENCRYPTION_MARKER)
            .ok_or_else(|| Error::encoding("value does not carry the encryption marker"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|_| Error::encoding("encrypted value is not valid base64"))?;

        if payload.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(Error::encoding("encrypted value is too short"));
        }
        let version = payload[0];
        if version != FORMAT_VERSION {
            return Err(Error::encoding(format!(
                "unsupported encrypted value version {version}"
            )));
        }
        let nonce = Nonce::from_slice(&payload[1..1 + NONCE_LEN]);
        let aad = associated_data(version, field_name);

        let plaintext = self
            .cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: &payload[1 + NONCE_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Cryptographic(CryptoFailure::TagMismatch))?;

        String::from_utf8(plaintext).map_err(|_| Error::encoding("decrypted value is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cipher(seed: u8) -> FieldCipher {
        FieldCipher::new(KeyRing::for_tests(seed))
    }

    #[test]
    fn test_roundtrip_and_marker() {
        let c = cipher(1);
        let sealed = c.encrypt_field("nhs_number", "943 476 5919").unwrap();
        assert!(is_encrypted(&sealed));
        assert!(!sealed.contains("943"));
        assert_eq!(c.decrypt_field("nhs_number", &sealed).unwrap(), "943 476 5919");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let c = cipher(1);
        let a = c.encrypt_field("mrn", "X1").unwrap();
        let b = c.encrypt_field("mrn", "X1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_field_name_is_bound() {
        let c = cipher(1);
        let sealed = c.encrypt_field("mrn", "X1").unwrap();
        assert!(matches!(
            c.decrypt_field("hospital_number", &sealed),
            Err(Error::Cryptographic(CryptoFailure::TagMismatch))
        ));
    }

    #[test]
    fn test_wrong_key_fails_tag() {
        let sealed = cipher(1).encrypt_field("mrn", "X1").unwrap();
        assert!(matches!(
            cipher(2).decrypt_field("mrn", &sealed),
            Err(Error::Cryptographic(CryptoFailure::TagMismatch))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_tag() {
        let c = cipher(1);
        let sealed = c.encrypt_field("mrn", "X1").unwrap();
        let mut payload = URL_SAFE_NO_PAD
            .decode(&sealed[ENCRYPTION_MARKER.len()..])
            .unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let tampered = format!("{}{}", ENCRYPTION_MARKER, URL_SAFE_NO_PAD.encode(payload));

        assert!(matches!(
            c.decrypt_field("mrn", &tampered),
            Err(Error::Cryptographic(CryptoFailure::TagMismatch))
        ));
    }

    #[test]
    fn test_malformed_payloads_are_encoding_errors() {
        let c = cipher(1);
        for value in ["plain", "ENC:!!!", "ENC:AAAA", "ENC:"] {
            assert!(
                matches!(c.decrypt_field("mrn", value), Err(Error::Encoding(_))),
                "{value}"
            );
        }

        let mut payload = vec![9u8];
        payload.extend_from_slice(&[0u8; NONCE_LEN + TAG_LEN]);
        let unknown_version = format!("{}{}", ENCRYPTION_MARKER, URL_SAFE_NO_PAD.encode(payload));
        assert!(matches!(
            c.decrypt_field("mrn", &unknown_version),
            Err(Error::Encoding(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(field in "[a-z_]{1,12}", value in "\\PC{0,64}") {
            let c = cipher(3);
            let sealed = c.encrypt_field(&field, &value).unwrap();
            prop_assert!(is_encrypted(&sealed));
            prop_assert_eq!(c.decrypt_field(&field, &sealed).unwrap(), value);
        }
    }
}
