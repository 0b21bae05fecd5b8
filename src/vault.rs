//! Credential vault — authenticated symmetric encryption for sensitive
//! configuration fields.
//!
//! AES-256-GCM with a fresh random nonce per call; the nonce is prepended to
//! the ciphertext and the combined bytes are base64-encoded into a single
//! string. The key is derived once at construction from the configured
//! secret, zero-padded or truncated to 32 bytes.
//!
//! Only two settings fields are ever touched: `apiKey`, and — for the
//! http-compatible provider — every value inside the `headers` map.
//! Decryption of settings is best-effort: values that fail to decrypt are
//! returned unchanged on the assumption that legacy plaintext data may
//! exist. That fallback is explicit in [`Vault::try_decrypt`] returning
//! `Option` rather than hidden in a catch.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use tracing::warn;

use crate::error::GatewayError;
use crate::providers::ProviderKind;

/// GCM standard nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Settings key holding a provider credential.
const API_KEY_FIELD: &str = "apiKey";
/// Settings key holding the http-compatible provider's extra header map.
const HEADERS_FIELD: &str = "headers";

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Derive the cipher key from `secret`: bytes are copied into a 32-byte
    /// buffer, truncating long secrets and zero-padding short ones.
    pub fn new(secret: &str) -> Self {
        let mut key_bytes = [0u8; 32];
        let src = secret.as_bytes();
        let n = src.len().min(32);
        key_bytes[..n].copy_from_slice(&src[..n]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Self { cipher }
    }

    /// Encrypt `plaintext` and return `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, GatewayError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::Encryption("AES-GCM encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`Vault::encrypt`].
    ///
    /// Fails with `Decryption` if the input is not valid base64, is too
    /// short to contain a nonce, or the authentication tag does not verify.
    pub fn decrypt(&self, encoded: &str) -> Result<String, GatewayError> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| GatewayError::Decryption(format!("not valid base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(GatewayError::Decryption("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| GatewayError::Decryption("authentication tag verification failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| GatewayError::Decryption("plaintext is not valid utf-8".into()))
    }

    /// Two-step form of the lenient settings decrypt: `None` means "could
    /// not decrypt — caller decides the fallback".
    pub fn try_decrypt(&self, encoded: &str) -> Option<String> {
        self.decrypt(encoded).ok()
    }

    /// Encrypt the known-sensitive fields of `settings` in place.
    ///
    /// `apiKey` for every kind; additionally each value of the `headers`
    /// map for the http-compatible kind.
    pub fn encrypt_sensitive_fields(
        &self,
        kind: ProviderKind,
        settings: &mut Value,
    ) -> Result<(), GatewayError> {
        if let Some(api_key) = settings.get(API_KEY_FIELD).and_then(Value::as_str) {
            let encrypted = self.encrypt(api_key)?;
            settings[API_KEY_FIELD] = Value::String(encrypted);
        }
        if kind == ProviderKind::OpenAiCompatible {
            if let Some(headers) = settings.get_mut(HEADERS_FIELD).and_then(Value::as_object_mut) {
                for (_, v) in headers.iter_mut() {
                    if let Some(s) = v.as_str() {
                        *v = Value::String(self.encrypt(s)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Decrypt the known-sensitive fields of `settings` in place.
    ///
    /// Values that fail to decrypt are left unchanged — legacy data may be
    /// stored in plaintext. This is a compatibility behavior, not a
    /// security boundary.
    pub fn decrypt_sensitive_fields(&self, kind: ProviderKind, settings: &mut Value) {
        if let Some(api_key) = settings.get(API_KEY_FIELD).and_then(Value::as_str) {
            match self.try_decrypt(api_key) {
                Some(plain) => settings[API_KEY_FIELD] = Value::String(plain),
                None => warn!("apiKey did not decrypt; passing stored value through"),
            }
        }
        if kind == ProviderKind::OpenAiCompatible {
            if let Some(headers) = settings.get_mut(HEADERS_FIELD).and_then(Value::as_object_mut) {
                for (name, v) in headers.iter_mut() {
                    if let Some(s) = v.as_str() {
                        match self.try_decrypt(s) {
                            Some(plain) => *v = Value::String(plain),
                            None => warn!(header = %name, "header value did not decrypt; passing through"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vault() -> Vault {
        Vault::new("test-vault-secret")
    }

    #[test]
    fn round_trip() {
        let v = vault();
        for input in ["hello", "", "多字节 ✓ émoji 🔑", "sk-abc123"] {
            let blob = v.encrypt(input).unwrap();
            assert_eq!(v.decrypt(&blob).unwrap(), input, "round trip failed for {input:?}");
        }
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let v = vault();
        let a = v.encrypt("same").unwrap();
        let b = v.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_byte_fails_verification() {
        let v = vault();
        let blob = v.encrypt("payload").unwrap();
        let mut bytes = BASE64.decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(matches!(v.decrypt(&tampered), Err(GatewayError::Decryption(_))));
    }

    #[test]
    fn malformed_input_fails() {
        let v = vault();
        assert!(v.decrypt("not base64 !!!").is_err());
        assert!(v.decrypt(&BASE64.encode(b"short")).is_err());
        assert!(v.try_decrypt("plaintext-key").is_none());
    }

    #[test]
    fn different_secret_cannot_decrypt() {
        let blob = vault().encrypt("secret").unwrap();
        let other = Vault::new("a completely different secret");
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn long_secret_is_truncated_deterministically() {
        let long = "x".repeat(100);
        let a = Vault::new(&long);
        let b = Vault::new(&long);
        let blob = a.encrypt("data").unwrap();
        assert_eq!(b.decrypt(&blob).unwrap(), "data");
    }

    #[test]
    fn sensitive_fields_round_trip() {
        let v = vault();
        let mut settings = json!({
            "model": "gpt-4o-mini",
            "apiKey": "sk-plain",
            "headers": { "X-Org": "acme" }
        });
        v.encrypt_sensitive_fields(ProviderKind::OpenAiCompatible, &mut settings).unwrap();
        assert_ne!(settings["apiKey"], "sk-plain");
        assert_ne!(settings["headers"]["X-Org"], "acme");
        // model is not sensitive
        assert_eq!(settings["model"], "gpt-4o-mini");

        v.decrypt_sensitive_fields(ProviderKind::OpenAiCompatible, &mut settings);
        assert_eq!(settings["apiKey"], "sk-plain");
        assert_eq!(settings["headers"]["X-Org"], "acme");
    }

    #[test]
    fn headers_untouched_for_other_kinds() {
        let v = vault();
        let mut settings = json!({ "apiKey": "k", "headers": { "X-Org": "acme" } });
        v.encrypt_sensitive_fields(ProviderKind::CloudMultimodal, &mut settings).unwrap();
        assert_eq!(settings["headers"]["X-Org"], "acme");
    }

    #[test]
    fn plaintext_fallback_leaves_value() {
        let v = vault();
        let mut settings = json!({ "apiKey": "legacy-plaintext-key" });
        v.decrypt_sensitive_fields(ProviderKind::Local, &mut settings);
        assert_eq!(settings["apiKey"], "legacy-plaintext-key");
    }
}
