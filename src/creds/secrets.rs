// src/creds/secrets.rs

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use secrecy::{ExposeSecret, Secret as Protected};
use sha2::{Digest, Sha256};

/// SecretPayload is an ephemeral, memory-safe wrapper for the raw bytes found
/// under the credentials key of a Kubernetes Secret (an STS shared-config blob
/// or an external-account JSON document).
///
/// 1. It cannot be accidentally logged: `Debug` prints only the digest.
/// 2. When the last clone is dropped the bytes are zeroized.
#[derive(Clone)]
pub struct SecretPayload {
    bytes: Arc<Protected<Vec<u8>>>,
    digest: String,
}

impl SecretPayload {
    /// Wraps raw bytes in a zeroizing Secret. Ownership of `raw` moves
    /// straight into the wrapper so no plaintext copy is left behind.
    pub fn new(raw: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&raw));
        Self {
            bytes: Arc::new(Protected::new(raw)),
            digest,
        }
    }

    /// Exposes the bytes for the duration of `action` only; the slice cannot
    /// escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.bytes.expose_secret().as_slice())
    }

    /// Hex SHA-256 of the payload. Safe to log.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// First 12 hex chars of the digest, for log lines.
    pub fn short_digest(&self) -> &str {
        &self.digest[..12]
    }

    pub fn len(&self) -> usize {
        self.use_secret(<[u8]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte-for-byte comparison, never via the digest alone.
    pub fn same_bytes(&self, other: &[u8]) -> bool {
        self.use_secret(|mine| mine == other)
    }
}

impl fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPayload")
            .field("len", &self.len())
            .field("sha256", &self.short_digest())
            .finish()
    }
}

/// Pulls `key` out of a Secret. A missing key and an empty value are the
/// same thing as far as rotation is concerned: nothing to use.
pub fn extract_payload(secret: &Secret, key: &str) -> Option<SecretPayload> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.clone().into_bytes())
        })?;

    if bytes.is_empty() {
        return None;
    }
    Some(SecretPayload::new(bytes))
}


#[cfg(test)]
mod tests {
    use super::test_support::secret_with;
    use super::*;

    #[test]
    fn missing_or_empty_key_yields_nothing() {
        assert!(extract_payload(&Secret::default(), "credentials").is_none());
        assert!(extract_payload(&secret_with("other", b"x"), "credentials").is_none());
        assert!(extract_payload(&secret_with("credentials", b""), "credentials").is_none());
    }

    #[test]
    fn debug_never_prints_payload() {
        let payload = extract_payload(&secret_with("credentials", b"top-secret"), "credentials")
            .unwrap();
        let rendered = format!("{payload:?}");
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains(payload.short_digest()));
        assert!(payload.same_bytes(b"top-secret"));
        assert!(!payload.same_bytes(b"top-secreT"));
    }

    #[test]
    fn string_data_is_honoured() {
        let mut secret = Secret::default();
        secret.string_data = Some([("credentials".to_string(), "abc".to_string())].into());
        let payload = extract_payload(&secret, "credentials").unwrap();
        assert_eq!(payload.len(), 3);
    }
}
