// src/creds/diffed.rs

use k8s_openapi::api::core::v1::Secret;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::watch;

use crate::creds::secrets::{SecretPayload, extract_payload};
use crate::creds::state::{ChangeNotifier, CredentialSecretState, Payload};
use crate::creds::traits::CredentialStore;
use crate::error::{Result, RotationError};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Clone, Debug)]
pub enum GoogleCredentialSource {
    /// A credentials JSON document (`external_account`, `service_account`, ...).
    Json {
        kind: String,
        document: SecretPayload,
    },
    /// Application default credentials of the pod.
    DefaultChain,
}

/// OAuth2-capable credentials for the Google SDK clients.
#[derive(Clone, Debug)]
pub struct GoogleCredentials {
    pub scopes: Vec<String>,
    pub source: GoogleCredentialSource,
}

impl GoogleCredentials {
    pub fn uses_default_chain(&self) -> bool {
        matches!(self.source, GoogleCredentialSource::DefaultChain)
    }

    fn from_json(document: SecretPayload) -> Result<Self> {
        #[derive(Deserialize)]
        struct Header {
            #[serde(rename = "type")]
            kind: String,
        }

        // serde_json errors carry a position, never the offending input.
        let header: Header = document
            .use_secret(|bytes| serde_json::from_slice::<Header>(bytes))
            .map_err(|e| RotationError::Derivation(format!("invalid credentials JSON: {e}")))?;
        if header.kind.is_empty() {
            return Err(RotationError::Derivation(
                "credentials JSON has an empty `type`".into(),
            ));
        }

        Ok(Self {
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            source: GoogleCredentialSource::Json {
                kind: header.kind,
                document,
            },
        })
    }

    fn default_chain() -> Self {
        Self {
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            source: GoogleCredentialSource::DefaultChain,
        }
    }
}

/// Keeps the raw credentials JSON of a Secret in memory and notifies
/// subscribers only when its bytes actually change.
pub struct DiffedSecretStore {
    data_key: String,
    state: RwLock<CredentialSecretState>,
    changes: ChangeNotifier,
}

impl DiffedSecretStore {
    pub fn new(
        namespace: impl Into<String>,
        secret_name: impl Into<String>,
        data_key: impl Into<String>,
    ) -> Self {
        Self {
            data_key: data_key.into(),
            state: RwLock::new(CredentialSecretState::new(namespace, secret_name)),
            changes: ChangeNotifier::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.changes.generation()
    }

    /// Credentials built from the stored JSON, or the default chain when the
    /// Secret is absent.
    pub fn get_credentials(&self) -> Result<GoogleCredentials> {
        let document = match &self.state.read().payload {
            Payload::Inline(payload) if !payload.is_empty() => payload.clone(),
            _ => return Ok(GoogleCredentials::default_chain()),
        };
        GoogleCredentials::from_json(document)
    }

    fn upsert(&self, secret: &Secret) {
        let Some(payload) = extract_payload(secret, &self.data_key) else {
            tracing::info!(key = %self.data_key, "credentials key missing or empty, treating as delete");
            self.on_delete();
            return;
        };

        {
            let mut state = self.state.write();
            if let Payload::Inline(current) = &state.payload {
                if payload.use_secret(|next| current.same_bytes(next)) {
                    return;
                }
            }
            tracing::info!(
                namespace = %state.namespace,
                secret = %state.secret_name,
                payload_hash = %payload.short_digest(),
                "credentials changed"
            );
            let hash = payload.digest().to_string();
            state.set(Payload::Inline(payload), hash);
        }

        // Only after the new state is visible to readers.
        self.changes.notify();
    }
}

impl CredentialStore for DiffedSecretStore {
    type Credentials = GoogleCredentials;

    fn on_add(&self, secret: &Secret) {
        self.upsert(secret);
    }

    fn on_update(&self, secret: &Secret) {
        self.upsert(secret);
    }

    /// Always notifies, even when already absent.
    fn on_delete(&self) {
        self.state.write().clear();
        tracing::info!("credentials secret removed");
        self.changes.notify();
    }

    fn snapshot(&self) -> CredentialSecretState {
        self.state.read().clone()
    }

    fn derive(&self) -> Result<GoogleCredentials> {
        self.get_credentials()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::secrets::test_support::secret_with;

    const DOC_A: &[u8] = br#"{"type":"external_account","audience":"//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/p/providers/a"}"#;
    const DOC_B: &[u8] = br#"{"type":"external_account","audience":"//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/p/providers/b"}"#;

    fn store() -> DiffedSecretStore {
        DiffedSecretStore::new("stackrox", "gcp-cloud-credentials", "credentials")
    }

    #[test]
    fn first_observation_notifies() {
        let store = store();
        store.on_add(&secret_with("credentials", DOC_A));
        assert_eq!(store.generation(), 1);
        assert!(store.snapshot().present);
    }

    #[test]
    fn identical_updates_notify_at_most_once() {
        let store = store();
        store.on_update(&secret_with("credentials", DOC_A));
        store.on_update(&secret_with("credentials", DOC_A));
        assert_eq!(store.generation(), 1);

        store.on_update(&secret_with("credentials", DOC_B));
        assert_eq!(store.generation(), 2);
    }

    #[test]
    fn hash_tracks_content_before_notification() {
        let store = store();
        store.on_add(&secret_with("credentials", DOC_A));
        let rx = store.subscribe();
        let first = store.snapshot().payload_hash;

        store.on_update(&secret_with("credentials", DOC_B));
        assert!(rx.has_changed().unwrap());
        assert_ne!(store.snapshot().payload_hash, first);
    }

    #[test]
    fn repeated_delete_notifies_every_time() {
        let store = store();
        store.on_add(&secret_with("credentials", DOC_A));
        store.on_delete();
        store.on_delete();
        assert_eq!(store.generation(), 3);
        assert!(!store.snapshot().present);
        assert!(store.snapshot().payload_hash.is_none());
    }

    #[test]
    fn credentials_come_from_json_with_fixed_scope() {
        let store = store();
        assert!(store.get_credentials().unwrap().uses_default_chain());

        store.on_add(&secret_with("credentials", DOC_A));
        let creds = store.get_credentials().unwrap();
        assert_eq!(creds.scopes, vec![CLOUD_PLATFORM_SCOPE.to_string()]);
        match creds.source {
            GoogleCredentialSource::Json { kind, document } => {
                assert_eq!(kind, "external_account");
                assert!(document.same_bytes(DOC_A));
            }
            GoogleCredentialSource::DefaultChain => panic!("expected JSON credentials"),
        }

        store.on_delete();
        assert!(store.get_credentials().unwrap().uses_default_chain());
    }

    #[test]
    fn malformed_json_is_a_derivation_error() {
        let store = store();
        store.on_add(&secret_with("credentials", b"{not json"));
        assert!(matches!(
            store.get_credentials(),
            Err(RotationError::Derivation(_))
        ));

        store.on_update(&secret_with("credentials", br#"{"type":""}"#));
        assert!(matches!(
            store.get_credentials(),
            Err(RotationError::Derivation(_))
        ));
    }
}
