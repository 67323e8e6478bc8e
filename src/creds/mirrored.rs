// src/creds/mirrored.rs

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Secret;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::creds::secrets::{SecretPayload, extract_payload};
use crate::creds::state::{ChangeNotifier, CredentialSecretState, Payload};
use crate::creds::traits::CredentialStore;
use crate::error::{Result, RotationError};

/// Options handed to the AWS SDK session constructor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsSessionOptions {
    /// Shared-config files to load credentials from, in order.
    pub shared_config_files: Vec<PathBuf>,
    /// When false the SDK resolves credentials through its default chain.
    pub shared_config_enabled: bool,
}

impl AwsSessionOptions {
    pub fn shared_config(path: PathBuf) -> Self {
        Self {
            shared_config_files: vec![path],
            shared_config_enabled: true,
        }
    }

    pub fn default_chain() -> Self {
        Self {
            shared_config_files: Vec::new(),
            shared_config_enabled: false,
        }
    }

    pub fn uses_default_chain(&self) -> bool {
        !self.shared_config_enabled
    }
}

/// Mirrors the STS shared-config blob of a Secret to a local file the AWS SDK
/// can read, and tracks whether that file is currently usable.
///
/// The file is owned exclusively by this store.
pub struct MirroredSecretStore {
    data_key: String,
    mirror_path: PathBuf,
    state: RwLock<CredentialSecretState>,
    changes: ChangeNotifier,
}

impl MirroredSecretStore {
    pub fn new(
        namespace: impl Into<String>,
        secret_name: impl Into<String>,
        data_key: impl Into<String>,
        mirror_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_key: data_key.into(),
            mirror_path: mirror_path.into(),
            state: RwLock::new(CredentialSecretState::new(namespace, secret_name)),
            changes: ChangeNotifier::new(),
        }
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    pub fn generation(&self) -> u64 {
        self.changes.generation()
    }

    /// Session options for the current state. Without a mirrored file the
    /// SDK falls back to its ambient default chain; that is not an error.
    pub fn new_session(&self) -> Result<AwsSessionOptions> {
        let state = self.state.read();
        match (&state.payload, state.present) {
            (Payload::Mirrored(path), true) => {
                if !path.is_file() {
                    return Err(RotationError::Derivation(format!(
                        "mirrored credentials file {} disappeared",
                        path.display()
                    )));
                }
                Ok(AwsSessionOptions::shared_config(path.clone()))
            }
            _ => Ok(AwsSessionOptions::default_chain()),
        }
    }

    fn upsert(&self, secret: &Secret) {
        let Some(payload) = extract_payload(secret, &self.data_key) else {
            tracing::info!(
                path = %self.mirror_path.display(),
                key = %self.data_key,
                "credentials key missing or empty, treating as delete"
            );
            self.on_delete();
            return;
        };

        let changed = {
            let mut state = self.state.write();
            let was_present = state.present;
            let same = state.payload_hash.as_deref() == Some(payload.digest());

            match write_mirror(&self.mirror_path, &payload) {
                Ok(()) => {
                    tracing::info!(
                        namespace = %state.namespace,
                        secret = %state.secret_name,
                        payload_hash = %payload.short_digest(),
                        "mirrored credentials to {}",
                        self.mirror_path.display()
                    );
                    state.set(
                        Payload::Mirrored(self.mirror_path.clone()),
                        payload.digest().to_string(),
                    );
                    !(was_present && same)
                }
                Err(e) => {
                    // The SDK will use the default chain until the next event.
                    tracing::error!(
                        namespace = %state.namespace,
                        secret = %state.secret_name,
                        error = %e,
                        "failed to mirror credentials, falling back to default chain"
                    );
                    state.clear();
                    // A previous payload must not outlive the state that owned it.
                    self.remove_mirror();
                    was_present
                }
            }
        };

        if changed {
            self.changes.notify();
        }
    }

    fn remove_mirror(&self) {
        match fs::remove_file(&self.mirror_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                error = %e,
                "failed to remove mirrored credentials file {}",
                self.mirror_path.display()
            ),
        }
    }
}

impl CredentialStore for MirroredSecretStore {
    type Credentials = AwsSessionOptions;

    fn on_add(&self, secret: &Secret) {
        self.upsert(secret);
    }

    fn on_update(&self, secret: &Secret) {
        self.upsert(secret);
    }

    fn on_delete(&self) {
        let was_present = {
            let mut state = self.state.write();
            let was_present = state.present;
            state.clear();
            self.remove_mirror();
            was_present
        };
        if was_present {
            tracing::info!(path = %self.mirror_path.display(), "credentials secret removed");
            self.changes.notify();
        }
    }

    fn snapshot(&self) -> CredentialSecretState {
        self.state.read().clone()
    }

    fn derive(&self) -> Result<AwsSessionOptions> {
        self.new_session()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn shutdown(&self) {
        let mut state = self.state.write();
        state.clear();
        self.remove_mirror();
    }
}

/// Writes `payload` to `path` through a `0600` temp file and an atomic rename,
/// so the SDK never reads a half-written file.
fn write_mirror(path: &Path, payload: &SecretPayload) -> std::result::Result<(), RotationError> {
    let wrap = |source: io::Error| RotationError::MirrorWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(wrap)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    // 🛡️ Plaintext is only exposed inside this synchronous closure.
    let written = payload.use_secret(|bytes| {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    });

    if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(wrap(e));
    }
    Ok(())
}
