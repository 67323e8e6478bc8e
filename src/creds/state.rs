// src/creds/state.rs

use std::path::PathBuf;

use tokio::sync::watch;

use crate::creds::secrets::SecretPayload;

/// Where the credential material for a Secret currently lives.
#[derive(Clone, Debug, Default)]
pub enum Payload {
    #[default]
    Absent,
    /// Bytes were mirrored to this local file.
    Mirrored(PathBuf),
    /// Bytes are held in memory.
    Inline(SecretPayload),
}

/// Latest observed state of one credentials Secret.
///
/// Invariant: `present == false` implies `payload` is `Absent` and
/// `payload_hash` is `None`.
#[derive(Clone, Debug)]
pub struct CredentialSecretState {
    pub namespace: String,
    pub secret_name: String,
    pub present: bool,
    pub payload: Payload,
    pub payload_hash: Option<String>,
}

impl CredentialSecretState {
    pub fn new(namespace: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            secret_name: secret_name.into(),
            present: false,
            payload: Payload::Absent,
            payload_hash: None,
        }
    }

    pub(crate) fn set(&mut self, payload: Payload, hash: String) {
        self.present = true;
        self.payload = payload;
        self.payload_hash = Some(hash);
    }

    pub(crate) fn clear(&mut self) {
        self.present = false;
        self.payload = Payload::Absent;
        self.payload_hash = None;
    }
}

/// Generation counter published by a store every time it decides its
/// credentials changed. Receivers see coalesced bumps, never torn state: the
/// bump always happens after the store's write lock is released.
#[derive(Debug)]
pub struct ChangeNotifier {
    tx: watch::Sender<u64>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
