// 🛡️ Credential rotation core: stores, token cache, client handles and the
// coordinator that wires them together.

pub mod traits;      // Cross-component contracts
pub mod secrets;     // Memory hygiene (SecretPayload)
pub mod state;       // Secret state & change generations
pub mod mirrored;    // File-mirrored store (AWS shared config)
pub mod diffed;      // In-memory diffed store (Google credentials JSON)
pub mod token_cache; // Cached OAuth2 tokens with forced invalidation
pub mod handle;      // Drain-before-swap client handles
pub mod feed;        // Secret change feeds (Kubernetes watch, in-process)
pub mod coordinator; // Change -> invalidate -> replace

// 🏗️ Re-exports so callers don't need deep nested imports.
pub use coordinator::{RotationCoordinator, RotationReport};
pub use diffed::{DiffedSecretStore, GoogleCredentialSource, GoogleCredentials};
pub use feed::{ChannelSecretFeed, KubeSecretFeed, SecretFeedSender, connect_kube};
pub use handle::{ClientHandle, Lease};
pub use mirrored::{AwsSessionOptions, MirroredSecretStore};
pub use secrets::SecretPayload;
pub use state::{CredentialSecretState, Payload};
pub use token_cache::TokenCache;
pub use traits::{AccessToken, ClientFactory, CredentialStore, SecretEvent, SecretFeed, TokenSource};
