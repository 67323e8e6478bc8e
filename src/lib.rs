//! Credential rotation and safe SDK client hand-off for an in-cluster agent.
//!
//! Cloud credentials arrive through a Kubernetes Secret that can change at any
//! time. [`creds::RotationCoordinator`] turns each change into a token-cache
//! invalidation and a drain-before-swap of every managed
//! [`creds::ClientHandle`], so no caller ever uses a client while it is being
//! replaced.
//!
//! The `cloudcreds-agent` binary only runs the Secret watches and the AWS
//! mirror. Services that own SDK clients embed the library instead: they build
//! [`providers::AwsCredentialsManager`] / [`providers::GcpCredentialsManager`],
//! pass a [`providers::TokenExchanger`] for Google access tokens and register
//! their clients before calling `start`.

pub mod config;
pub mod creds;
pub mod error;
pub mod providers;

pub use error::{BoxError, Result, RotationError};
