pub mod aws;
pub mod gcp;

pub use aws::AwsCredentialsManager;
pub use gcp::{CredentialsTokenSource, GcpCredentialsManager, TokenExchanger};
