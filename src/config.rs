// src/config.rs

use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{Result, RotationError};

/// RFC 1123 label/subdomain as accepted by Kubernetes for namespaces and Secret names.
static K8S_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("K8S_NAME is a valid regex")
});

pub const DEFAULT_DATA_KEY: &str = "credentials";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    // 🛡️ Identity of the Secrets we consume
    pub namespace: String,
    pub aws_secret_name: String,
    pub gcp_secret_name: String,
    pub data_key: String,

    // 📂 Platform Agnostic Paths
    pub aws_mirror_path: PathBuf,

    /// Upper bound for a single drain-before-swap issued by a coordinator.
    pub drain_timeout: Duration,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests never touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let namespace = lookup("CLOUDCREDS_NAMESPACE")
            .or_else(|| lookup("POD_NAMESPACE"))
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "default".to_string());

        // 🛡️ Strictly parse the timeout. A typo must not silently become an
        // unbounded drain-wait.
        let raw_timeout = get("CLOUDCREDS_DRAIN_TIMEOUT_SECS", "30");
        let drain_secs = raw_timeout.parse::<u64>().map_err(|_| {
            RotationError::Config(format!(
                "CLOUDCREDS_DRAIN_TIMEOUT_SECS must be a positive integer, got {raw_timeout:?}"
            ))
        })?;
        if drain_secs == 0 {
            return Err(RotationError::Config(
                "CLOUDCREDS_DRAIN_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }

        let config = Self {
            namespace,
            aws_secret_name: get("CLOUDCREDS_AWS_SECRET_NAME", "aws-sts-credentials"),
            gcp_secret_name: get("CLOUDCREDS_GCP_SECRET_NAME", "gcp-cloud-credentials"),
            data_key: get("CLOUDCREDS_DATA_KEY", DEFAULT_DATA_KEY),
            aws_mirror_path: PathBuf::from(get(
                "CLOUDCREDS_AWS_MIRROR_PATH",
                "/run/cloudcreds/aws/credentials",
            )),
            drain_timeout: Duration::from_secs(drain_secs),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("aws secret name", &self.aws_secret_name),
            ("gcp secret name", &self.gcp_secret_name),
        ] {
            if value.len() > 253 || !K8S_NAME.is_match(value) {
                return Err(RotationError::Config(format!(
                    "{field} {value:?} is not a valid Kubernetes name"
                )));
            }
        }
        if self.aws_mirror_path.file_name().is_none() {
            return Err(RotationError::Config(format!(
                "mirror path {} must name a file",
                self.aws_mirror_path.display()
            )));
        }
        Ok(())
    }
}
