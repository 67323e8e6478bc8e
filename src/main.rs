// src/main.rs

use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use cloudcreds::config::AgentConfig;
use cloudcreds::creds::connect_kube;
use cloudcreds::providers::{AwsCredentialsManager, GcpCredentialsManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    init_tracing();
    let config = AgentConfig::load()?;

    // ==============================================================================
    // 2. Kubernetes API access (degraded mode when unavailable)
    // ==============================================================================

    let kube = match connect_kube().await {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::error!(error = %e, "cannot reach the Kubernetes API, using default credential chains only");
            None
        }
    };

    // ==============================================================================
    // 3. Explicit wiring & start
    // ==============================================================================

    let aws = AwsCredentialsManager::new(&config, kube.clone());
    // The standalone agent keeps the AWS mirror file current and tracks the
    // Google Secret. SDK clients and the token exchanger belong to the
    // embedding service, which registers them on the managers.
    let gcp = GcpCredentialsManager::new(&config, kube, None);

    aws.start().await;
    gcp.start().await;

    tracing::info!(
        namespace = %config.namespace,
        aws_secret = %config.aws_secret_name,
        gcp_secret = %config.gcp_secret_name,
        "⚙️ cloud credentials agent running"
    );

    wait_for_shutdown().await?;

    // ==============================================================================
    // 4. Teardown (stops the watches, removes the mirrored file)
    // ==============================================================================

    aws.stop().await;
    gcp.stop().await;
    tracing::info!("cloud credentials agent stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CLOUDCREDS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    tracing::info!("shutdown signal received");
    Ok(())
}
