use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modalcheck::{run_verification, CdpAdapter, ProbeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("starting modalcheck v{}", env!("CARGO_PKG_VERSION"));

    let cfg = ProbeConfig::default();
    cfg.validate()?;

    let adapter = Arc::new(CdpAdapter::new(cfg.cdp.clone()));
    Arc::clone(&adapter).start().await?;

    let result = run_verification(&cfg, &adapter).await;

    // Release the browser on both paths; the routine itself never retries.
    adapter.close().await;

    match result {
        Ok(path) => {
            info!("login modal verified, screenshot at {}", path.display());
            Ok(())
        }
        Err(err) => {
            error!("verification failed: {err}");
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
