//! The verification routine: one fixed, sequential pass that opens the page,
//! triggers the login modal and captures the evidence screenshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::time::sleep;
use tracing::info;

use crate::adapter::CdpAdapter;
use crate::config::ProbeConfig;
use crate::errors::{ProbeError, ProbeErrorKind};

/// Run the fixed action sequence against an already started adapter and
/// return the path of the written screenshot.
///
/// Every step failure propagates immediately; nothing is retried.
pub async fn run_verification(
    cfg: &ProbeConfig,
    adapter: &Arc<CdpAdapter>,
) -> Result<PathBuf, ProbeError> {
    let deadline = Duration::from_millis(cfg.cdp.default_deadline_ms);

    let page = adapter.create_page("about:blank").await?;

    info!(target: "verify", url = %cfg.target_url, "navigating to target page");
    adapter.navigate(page, &cfg.target_url, deadline).await?;

    info!(target: "verify", selector = %cfg.trigger_selector, "triggering login modal");
    adapter.click(page, &cfg.trigger_selector, deadline).await?;

    // Fixed settle: the modal transition exposes no lifecycle event to await.
    sleep(Duration::from_millis(cfg.settle_ms)).await;

    let png = adapter.screenshot(page).await?;
    write_artifact(&cfg.screenshot_path, &png).await?;

    info!(
        target: "verify",
        path = %cfg.screenshot_path.display(),
        bytes = png.len(),
        "verification screenshot captured"
    );

    Ok(cfg.screenshot_path.clone())
}

async fn write_artifact(path: &std::path::Path, bytes: &[u8]) -> Result<(), ProbeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|err| {
                ProbeError::new(ProbeErrorKind::Artifact).with_hint(format!(
                    "failed to create {}: {err}",
                    parent.display()
                ))
            })?;
        }
    }

    fs::write(path, bytes).await.map_err(|err| {
        ProbeError::new(ProbeErrorKind::Artifact)
            .with_hint(format!("failed to write {}: {err}", path.display()))
    })
}
