//! Probe configuration.
//!
//! The verification parameters (target URL, trigger selector, settle wait,
//! artifact path) are fixed constants: the binary takes no arguments and no
//! flags. Only the browser launch plumbing adapts to the host, since the
//! Chromium executable lives in a different place on every machine.

use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};
use url::Url;
use which::which;

use crate::errors::{ProbeError, ProbeErrorKind};

/// Page served by the locally running dev server.
pub const TARGET_URL: &str = "http://localhost:8000/Index.html";

/// Button that opens the login modal.
pub const TRIGGER_SELECTOR: &str = "#login-btn";

/// Fixed pause after the click, giving the modal transition time to finish.
pub const SETTLE_MS: u64 = 1_000;

/// Relative path of the evidence screenshot.
pub const SCREENSHOT_PATH: &str = "verification/login-modal.png";

/// Configuration for launching and tuning the browser connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdpConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    pub default_deadline_ms: u64,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            executable: default_chrome_path(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            default_deadline_ms: 30_000,
        }
    }
}

/// Full configuration of one verification run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub target_url: String,
    pub trigger_selector: String,
    pub settle_ms: u64,
    pub screenshot_path: PathBuf,
    pub cdp: CdpConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target_url: TARGET_URL.to_string(),
            trigger_selector: TRIGGER_SELECTOR.to_string(),
            settle_ms: SETTLE_MS,
            screenshot_path: PathBuf::from(SCREENSHOT_PATH),
            cdp: CdpConfig::default(),
        }
    }
}

impl ProbeConfig {
    /// Reject configurations the routine could never execute.
    pub fn validate(&self) -> Result<(), ProbeError> {
        Url::parse(&self.target_url).map_err(|err| {
            ProbeError::new(ProbeErrorKind::Internal)
                .with_hint(format!("invalid target url '{}': {err}", self.target_url))
        })?;
        if self.trigger_selector.trim().is_empty() {
            return Err(
                ProbeError::new(ProbeErrorKind::Internal).with_hint("empty trigger selector")
            );
        }
        if self.screenshot_path.as_os_str().is_empty() {
            return Err(
                ProbeError::new(ProbeErrorKind::Internal).with_hint("empty screenshot path")
            );
        }
        Ok(())
    }
}

fn resolve_headless_default() -> bool {
    // MODALCHECK_HEADLESS: "0", "false", "no", "off" means headful
    match env::var("MODALCHECK_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn default_chrome_path() -> PathBuf {
    detect_chrome_executable().unwrap_or_default()
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("MODALCHECK_CHROME_PROFILE") {
        return PathBuf::from(path);
    }

    let default = Path::new("./.modalcheck-profile");
    default.into()
}

/// Locate a Chromium/Chrome binary: explicit override first, then `PATH`,
/// then the usual install locations.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("MODALCHECK_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("MODALCHECK_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_chrome_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    let root = PathBuf::from(trimmed);
                    paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                    paths.push(root.join("Chromium/Application/chrome.exe"));
                    paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
                }
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_carry_the_fixed_routine_parameters() {
        let cfg = ProbeConfig::default();
        assert_eq!(cfg.target_url, "http://localhost:8000/Index.html");
        assert_eq!(cfg.trigger_selector, "#login-btn");
        assert_eq!(cfg.settle_ms, 1_000);
        assert_eq!(
            cfg.screenshot_path,
            PathBuf::from("verification/login-modal.png")
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_malformed_url() {
        let cfg = ProbeConfig {
            target_url: "not a url".to_string(),
            ..ProbeConfig::default()
        };
        let err = cfg.validate().expect_err("url must be rejected");
        assert_eq!(err.kind(), &ProbeErrorKind::Internal);
    }

    #[test]
    fn validate_rejects_blank_selector() {
        let cfg = ProbeConfig {
            trigger_selector: "   ".to_string(),
            ..ProbeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial]
    fn detects_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chrome");
        fs::write(&exe_path, b"").unwrap();
        let original = env::var("MODALCHECK_CHROME").ok();
        env::set_var("MODALCHECK_CHROME", exe_path.to_string_lossy().to_string());
        let detected = detect_chrome_executable();
        if let Some(value) = original {
            env::set_var("MODALCHECK_CHROME", value);
        } else {
            env::remove_var("MODALCHECK_CHROME");
        }
        assert_eq!(detected, Some(exe_path));
    }

    #[test]
    #[serial]
    fn detects_from_path_entries() {
        let dir = tempdir().unwrap();
        let name = chrome_executable_names()
            .first()
            .expect("chrome executable names must not be empty");
        let exe_path = dir.path().join(name);
        fs::write(&exe_path, b"").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o755);
            fs::set_permissions(&exe_path, perms).unwrap();
        }
        let original_path = env::var("PATH").ok();
        let original_env = env::var("MODALCHECK_CHROME").ok();
        let skip_flag = env::var("MODALCHECK_SKIP_OS_PATHS").ok();
        env::set_var("MODALCHECK_CHROME", "");
        env::set_var("MODALCHECK_SKIP_OS_PATHS", "1");
        env::set_var("PATH", dir.path());
        let detected = detect_chrome_executable();
        if let Some(value) = original_path {
            env::set_var("PATH", value);
        }
        if let Some(value) = original_env {
            env::set_var("MODALCHECK_CHROME", value);
        } else {
            env::remove_var("MODALCHECK_CHROME");
        }
        if let Some(value) = skip_flag {
            env::set_var("MODALCHECK_SKIP_OS_PATHS", value);
        } else {
            env::remove_var("MODALCHECK_SKIP_OS_PATHS");
        }
        assert_eq!(detected, Some(exe_path));
    }
}
