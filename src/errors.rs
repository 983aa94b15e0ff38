//! Error surface shared by the transport, the adapter and the verification
//! routine. Failures are terminal: nothing here is retried, the first error
//! aborts the run.

use std::fmt;
use thiserror::Error;

/// High-level failure categories surfaced by the probe.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProbeErrorKind {
    #[error("browser launch failed")]
    Launch,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("navigation timed out")]
    NavTimeout,
    #[error("target element not found")]
    TargetNotFound,
    #[error("screenshot capture failed")]
    Screenshot,
    #[error("artifact write failed")]
    Artifact,
    #[error("internal error")]
    Internal,
}

/// Error carrier pairing a category with an optional context hint.
#[derive(Clone, Debug)]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub hint: Option<String>,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind) -> Self {
        Self { kind, hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn kind(&self) -> &ProbeErrorKind {
        &self.kind
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProbeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_hint_when_present() {
        let bare = ProbeError::new(ProbeErrorKind::NavTimeout);
        assert_eq!(bare.to_string(), "navigation timed out");

        let hinted = ProbeError::new(ProbeErrorKind::TargetNotFound)
            .with_hint("selector '#login-btn' never resolved");
        assert_eq!(
            hinted.to_string(),
            "target element not found: selector '#login-btn' never resolved"
        );
    }

    #[test]
    fn kind_is_preserved_through_builder() {
        let err = ProbeError::new(ProbeErrorKind::Artifact).with_hint("disk full");
        assert_eq!(err.kind(), &ProbeErrorKind::Artifact);
    }
}
