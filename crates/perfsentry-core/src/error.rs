//! Error types for perfsentry-core

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for perfsentry-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A host capability the operation needs was never registered
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A host capability call failed
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (no tokio runtime, task join failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Unsupported(_) => Some(
                Remediation::new("Register the missing host capability before enabling this feature.")
                    .alternative("Leave the feature disabled; other subsystems keep running."),
            ),
            Self::Host(_) => Some(
                Remediation::new("Check that the host capability is reachable on this platform.")
                    .alternative("Samplers skip failed ticks, so transient failures need no action."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config or log directory exists and is writable."),
            ),
            Self::Json(_) => Some(Remediation::new(
                "Report serialization failed; check for non-finite values in custom metrics.",
            )),
            Self::Runtime(_) => Some(
                Remediation::new("Start the engine from inside a tokio runtime.")
                    .alternative("Drive the samplers manually with their sample methods."),
            ),
        }
    }
}

/// Configuration errors, raised only at configure/load time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Fall back to EngineConfig::default()."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .alternative("Remove unknown sections; every field has a default."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("Intervals and capacities must be positive; step thresholds ascending.")
            }
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

/// Failure of a single host capability call.
///
/// Samplers treat these as "skip this tick", never as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("capability unavailable on this host: {0}")]
    Unavailable(String),

    #[error("capability call failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_error() {
        let err: Error = ConfigError::invalid("interval must be > 0").into();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
        assert!(err.to_string().contains("interval must be > 0"));
    }

    #[test]
    fn every_variant_has_remediation() {
        let errors = vec![
            Error::Config(ConfigError::FileNotFound("/tmp/x.toml".to_string())),
            Error::Unsupported("reference enumeration".to_string()),
            Error::Host(HostError::Failed("read /proc".to_string())),
            Error::Io(std::io::Error::other("boom")),
            Error::Runtime("no runtime".to_string()),
        ];
        for err in errors {
            let remediation = err.remediation().expect("remediation");
            assert!(!remediation.summary.is_empty());
        }
    }

    #[test]
    fn render_plain_lists_alternatives() {
        let text = Remediation::new("do the thing")
            .alternative("or this")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("do the thing"));
        assert!(text.contains("- or this"));
    }

    #[test]
    fn host_error_display() {
        let err = HostError::Unavailable("thread enumeration".to_string());
        assert_eq!(
            err.to_string(),
            "capability unavailable on this host: thread enumeration"
        );
    }
}
