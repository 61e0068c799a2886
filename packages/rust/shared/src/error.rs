//! Error types for webapk.
//!
//! Library crates use [`WebApkError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all webapk operations.
#[derive(Debug, thiserror::Error)]
pub enum WebApkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed or missing upload/settings, rejected before a job exists.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The uploaded archive could not be read or unpacked.
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// A hard failure while patching the template instance.
    #[error("patch error: {message}")]
    Patch { message: String },

    /// The external build tool failed or produced no artifact.
    #[error("build tool error: {message}")]
    BuildTool {
        message: String,
        exit_code: Option<i32>,
        diagnostics: String,
    },

    /// The job was abandoned by external policy (timeout, explicit cancel).
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// Unknown job, or a job that has not reached `Ready`.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WebApkError>;

impl WebApkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extraction error from any displayable message.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
        }
    }

    /// Create a patch error from any displayable message.
    pub fn patch(msg: impl Into<String>) -> Self {
        Self::Patch {
            message: msg.into(),
        }
    }

    /// Create a build tool error with captured diagnostics.
    pub fn build_tool(
        msg: impl Into<String>,
        exit_code: Option<i32>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::BuildTool {
            message: msg.into(),
            exit_code,
            diagnostics: diagnostics.into(),
        }
    }

    /// Create a cancellation error with the policy reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a not-found error from any displayable message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable short name of the error class, used in events and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Validation { .. } => "validation",
            Self::Extraction { .. } => "extraction",
            Self::Patch { .. } => "patch",
            Self::BuildTool { .. } => "build_tool",
            Self::Cancelled { .. } => "cancelled",
            Self::NotFound { .. } => "not_found",
            Self::Io { .. } => "io",
        }
    }

    /// One-line summary suitable for a failure notification.
    ///
    /// Build tool diagnostics are reduced to their last non-empty line.
    pub fn summary(&self) -> String {
        match self {
            Self::BuildTool {
                message,
                diagnostics,
                ..
            } => match diagnostics.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(last) => format!("build tool error: {message}: {}", last.trim()),
                None => format!("build tool error: {message}"),
            },
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = WebApkError::config("missing template_dir");
        assert_eq!(err.to_string(), "config error: missing template_dir");

        let err = WebApkError::validation("archive must be a .zip file");
        assert!(err.to_string().contains(".zip"));
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(WebApkError::extraction("x").kind(), "extraction");
        assert_eq!(WebApkError::cancelled("timeout").kind(), "cancelled");
        assert_eq!(WebApkError::build_tool("x", Some(1), "").kind(), "build_tool");
    }

    #[test]
    fn build_tool_summary_uses_last_diagnostic_line() {
        let err = WebApkError::build_tool(
            "exited with status 1",
            Some(1),
            "> Task :app:compileDebugJavaWithJavac\nFAILURE: Build failed with an exception.\n\n",
        );
        assert_eq!(
            err.summary(),
            "build tool error: exited with status 1: FAILURE: Build failed with an exception."
        );
    }
}
