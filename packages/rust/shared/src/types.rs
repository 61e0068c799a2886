//! Core domain types for webapk build jobs.

use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{Result, WebApkError};

/// File name of the per-job record written next to the build output.
pub const JOB_RECORD_FILE: &str = "job.json";

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for build job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// ProjectSettings
// ---------------------------------------------------------------------------

/// Project-specific values injected into the application template.
///
/// Immutable once a job starts; the pipeline only ever holds it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    /// Application display name.
    pub app_name: String,
    /// Reverse-domain package identifier (e.g. `com.demo.app`).
    pub package_name: String,
    /// Semantic version string.
    pub version: String,
    /// URL of the content the application wraps.
    pub target_url: Url,
    /// Optional replacement launcher icon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<PathBuf>,
}

impl ProjectSettings {
    /// Check every field, returning the first problem as a validation error.
    pub fn validate(&self) -> Result<()> {
        static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)+$").expect("valid regex")
        });
        static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$")
                .expect("valid regex")
        });

        let name = self.app_name.trim();
        if name.is_empty() {
            return Err(WebApkError::validation("appName must not be empty"));
        }
        if name.chars().any(char::is_control) {
            return Err(WebApkError::validation(
                "appName must not contain control characters",
            ));
        }
        if !PACKAGE_RE.is_match(&self.package_name) {
            return Err(WebApkError::validation(format!(
                "packageName '{}' is not a reverse-domain identifier",
                self.package_name
            )));
        }
        if !VERSION_RE.is_match(&self.version) {
            return Err(WebApkError::validation(format!(
                "version '{}' is not a semantic version",
                self.version
            )));
        }
        if !matches!(self.target_url.scheme(), "http" | "https") {
            return Err(WebApkError::validation(format!(
                "targetUrl '{}' must be an http(s) URL",
                self.target_url
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a build job.
///
/// `Staging → Patching → Building → Ready`, with `Failed` reachable from any
/// non-terminal state. `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Staging,
    Patching,
    Building,
    Ready,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Staging, Self::Patching)
            | (Self::Patching, Self::Building)
            | (Self::Building, Self::Ready) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Patching => "patching",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BuildEvent
// ---------------------------------------------------------------------------

/// Terminal notification published on the build-events channel.
///
/// Wire form: `{"event":"apk_ready","jobId":..,"url":..}` or
/// `{"event":"apk_failed","jobId":..,"error":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BuildEvent {
    #[serde(rename = "apk_ready")]
    ApkReady {
        #[serde(rename = "jobId")]
        job_id: JobId,
        url: String,
    },
    #[serde(rename = "apk_failed")]
    ApkFailed {
        #[serde(rename = "jobId")]
        job_id: JobId,
        error: String,
    },
}

impl BuildEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::ApkReady { job_id, .. } | Self::ApkFailed { job_id, .. } => *job_id,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::ApkReady { .. })
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Checksum and size of a published build artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub file_name: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// The `job.json` structure stored in each job's build-output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub settings: ProjectSettings,
    pub status: JobStatus,
    /// Error class (see `WebApkError::kind`) when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Error summary when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Published artifact, present only when `status` is `ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
