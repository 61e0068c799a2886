//! Shared types, error model, and configuration for webapk.
//!
//! This crate is the foundation depended on by the pipeline and the CLI.
//! It provides:
//! - [`WebApkError`]: the unified error type
//! - Domain types ([`JobId`], [`ProjectSettings`], [`JobStatus`], [`BuildEvent`], [`JobRecord`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuildConfig, DownloadConfig, PathsConfig, PipelineConfig, TemplateConfig,
    config_dir, config_file_path, init_config, init_config_at, load_config, load_config_from,
};
pub use error::{Result, WebApkError};
pub use types::{
    ArtifactInfo, BuildEvent, JOB_RECORD_FILE, JobId, JobRecord, JobStatus, ProjectSettings,
};
