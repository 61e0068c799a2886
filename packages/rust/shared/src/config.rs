//! Application configuration for webapk.
//!
//! User config lives at `~/.webapk/webapk.toml` (or wherever `WEBAPK_CONFIG`
//! points). CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WebApkError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "webapk.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".webapk";

/// Env var that overrides the config file location.
const CONFIG_ENV_VAR: &str = "WEBAPK_CONFIG";

// ---------------------------------------------------------------------------
// Config structs (matching webapk.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Filesystem roots.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Template file contract.
    #[serde(default)]
    pub template: TemplateConfig,

    /// External build toolchain.
    #[serde(default)]
    pub build: BuildConfig,

    /// Retrieval locators.
    #[serde(default)]
    pub download: DownloadConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Read-only application template source.
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Root for per-job workspaces and template instances.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Root for per-job build output.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_template_dir() -> PathBuf {
    "engine/android-template".into()
}
fn default_work_dir() -> PathBuf {
    "var/work".into()
}
fn default_output_dir() -> PathBuf {
    "var/builds".into()
}

/// `[template]` section. Paths are relative to the template root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Directory inside the instance that receives the uploaded content.
    #[serde(default = "default_merge_subdir")]
    pub merge_subdir: PathBuf,

    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    #[serde(default = "default_build_descriptor_path")]
    pub build_descriptor_path: PathBuf,

    #[serde(default = "default_icon_path")]
    pub icon_path: PathBuf,

    /// Literal token in the manifest replaced by the package identifier.
    #[serde(default = "default_package_placeholder")]
    pub package_placeholder: String,

    /// Literal token in the manifest replaced by the app name.
    #[serde(default = "default_name_placeholder")]
    pub name_placeholder: String,

    /// Literal token in the build descriptor replaced by the version.
    #[serde(default = "default_version_placeholder")]
    pub version_placeholder: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            merge_subdir: default_merge_subdir(),
            manifest_path: default_manifest_path(),
            build_descriptor_path: default_build_descriptor_path(),
            icon_path: default_icon_path(),
            package_placeholder: default_package_placeholder(),
            name_placeholder: default_name_placeholder(),
            version_placeholder: default_version_placeholder(),
        }
    }
}

fn default_merge_subdir() -> PathBuf {
    "app".into()
}
fn default_manifest_path() -> PathBuf {
    "app/src/main/AndroidManifest.xml".into()
}
fn default_build_descriptor_path() -> PathBuf {
    "app/build.gradle".into()
}
fn default_icon_path() -> PathBuf {
    "app/src/main/res/mipmap-xxxhdpi/ic_launcher.png".into()
}
fn default_package_placeholder() -> String {
    "com.example.app".into()
}
fn default_name_placeholder() -> String {
    "APP_NAME".into()
}
fn default_version_placeholder() -> String {
    "1.0.0".into()
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build tool executable, resolved relative to the template instance.
    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Where the toolchain leaves its artifact, relative to the instance.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,

    /// Fixed name of the published artifact in the job's output directory.
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// Wall-clock limit for one build tool run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Jobs allowed to run their pipeline at the same time.
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,

    /// Bytes of captured build output kept for diagnostics.
    #[serde(default = "default_diagnostics_limit")]
    pub diagnostics_limit: usize,

    /// Keep workspace and template instance after a job finishes, leaving
    /// removal to `webapk clean` or an external retention policy. Set to
    /// `false` to have the pipeline remove them itself.
    #[serde(default = "default_retain_scratch")]
    pub retain_scratch: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            artifact_path: default_artifact_path(),
            artifact_name: default_artifact_name(),
            timeout_secs: default_timeout_secs(),
            max_concurrent_builds: default_max_concurrent_builds(),
            diagnostics_limit: default_diagnostics_limit(),
            retain_scratch: default_retain_scratch(),
        }
    }
}

fn default_program() -> String {
    "./gradlew".into()
}
fn default_args() -> Vec<String> {
    vec!["assembleDebug".into()]
}
fn default_artifact_path() -> PathBuf {
    "app/build/outputs/apk/debug/app-debug.apk".into()
}
fn default_artifact_name() -> String {
    "app-debug.apk".into()
}
fn default_timeout_secs() -> u64 {
    1800
}
fn default_max_concurrent_builds() -> usize {
    2
}
fn default_diagnostics_limit() -> usize {
    16 * 1024
}

fn default_retain_scratch() -> bool {
    true
}

/// `[download]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Path prefix of retrieval locators (`<base_path>/<job_id>`).
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

fn default_base_path() -> String {
    "/download".into()
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, derived from the config file.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub template_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub template: TemplateConfig,
    pub program: String,
    pub args: Vec<String>,
    pub artifact_path: PathBuf,
    pub artifact_name: String,
    pub timeout: Duration,
    pub max_concurrent_builds: usize,
    pub diagnostics_limit: usize,
    pub retain_scratch: bool,
    pub download_base: String,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            template_dir: config.paths.template_dir.clone(),
            work_dir: config.paths.work_dir.clone(),
            output_dir: config.paths.output_dir.clone(),
            template: config.template.clone(),
            program: config.build.program.clone(),
            args: config.build.args.clone(),
            artifact_path: config.build.artifact_path.clone(),
            artifact_name: config.build.artifact_name.clone(),
            timeout: Duration::from_secs(config.build.timeout_secs),
            max_concurrent_builds: config.build.max_concurrent_builds.max(1),
            diagnostics_limit: config.build.diagnostics_limit,
            retain_scratch: config.build.retain_scratch,
            download_base: config.download.base_path.trim_end_matches('/').to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.webapk/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| WebApkError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file: `$WEBAPK_CONFIG` if set, else
/// `~/.webapk/webapk.toml`.
pub fn config_file_path() -> Result<PathBuf> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(p) if !p.is_empty() => Ok(PathBuf::from(p)),
        _ => Ok(config_dir()?.join(CONFIG_FILE_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| WebApkError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| WebApkError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    init_config_at(&path)?;
    Ok(path)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| WebApkError::io(dir, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| WebApkError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| WebApkError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(())
}
