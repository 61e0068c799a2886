//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use url::Url;
use webapk_core::layout::JobPaths;
use webapk_core::pipeline::remove_scratch;
use webapk_core::{ArtifactLocator, Pipeline};
use webapk_shared::{
    AppConfig, BuildEvent, JobId, JobStatus, PipelineConfig, ProjectSettings, init_config,
    init_config_at, load_config, load_config_from,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// webapk: turn a zipped web app into an installable Android package.
#[derive(Parser)]
#[command(
    name = "webapk",
    version,
    about = "Package a zipped web application into an Android APK.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.webapk/webapk.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Build an APK from a zipped web app and wait for the result.
    Build {
        /// Zip archive containing the web app.
        archive: PathBuf,

        /// Display name of the application.
        #[arg(long)]
        app_name: String,

        /// Reverse-domain package identifier, e.g. com.example.app.
        #[arg(long = "package")]
        package_name: String,

        /// Semantic version string of the application.
        #[arg(long = "version")]
        app_version: String,

        /// URL the application wraps.
        #[arg(long)]
        target_url: Url,

        /// Launcher icon to install in place of the template's.
        #[arg(long)]
        icon: Option<PathBuf>,

        /// Print the completion event as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Print the artifact path of a finished job.
    Locate {
        /// Job identifier printed by `build`.
        job_id: String,
    },

    /// Remove a finished job's workspace and template instance.
    Clean {
        /// Job identifier printed by `build`.
        job_id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "webapk=info",
        1 => "webapk=debug",
        _ => "webapk=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Build {
            archive,
            app_name,
            package_name,
            app_version,
            target_url,
            icon,
            json,
        } => {
            let settings = ProjectSettings {
                app_name,
                package_name,
                version: app_version,
                target_url,
                icon,
            };
            cmd_build(config_path, archive, settings, json).await
        }
        Command::Locate { job_id } => cmd_locate(config_path, &job_id),
        Command::Clean { job_id } => cmd_clean(config_path, &job_id),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|e| eyre!("invalid job id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_build(
    config_path: Option<&Path>,
    archive: PathBuf,
    settings: ProjectSettings,
    json: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let pipeline = Pipeline::new(PipelineConfig::from(&config));

    let app_name = settings.app_name.clone();
    let job_id = pipeline.submit(&archive, settings)?;
    info!(%job_id, archive = %archive.display(), "build submitted");

    let spinner = spinner()?;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let wait = pipeline.wait(job_id);
    tokio::pin!(wait);

    // Ctrl-C cancels the job; the loop then waits for its terminal event.
    let event = loop {
        tokio::select! {
            event = &mut wait => break event?,
            _ = ticker.tick() => {
                if let Ok(record) = pipeline.status(job_id) {
                    spinner.set_message(format!("{} {app_name}", stage_label(record.status)));
                }
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                warn!(%job_id, "interrupted, cancelling build");
                pipeline.cancel(job_id, "interrupted")?;
            }
        }
    };
    spinner.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string(&event)?);
    }

    match event {
        BuildEvent::ApkReady { url, .. } => {
            if !json {
                let artifact = pipeline.locator().locate(job_id)?;
                let record = pipeline.status(job_id)?;

                println!();
                println!("  APK built successfully!");
                println!("  Job:      {job_id}");
                println!("  App:      {app_name}");
                println!("  Artifact: {}", artifact.display());
                if let Some(info) = record.artifact {
                    println!("  Size:     {} bytes", info.size_bytes);
                    println!("  SHA-256:  {}", info.sha256);
                }
                println!("  Download: {url}");
                println!();
            }
            Ok(())
        }
        BuildEvent::ApkFailed { error, .. } => Err(eyre!("build {job_id} failed: {error}")),
    }
}

fn stage_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Staging => "Staging upload for",
        JobStatus::Patching => "Patching template for",
        JobStatus::Building => "Building",
        JobStatus::Ready => "Finished",
        JobStatus::Failed => "Failed",
    }
}

fn spinner() -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message("Submitting");
    spinner.enable_steady_tick(Duration::from_millis(80));
    Ok(spinner)
}

fn cmd_locate(config_path: Option<&Path>, raw: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let locator = ArtifactLocator::new(&PipelineConfig::from(&config));
    let artifact = locator.locate_str(raw)?;
    println!("{}", artifact.display());
    Ok(())
}

fn cmd_clean(config_path: Option<&Path>, raw: &str) -> Result<()> {
    let job_id = parse_job_id(raw)?;
    let config = PipelineConfig::from(&resolve_config(config_path)?);

    // Records are written when a job finishes, so one on disk means it is safe
    // to remove the scratch directories.
    let record = ArtifactLocator::new(&config).read_record(job_id)?;
    remove_scratch(&JobPaths::new(&config, job_id))?;

    info!(%job_id, status = %record.status, "scratch directories removed");
    println!("Cleaned job {job_id} ({})", record.status);
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => {
            init_config_at(p)?;
            p.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
