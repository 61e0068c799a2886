//! webapk CLI: package a zipped web app into an Android APK.
//!
//! Stages the upload, patches a copy of the application template with the
//! project settings, and runs the Android toolchain against it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
