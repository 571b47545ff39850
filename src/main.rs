//! CLI entry point for rangeload.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use rangeload::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use rangeload::units::HumanBytes;
use rangeload::{DownloadStatus, DownloadTask, HttpClient, TaskOptions};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::{FileConfig, load_default_file_config};
use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let config = load_default_file_config()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(&args, &config)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, ?config, "CLI arguments parsed");

    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let rate_limit = args.rate_limit.or(config.rate_limit).unwrap_or(0);
    let client = HttpClient::new_with_timeouts(
        config.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
        config.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
    );

    let task = DownloadTask::create(
        client,
        args.urls.clone(),
        &output_dir,
        TaskOptions {
            name: args.name.clone(),
            rate_limit,
            ..TaskOptions::default()
        },
    )
    .await
    .with_context(|| format!("Failed to create download task in '{}'", output_dir.display()))?;

    info!(
        task = %task.name(),
        files = task.files().len(),
        dir = %output_dir.display(),
        rate_limit,
        "Rangeload starting"
    );

    let show_progress = !args.quiet && !args.json;
    let (ui, ui_stop) = progress::spawn_progress_ui(show_progress, task.clone());

    let status = match task.start().await {
        Ok(()) => {
            tokio::select! {
                status = task.settled() => status,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping download");
                    task.stop().await;
                    task.status()
                }
            }
        }
        Err(error) => {
            debug!(%error, "task did not start");
            task.status()
        }
    };

    ui_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = ui {
        let _ = handle.await;
    }

    let progress = task.progress();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&task.snapshot())?);
    }

    match status {
        DownloadStatus::Completed => {
            info!(
                downloaded = %HumanBytes(progress.downloaded),
                "Download complete"
            );
            Ok(ExitCode::SUCCESS)
        }
        other => {
            match task.error() {
                Some(error) => tracing::error!(%error, status = %other, "Download did not complete"),
                None => warn!(status = %other, "Download did not complete"),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Priority: quiet flag > verbose flag > config verbosity > info.
/// `RUST_LOG` overrides all of these.
fn default_filter(args: &Args, config: &FileConfig) -> &'static str {
    if args.quiet {
        return "error";
    }
    match args.verbose {
        0 => config.verbosity.map_or("info", |v| v.filter()),
        1 => "debug",
        _ => "trace",
    }
}
