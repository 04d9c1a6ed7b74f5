#![forbid(unsafe_code)]

//! Runs a single background sync pass over every tracked channel and exits.
//! Meant for cron when the backend's own loop is disabled.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tubeintel::{
    config::{MAX_INTERVAL_MINUTES, RuntimeOverrides, resolve_runtime_settings},
    library::ChannelStore,
    logging,
    models::BackgroundSyncReport,
    store::Database,
    sync::{SyncConfig, SyncService},
    youtube::{VideoSource, YouTubeClient},
};

#[derive(Debug, Parser)]
#[command(name = "routine_update", about = "Refresh stale tracked channels once")]
struct RoutineArgs {
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,
    /// Minutes before a channel counts as stale; overrides SYNC_MAX_AGE_MINUTES.
    #[arg(
        long,
        value_name = "MINUTES",
        value_parser = clap::value_parser!(i64).range(0..=MAX_INTERVAL_MINUTES)
    )]
    max_age: Option<i64>,
    /// Extra channel to check even if it is not tracked. Repeatable.
    #[arg(long = "channel", value_name = "CHANNEL")]
    channels: Vec<String>,
}

impl RoutineArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            database_path: self.database.clone(),
            youtube_api_key: self.api_key.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

/// Tracked channels first, then explicit extras, without repeats.
fn scheduled_channels(tracked: Vec<String>, extra: &[String]) -> Vec<String> {
    let mut scheduled = tracked;
    for id in extra.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
        if !scheduled.iter().any(|existing| existing == id) {
            scheduled.push(id.to_string());
        }
    }
    scheduled
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let args = RoutineArgs::parse();
    let settings = resolve_runtime_settings(args.overrides())?;
    let api_key = settings.require_api_key()?.to_string();
    let db = Database::open(&settings.database_path)
        .await
        .with_context(|| format!("opening database {}", settings.database_path.display()))?;

    println!("Database: {}", settings.database_path.display());

    let tracked = ChannelStore::new(db.clone())
        .ids()
        .await
        .context("listing tracked channels")?;
    let scheduled = scheduled_channels(tracked, &args.channels);
    if scheduled.is_empty() {
        println!("No tracked channels. Add some through the dashboard or sync_channel --track.");
        return Ok(());
    }

    println!("Checking {} channel(s):", scheduled.len());
    for channel in &scheduled {
        println!("  - {channel}");
    }

    let source: Arc<dyn VideoSource> = Arc::new(YouTubeClient::new(
        api_key,
        settings.youtube_api_base.clone(),
    ));
    let max_age = args.max_age.unwrap_or(settings.sync_max_age_minutes);
    let service = SyncService::new(
        source,
        db,
        SyncConfig::default().with_max_age_minutes(max_age),
    );
    let report = service.background_sync_all_channels(&scheduled).await;

    println!();
    for line in summary_lines(&report) {
        println!("{line}");
    }
    for err in &report.errors {
        eprintln!("  {err}");
    }
    Ok(())
}

fn summary_lines(report: &BackgroundSyncReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Checked {} channel(s), refreshed {}, {} video(s) returned.",
        report.channels_checked, report.channels_synced, report.videos
    )];
    if !report.errors.is_empty() {
        lines.push(format!("{} channel(s) failed:", report.errors.len()));
    }
    lines
}
