#![forbid(unsafe_code)]

//! One-shot sync from the command line.
//!
//! Without `--full` the channels go through the same cache-aware path the
//! dashboard uses. With `--full` each channel's entire upload history is
//! fetched and stored, printing progress as pages arrive.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::warn;
use tubeintel::{
    config::{RuntimeOverrides, resolve_runtime_settings},
    library::ChannelStore,
    logging,
    models::{SyncProgress, SyncResult, TrackedChannel, VideoLimit},
    store::Database,
    sync::{SyncConfig, SyncService},
    youtube::{VideoSource, YouTubeClient},
};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "sync_channel", about = "Sync YouTube channels into the local database")]
struct SyncArgs {
    /// Channel ids (UC...).
    #[arg(required = true, value_name = "CHANNEL")]
    channels: Vec<String>,
    /// Videos to return per channel.
    #[arg(long, value_name = "N", conflicts_with = "unlimited")]
    limit: Option<usize>,
    /// Fetch every upload of each channel.
    #[arg(long)]
    unlimited: bool,
    /// Ignore fresh sync status and hit the API.
    #[arg(long)]
    force: bool,
    /// Run a full history sync per channel instead.
    #[arg(long, conflicts_with_all = ["limit", "unlimited", "force"])]
    full: bool,
    /// Also add the channels to the tracked list.
    #[arg(long)]
    track: bool,
    /// Print the sync result as JSON.
    #[arg(long)]
    json: bool,
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,
}

impl SyncArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            database_path: self.database.clone(),
            youtube_api_key: self.api_key.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }

    fn video_limit(&self) -> VideoLimit {
        if self.unlimited {
            return VideoLimit::Unlimited;
        }
        VideoLimit::from(Some(self.limit.unwrap_or(DEFAULT_LIMIT)))
    }

    /// Trimmed, de-duplicated channel ids in the order given.
    fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.channels.len());
        for raw in &self.channels {
            let id = raw.trim();
            if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("tubeintel=warn,sync_channel=info");

    let args = SyncArgs::parse();
    let channel_ids = args.channel_ids();
    if channel_ids.is_empty() {
        bail!("no channel ids given");
    }

    let settings = resolve_runtime_settings(args.overrides())?;
    let api_key = settings.require_api_key()?.to_string();
    let db = Database::open(&settings.database_path)
        .await
        .with_context(|| format!("opening database {}", settings.database_path.display()))?;
    let source: Arc<dyn VideoSource> = Arc::new(YouTubeClient::new(
        api_key,
        settings.youtube_api_base.clone(),
    ));
    let config = SyncConfig::default().with_max_age_minutes(settings.sync_max_age_minutes);

    println!("Database: {}", settings.database_path.display());

    if args.track {
        track_channels(source.as_ref(), &ChannelStore::new(db.clone()), &channel_ids).await;
    }

    if args.full {
        let service = SyncService::new(source, db, config).with_progress(Arc::new(print_progress));
        let failures = run_full_syncs(&service, &channel_ids).await;
        if failures > 0 {
            bail!("{failures} of {} channel(s) failed to sync", channel_ids.len());
        }
        return Ok(());
    }

    let service = SyncService::new(source, db, config);
    let result = service
        .sync_channels_videos(&channel_ids, args.video_limit(), args.force)
        .await;

    if args.json {
        let rendered =
            serde_json::to_string_pretty(&result).context("serializing sync result")?;
        println!("{rendered}");
    } else {
        print_summary(&result);
    }

    if !result.errors.is_empty() {
        bail!("{} channel(s) reported errors", result.errors.len());
    }
    Ok(())
}

async fn track_channels(source: &dyn VideoSource, channels: &ChannelStore, ids: &[String]) {
    for id in ids {
        let info = match source.get_channel(id).await {
            Ok(info) => info,
            Err(err) => {
                warn!(channel = %id, error = %err, "could not resolve channel, not tracking it");
                continue;
            }
        };
        let channel = TrackedChannel {
            channel_id: info.channel_id,
            title: info.title,
            thumbnail_url: info.thumbnail_url,
            subscriber_count: info.subscriber_count,
            video_count: info.video_count,
            added_at: Utc::now(),
        };
        match channels.add(&channel).await {
            Ok(()) => println!("Tracking {} ({})", channel.title, channel.channel_id),
            Err(err) => warn!(channel = %id, error = %err, "failed to store tracked channel"),
        }
    }
}

/// Returns how many channels failed.
async fn run_full_syncs(service: &SyncService, channel_ids: &[String]) -> usize {
    let mut failures = 0;
    for (index, channel_id) in channel_ids.iter().enumerate() {
        println!();
        println!(
            "[{}/{}] Full sync: {}",
            index + 1,
            channel_ids.len(),
            channel_id
        );
        let outcome = service.full_sync_channel(channel_id).await;
        if outcome.success {
            println!("  Stored {} videos", outcome.video_count);
        } else {
            failures += 1;
            eprintln!(
                "  Failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    failures
}

fn print_progress(progress: SyncProgress) {
    println!("  {}", format_progress(&progress));
}

fn format_progress(progress: &SyncProgress) -> String {
    match progress.estimated_total {
        Some(total) if total > 0 => {
            let percent = (progress.fetched.saturating_mul(100) / total).min(100);
            format!("{} / ~{} videos ({percent}%)", progress.fetched, total)
        }
        _ => format!("{} videos", progress.fetched),
    }
}

fn print_summary(result: &SyncResult) {
    println!(
        "Returned {} videos ({} from cache, {} from the API)",
        result.videos.len(),
        result.from_cache,
        result.from_api
    );
    for channel in &result.skipped {
        println!("Skipped {channel}: sync already in progress");
    }
    for err in &result.errors {
        eprintln!("Error: {err}");
    }
    for video in result.videos.iter().take(10) {
        println!(
            "  {}  {:>10} views  {}",
            video.published_at.format("%Y-%m-%d"),
            video.view_count,
            video.title
        );
    }
    if result.videos.len() > 10 {
        println!("  ... {} more", result.videos.len() - 10);
    }
}
