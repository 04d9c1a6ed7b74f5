#![forbid(unsafe_code)]

//! Channel video synchronization.
//!
//! For every requested channel the orchestrator decides whether the stored
//! videos are good enough, whether one recent page suffices, or whether the
//! whole upload history has to be paged through. Results are merged with what
//! was already stored and written back. Failures never abort the call: they
//! are collected per channel in [`SyncResult::errors`].

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::error::{SourceResult, StoreResult};
use crate::models::{
    BackgroundSyncReport, ChannelSyncError, FullSyncOutcome, SyncProgress, SyncResult,
    VideoLimit, VideoRecord,
};
use crate::store::{Database, SyncStatusStore, VideoStore, dedupe_by_view_count, sort_newest_first};
use crate::youtube::{MAX_PAGE_SIZE, VideoPage, VideoSource};

pub type ProgressCallback = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Timing and sizing knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stored videos younger than this are served without contacting the source.
    pub max_age: Duration,
    /// Extra attempts after a rate-limited fetch.
    pub max_retries: u32,
    /// First backoff; doubles on each retry.
    pub rate_limit_backoff: Duration,
    pub page_delay: Duration,
    pub channel_delay: Duration,
    pub page_size: usize,
    pub background_batch_size: usize,
    pub background_batch_delay: Duration,
    pub background_fetch_count: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_retries: 3,
            rate_limit_backoff: Duration::from_secs(5),
            page_delay: Duration::from_secs(2),
            channel_delay: Duration::from_secs(5),
            page_size: MAX_PAGE_SIZE,
            background_batch_size: 1,
            background_batch_delay: Duration::from_secs(30),
            background_fetch_count: 20,
        }
    }
}

impl SyncConfig {
    pub fn with_max_age_minutes(mut self, minutes: i64) -> Self {
        self.max_age = Duration::from_secs((minutes.max(0) as u64).saturating_mul(60));
        self
    }

    /// Same limits, no sleeping. Used by tests and one-off tooling.
    pub fn without_delays(mut self) -> Self {
        self.rate_limit_backoff = Duration::ZERO;
        self.page_delay = Duration::ZERO;
        self.channel_delay = Duration::ZERO;
        self.background_batch_delay = Duration::ZERO;
        self
    }

    fn max_age_minutes(&self) -> i64 {
        i64::try_from(self.max_age.as_secs() / 60).unwrap_or(i64::MAX)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.rate_limit_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// One page of twice the requested count, capped at the source maximum.
    fn incremental_page_size(&self, limit: VideoLimit) -> usize {
        match limit {
            VideoLimit::Limited(n) => n.saturating_mul(2).clamp(1, self.page_size.max(1)),
            VideoLimit::Unlimited => self.page_size.max(1),
        }
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// One in-process lock per channel id. A channel whose lock is held is
/// skipped rather than waited for.
#[derive(Clone, Default)]
pub struct ChannelLocks {
    inner: Arc<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard releases the lock when dropped.
    pub fn try_acquire(&self, channel_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .inner
            .lock()
            .entry(channel_id.to_string())
            .or_default()
            .clone();
        lock.try_lock_owned().ok()
    }

    pub fn is_locked(&self, channel_id: &str) -> bool {
        self.inner
            .lock()
            .get(channel_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

/// Drops repeated ids, keeping first-seen order.
fn unique_ids(channel_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    channel_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Videos contributed by one channel, split by where they came from.
#[derive(Debug, Default)]
struct ChannelOutcome {
    videos: Vec<VideoRecord>,
    from_cache: usize,
    from_api: usize,
    errors: Vec<String>,
}

impl ChannelOutcome {
    fn cached(mut videos: Vec<VideoRecord>, limit: VideoLimit) -> Self {
        if let Some(n) = limit.as_limit() {
            videos.truncate(n);
        }
        Self {
            from_cache: videos.len(),
            videos,
            ..Self::default()
        }
    }
}

/// Combines fresh and stored records. Fresh copies win on id collisions; the
/// result is newest-first and trimmed to the limit.
fn merge_records(
    fresh: &[VideoRecord],
    stored: Vec<VideoRecord>,
    limit: VideoLimit,
) -> ChannelOutcome {
    let fresh = dedupe_by_view_count(fresh);
    let fresh_ids: HashSet<String> = fresh.iter().map(|video| video.video_id.clone()).collect();

    let mut tagged: Vec<(VideoRecord, bool)> = fresh.into_iter().map(|video| (video, true)).collect();
    let mut stored_seen = HashSet::new();
    for video in stored {
        if fresh_ids.contains(&video.video_id) || !stored_seen.insert(video.video_id.clone()) {
            continue;
        }
        tagged.push((video, false));
    }
    tagged.sort_by(|(a, _), (b, _)| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.video_id.cmp(&b.video_id))
    });
    if let Some(n) = limit.as_limit() {
        tagged.truncate(n);
    }

    let from_api = tagged.iter().filter(|(_, is_fresh)| *is_fresh).count();
    ChannelOutcome {
        from_cache: tagged.len() - from_api,
        from_api,
        videos: tagged.into_iter().map(|(video, _)| video).collect(),
        errors: Vec::new(),
    }
}

#[derive(Clone)]
pub struct SyncService {
    source: Arc<dyn VideoSource>,
    videos: VideoStore,
    statuses: SyncStatusStore,
    config: SyncConfig,
    locks: ChannelLocks,
    progress: Option<ProgressCallback>,
}

impl SyncService {
    pub fn new(source: Arc<dyn VideoSource>, db: Database, config: SyncConfig) -> Self {
        Self {
            source,
            videos: VideoStore::new(db.clone()),
            statuses: SyncStatusStore::new(db),
            config,
            locks: ChannelLocks::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn locks(&self) -> &ChannelLocks {
        &self.locks
    }

    /// Syncs each channel in order and returns the merged, newest-first
    /// videos. Never fails as a whole; see [`SyncResult::errors`].
    pub async fn sync_channels_videos(
        &self,
        channel_ids: &[String],
        limit: VideoLimit,
        force_refresh: bool,
    ) -> SyncResult {
        let limit = limit.normalized();
        let channel_ids = unique_ids(channel_ids);
        let mut result = SyncResult::default();

        for (index, channel_id) in channel_ids.iter().enumerate() {
            if index > 0 {
                pause(self.config.channel_delay).await;
            }

            let Some(_guard) = self.locks.try_acquire(channel_id) else {
                info!(channel = %channel_id, "sync already running, skipping channel");
                result.skipped.push(channel_id.clone());
                continue;
            };

            let outcome = AssertUnwindSafe(self.sync_channel(channel_id, limit, force_refresh))
                .catch_unwind()
                .await;
            match outcome {
                Ok(outcome) => {
                    result.from_cache += outcome.from_cache;
                    result.from_api += outcome.from_api;
                    result.videos.extend(outcome.videos);
                    result.errors.extend(
                        outcome
                            .errors
                            .into_iter()
                            .map(|message| ChannelSyncError::new(channel_id.as_str(), message)),
                    );
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(channel = %channel_id, %message, "channel sync panicked");
                    result.errors.push(ChannelSyncError::new(
                        channel_id.as_str(),
                        format!("fatal error: {message}"),
                    ));
                }
            }
        }

        sort_newest_first(&mut result.videos);
        info!(
            channels = channel_ids.len(),
            videos = result.videos.len(),
            from_cache = result.from_cache,
            from_api = result.from_api,
            errors = result.errors.len(),
            skipped = result.skipped.len(),
            "sync finished"
        );
        result
    }

    async fn sync_channel(
        &self,
        channel_id: &str,
        limit: VideoLimit,
        force_refresh: bool,
    ) -> ChannelOutcome {
        let mut errors = Vec::new();

        let stored = match self
            .videos
            .get_for_channels(&[channel_id.to_string()], None)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                warn!(channel = channel_id, error = %err, "failed to load stored videos");
                errors.push(format!("failed to load stored videos: {err}"));
                Vec::new()
            }
        };

        let needs_sync = match self
            .statuses
            .needs_sync(channel_id, self.config.max_age_minutes())
            .await
        {
            Ok(needs_sync) => needs_sync,
            Err(err) => {
                warn!(channel = channel_id, error = %err, "sync status unavailable, assuming stale");
                true
            }
        };
        let should_full_sync = force_refresh || limit == VideoLimit::Unlimited;

        if !needs_sync
            && !should_full_sync
            && let VideoLimit::Limited(n) = limit
            && stored.len() >= n
        {
            debug!(channel = channel_id, count = n, "serving stored videos");
            let mut outcome = ChannelOutcome::cached(stored, limit);
            outcome.errors = errors;
            return outcome;
        }

        let full = should_full_sync || stored.is_empty();
        let fetched = if full {
            info!(channel = channel_id, "running full sync");
            self.fetch_all(channel_id).await
        } else {
            let page_size = self.config.incremental_page_size(limit);
            debug!(channel = channel_id, page_size, "running incremental sync");
            self.fetch_with_retry(channel_id, page_size, None)
                .await
                .map(|page| page.videos)
        };

        let fresh = match fetched {
            Ok(fresh) => fresh,
            Err(err) if !stored.is_empty() => {
                warn!(
                    channel = channel_id,
                    error = %err,
                    stored = stored.len(),
                    "fetch failed, falling back to stored videos"
                );
                let mut outcome = ChannelOutcome::cached(stored, limit);
                outcome.errors = errors;
                return outcome;
            }
            Err(err) => {
                warn!(channel = channel_id, error = %err, "fetch failed with nothing stored");
                errors.push(format!("fetch failed: {err}"));
                return ChannelOutcome {
                    errors,
                    ..ChannelOutcome::default()
                };
            }
        };

        if let Err(err) = self.persist(channel_id, &fresh).await {
            warn!(channel = channel_id, error = %err, "failed to persist fetched videos");
            errors.push(format!("failed to persist fetched videos: {err}"));
        }

        let mut outcome = merge_records(&fresh, stored, limit);
        outcome.errors = errors;
        outcome
    }

    /// Writes the batch, then records the sync in the status table.
    async fn persist(&self, channel_id: &str, fresh: &[VideoRecord]) -> StoreResult<usize> {
        let written = self.videos.upsert_batch(fresh).await?;
        let total = self.videos.count_for_channel(channel_id).await?;
        let latest = fresh.iter().map(|video| video.published_at).max();
        self.statuses.upsert(channel_id, total, latest).await?;
        debug!(channel = channel_id, written, total, "stored fetched videos");
        Ok(written)
    }

    async fn fetch_with_retry(
        &self,
        channel_id: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> SourceResult<VideoPage> {
        let mut attempt = 0;
        loop {
            match self
                .source
                .fetch_page(channel_id, page_size, page_token)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if err.is_rate_limit() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        channel = channel_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    pause(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pages through every upload. Any page failing discards the whole fetch.
    async fn fetch_all(&self, channel_id: &str) -> SourceResult<Vec<VideoRecord>> {
        let estimated_total = match self.source.get_channel(channel_id).await {
            Ok(info) => info.video_count.and_then(|count| usize::try_from(count).ok()),
            Err(err) => {
                debug!(channel = channel_id, error = %err, "channel lookup failed, total unknown");
                None
            }
        };

        let mut collected = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            if pages > 0 {
                pause(self.config.page_delay).await;
            }
            let page = self
                .fetch_with_retry(channel_id, self.config.page_size, page_token.as_deref())
                .await?;
            pages += 1;
            collected.extend(page.videos);
            self.report_progress(SyncProgress {
                channel_id: channel_id.to_string(),
                fetched: collected.len(),
                estimated_total,
            });

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        info!(channel = channel_id, pages, videos = collected.len(), "full fetch complete");
        Ok(collected)
    }

    fn report_progress(&self, progress: SyncProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }

    /// Fetches the complete history of one channel and stores it.
    pub async fn full_sync_channel(&self, channel_id: &str) -> FullSyncOutcome {
        let Some(_guard) = self.locks.try_acquire(channel_id) else {
            return FullSyncOutcome {
                success: false,
                video_count: 0,
                error: Some("sync already in progress".to_string()),
            };
        };

        let run = async {
            let fetched = self
                .fetch_all(channel_id)
                .await
                .map_err(|err| format!("fetch failed: {err}"))?;
            let unique = dedupe_by_view_count(&fetched);
            self.persist(channel_id, &unique)
                .await
                .map_err(|err| format!("failed to persist fetched videos: {err}"))?;
            Ok::<usize, String>(unique.len())
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(video_count)) => FullSyncOutcome {
                success: true,
                video_count,
                error: None,
            },
            Ok(Err(message)) => {
                warn!(channel = channel_id, %message, "full sync failed");
                FullSyncOutcome {
                    success: false,
                    video_count: 0,
                    error: Some(message),
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(channel = channel_id, %message, "full sync panicked");
                FullSyncOutcome {
                    success: false,
                    video_count: 0,
                    error: Some(format!("fatal error: {message}")),
                }
            }
        }
    }

    /// Refreshes every stale channel in small batches with a fixed, modest
    /// fetch count.
    pub async fn background_sync_all_channels(&self, channel_ids: &[String]) -> BackgroundSyncReport {
        let channel_ids = unique_ids(channel_ids);
        let mut report = BackgroundSyncReport {
            channels_checked: channel_ids.len(),
            ..BackgroundSyncReport::default()
        };

        let stale = match self
            .statuses
            .list_channels_needing_sync(&channel_ids, self.config.max_age_minutes())
            .await
        {
            Ok(stale) => stale,
            Err(err) => {
                warn!(error = %err, "sync status unavailable, treating every channel as stale");
                channel_ids.clone()
            }
        };
        if stale.is_empty() {
            debug!(checked = channel_ids.len(), "no stale channels");
            return report;
        }

        let limit = VideoLimit::Limited(self.config.background_fetch_count).normalized();
        let batch_size = self.config.background_batch_size.max(1);
        for (index, batch) in stale.chunks(batch_size).enumerate() {
            if index > 0 {
                pause(self.config.background_batch_delay).await;
            }
            let result = self.sync_channels_videos(batch, limit, false).await;
            let failed: HashSet<&str> = result
                .errors
                .iter()
                .map(|err| err.channel_id.as_str())
                .collect();
            report.channels_synced += batch
                .iter()
                .filter(|id| !failed.contains(id.as_str()) && !result.skipped.contains(id))
                .count();
            report.videos += result.videos.len();
            report.errors.extend(result.errors);
        }

        info!(
            checked = report.channels_checked,
            synced = report.channels_synced,
            errors = report.errors.len(),
            "background sync pass finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::store::test_support::temp_database;
    use crate::youtube::ChannelInfo;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum Failure {
        RateLimited,
        NotFound,
        Panic,
    }

    /// Serves canned pages and records every call.
    #[derive(Default)]
    struct FakeSource {
        pages: Mutex<HashMap<String, Vec<Vec<VideoRecord>>>>,
        failures: Mutex<HashMap<String, Failure>>,
        calls: Mutex<Vec<(String, usize, Option<String>)>>,
    }

    impl FakeSource {
        fn with_pages(self, channel_id: &str, pages: Vec<Vec<VideoRecord>>) -> Self {
            self.pages.lock().insert(channel_id.to_string(), pages);
            self
        }

        fn failing(self, channel_id: &str, failure: Failure) -> Self {
            self.failures.lock().insert(channel_id.to_string(), failure);
            self
        }

        fn calls_for(&self, channel_id: &str) -> Vec<(usize, Option<String>)> {
            self.calls
                .lock()
                .iter()
                .filter(|(id, _, _)| id == channel_id)
                .map(|(_, size, token)| (*size, token.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl VideoSource for FakeSource {
        async fn fetch_page(
            &self,
            channel_id: &str,
            page_size: usize,
            page_token: Option<&str>,
        ) -> SourceResult<VideoPage> {
            self.calls.lock().push((
                channel_id.to_string(),
                page_size,
                page_token.map(str::to_string),
            ));
            let failure = self.failures.lock().get(channel_id).copied();
            match failure {
                Some(Failure::RateLimited) => {
                    return Err(SourceError::RateLimited("quota".into()));
                }
                Some(Failure::NotFound) => {
                    return Err(SourceError::NotFound(channel_id.to_string()));
                }
                Some(Failure::Panic) => panic!("source exploded"),
                None => {}
            }

            let index: usize = page_token
                .and_then(|token| token.strip_prefix("page-"))
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            let pages = self.pages.lock().get(channel_id).cloned().unwrap_or_default();
            let mut videos = pages.get(index).cloned().unwrap_or_default();
            videos.truncate(page_size);
            let next_page_token = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));
            Ok(VideoPage {
                videos,
                next_page_token,
            })
        }

        async fn get_channel(&self, channel_id: &str) -> SourceResult<ChannelInfo> {
            let total: usize = self
                .pages
                .lock()
                .get(channel_id)
                .map(|pages| pages.iter().map(Vec::len).sum())
                .ok_or_else(|| SourceError::NotFound(channel_id.to_string()))?;
            Ok(ChannelInfo {
                channel_id: channel_id.to_string(),
                title: channel_id.to_string(),
                thumbnail_url: None,
                subscriber_count: None,
                video_count: Some(total as i64),
                uploads_playlist_id: None,
            })
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn video(channel: &str, n: i64, views: i64) -> VideoRecord {
        VideoRecord {
            video_id: format!("{channel}-{n}"),
            channel_id: channel.to_string(),
            title: format!("{channel} #{n}"),
            description: String::new(),
            thumbnail_url: None,
            published_at: base_time() + ChronoDuration::hours(n),
            view_count: views,
            like_count: 0,
            comment_count: 0,
            duration_seconds: Some(300),
            views_per_hour: 1.0,
        }
    }

    fn videos(channel: &str, range: std::ops::Range<i64>) -> Vec<VideoRecord> {
        range.map(|n| video(channel, n, 100)).collect()
    }

    fn ids(channels: &[&str]) -> Vec<String> {
        channels.iter().map(|id| id.to_string()).collect()
    }

    fn test_config() -> SyncConfig {
        SyncConfig::default().without_delays()
    }

    async fn seed(db: &Database, records: &[VideoRecord], fresh_channels: &[&str]) {
        VideoStore::new(db.clone()).upsert_batch(records).await.unwrap();
        let statuses = SyncStatusStore::new(db.clone());
        for channel in fresh_channels {
            statuses.upsert(channel, 0, None).await.unwrap();
        }
    }

    async fn mark_stale(db: &Database, channel: &str) {
        SyncStatusStore::new(db.clone())
            .record_sync_at(channel, 0, None, Utc::now() - ChronoDuration::hours(2))
            .await
            .unwrap();
    }

    fn is_newest_first(videos: &[VideoRecord]) -> bool {
        videos
            .windows(2)
            .all(|pair| pair[0].published_at >= pair[1].published_at)
    }

    #[tokio::test]
    async fn fresh_cache_serves_without_fetching() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..30), &["A"]).await;
        let source = Arc::new(FakeSource::default());
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(10), false)
            .await;

        assert!(source.calls_for("A").is_empty());
        assert_eq!(result.videos.len(), 10);
        assert_eq!(result.from_cache, 10);
        assert_eq!(result.from_api, 0);
        assert_eq!(result.videos[0].video_id, "A-29");
        assert!(is_newest_first(&result.videos));
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn unlimited_forces_full_sync_even_when_fresh() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..3), &["A"]).await;
        let source = Arc::new(
            FakeSource::default().with_pages("A", vec![videos("A", 3..8), videos("A", 0..3)]),
        );
        let service = SyncService::new(source.clone(), db.clone(), test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Unlimited, false)
            .await;

        let calls = source.calls_for("A");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (MAX_PAGE_SIZE, None));
        assert_eq!(calls[1].1.as_deref(), Some("page-1"));
        assert_eq!(result.videos.len(), 8);
        assert_eq!(result.from_api, 8);
        assert_eq!(result.from_cache, 0);

        let status = SyncStatusStore::new(db).get("A").await.unwrap().unwrap();
        assert_eq!(status.total_videos, 8);
        assert_eq!(status.latest_video_at, Some(video("A", 7, 0).published_at));
        assert!(status.full_sync_completed);
    }

    #[tokio::test]
    async fn force_refresh_ignores_fresh_cache() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..30), &["A"]).await;
        let source = Arc::new(FakeSource::default().with_pages("A", vec![videos("A", 30..32)]));
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(5), true)
            .await;

        assert_eq!(source.calls_for("A").len(), 1);
        let got: Vec<_> = result.videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(got, vec!["A-31", "A-30", "A-29", "A-28", "A-27"]);
        assert_eq!(result.from_api, 2);
        assert_eq!(result.from_cache, 3);
    }

    #[tokio::test]
    async fn stale_channel_fetches_one_incremental_page() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..10), &[]).await;
        mark_stale(&db, "A").await;
        let mut refreshed = video("A", 9, 5_000);
        refreshed.title = "updated".into();
        let source = Arc::new(
            FakeSource::default().with_pages("A", vec![vec![video("A", 10, 1), refreshed]]),
        );
        let service = SyncService::new(source.clone(), db.clone(), test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(4), false)
            .await;

        assert_eq!(source.calls_for("A"), vec![(8, None)]);
        let got: Vec<_> = result.videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(got, vec!["A-10", "A-9", "A-8", "A-7"]);
        assert_eq!(result.videos[1].title, "updated");
        assert_eq!(result.from_api, 2);
        assert_eq!(result.from_cache, 2);

        let stored = VideoStore::new(db).get("A-9").await.unwrap().unwrap();
        assert_eq!(stored.view_count, 5_000);
    }

    #[test]
    fn incremental_page_size_is_capped() {
        let config = SyncConfig::default();
        assert_eq!(config.incremental_page_size(VideoLimit::Limited(10)), 20);
        assert_eq!(config.incremental_page_size(VideoLimit::Limited(40)), 50);
        assert_eq!(config.incremental_page_size(VideoLimit::Unlimited), 50);
    }

    #[tokio::test]
    async fn failing_channel_does_not_affect_others() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(
            FakeSource::default()
                .failing("A", Failure::NotFound)
                .with_pages("B", vec![videos("B", 0..4)]),
        );
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Limited(10), false)
            .await;

        assert_eq!(result.videos.len(), 4);
        assert!(result.videos.iter().all(|v| v.channel_id == "B"));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].channel_id, "A");
        assert!(result.errors[0].to_string().starts_with("A: fetch failed"));
    }

    #[tokio::test]
    async fn rate_limit_is_retried_exactly_three_times() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(FakeSource::default().failing("A", Failure::RateLimited));
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(5), false)
            .await;

        assert_eq!(source.calls_for("A").len(), 4);
        assert!(result.videos.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("rate limited"));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff_for(0), Duration::from_secs(5));
        assert_eq!(config.backoff_for(1), Duration::from_secs(10));
        assert_eq!(config.backoff_for(2), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_stored_videos() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..5), &[]).await;
        mark_stale(&db, "A").await;
        let source = Arc::new(FakeSource::default().failing("A", Failure::NotFound));
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(3), false)
            .await;

        assert_eq!(source.calls_for("A").len(), 1);
        assert_eq!(result.videos.len(), 3);
        assert_eq!(result.from_cache, 3);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn full_fetch_deduplicates_repeated_videos() {
        let (_dir, db) = temp_database().await;
        let pages = vec![
            vec![video("A", 3, 10), video("A", 2, 10)],
            vec![video("A", 2, 90), video("A", 1, 10)],
        ];
        let source = Arc::new(FakeSource::default().with_pages("A", pages));
        let service = SyncService::new(source, db.clone(), test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(10), false)
            .await;

        assert_eq!(result.videos.len(), 3);
        let duplicate = result
            .videos
            .iter()
            .find(|v| v.video_id == "A-2")
            .unwrap();
        assert_eq!(duplicate.view_count, 90);
        let store = VideoStore::new(db);
        assert_eq!(store.count_for_channel("A").await.unwrap(), 3);
        assert_eq!(store.get("A-2").await.unwrap().unwrap().view_count, 90);
    }

    #[tokio::test]
    async fn cached_and_new_channel_scenario() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..60), &["A"]).await;
        let source = Arc::new(
            FakeSource::default().with_pages("B", vec![videos("B", 100..130), videos("B", 70..100)]),
        );
        let progress: Arc<Mutex<Vec<SyncProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let service = SyncService::new(source.clone(), db, test_config())
            .with_progress(Arc::new(move |update: SyncProgress| sink.lock().push(update)));

        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Limited(10), false)
            .await;

        assert!(source.calls_for("A").is_empty());
        assert_eq!(source.calls_for("B").len(), 2);
        assert_eq!(result.videos.len(), 20);
        assert_eq!(result.from_cache, 10);
        assert_eq!(result.from_api, 10);
        assert!(is_newest_first(&result.videos));
        assert_eq!(result.videos[0].video_id, "B-129");
        assert!(result.errors.is_empty());

        let progress = progress.lock();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1].fetched, 60);
        assert_eq!(progress[1].estimated_total, Some(60));
    }

    #[tokio::test]
    async fn locked_channel_is_skipped() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(FakeSource::default().with_pages("B", vec![videos("B", 0..2)]));
        let service = SyncService::new(source.clone(), db, test_config());

        let guard = service.locks().try_acquire("A").unwrap();
        assert!(service.locks().is_locked("A"));
        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Limited(5), false)
            .await;
        assert_eq!(result.skipped, vec!["A".to_string()]);
        assert!(source.calls_for("A").is_empty());
        assert_eq!(result.videos.len(), 2);

        drop(guard);
        assert!(!service.locks().is_locked("A"));
        assert!(!service.locks().is_locked("B"));
    }

    #[tokio::test]
    async fn panic_in_one_channel_is_reported_and_releases_lock() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(
            FakeSource::default()
                .failing("A", Failure::Panic)
                .with_pages("B", vec![videos("B", 0..2)]),
        );
        let service = SyncService::new(source, db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Limited(5), false)
            .await;

        assert_eq!(result.videos.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("source exploded"));
        assert!(!service.locks().is_locked("A"));
    }

    #[tokio::test]
    async fn full_sync_channel_reports_count() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(
            FakeSource::default()
                .with_pages("A", vec![videos("A", 0..3), videos("A", 3..5)])
                .failing("X", Failure::NotFound),
        );
        let service = SyncService::new(source, db.clone(), test_config());

        let outcome = service.full_sync_channel("A").await;
        assert!(outcome.success);
        assert_eq!(outcome.video_count, 5);
        assert!(outcome.error.is_none());
        assert_eq!(
            SyncStatusStore::new(db).get("A").await.unwrap().unwrap().total_videos,
            5
        );

        let failed = service.full_sync_channel("X").await;
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("fetch failed"));

        let _guard = service.locks().try_acquire("A").unwrap();
        let busy = service.full_sync_channel("A").await;
        assert!(!busy.success);
    }

    #[tokio::test]
    async fn background_sync_only_touches_stale_channels() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..5), &["A"]).await;
        let source = Arc::new(
            FakeSource::default()
                .with_pages("B", vec![videos("B", 0..3)])
                .failing("C", Failure::NotFound),
        );
        let service = SyncService::new(source.clone(), db, test_config());

        let report = service
            .background_sync_all_channels(&ids(&["A", "B", "C"]))
            .await;

        assert_eq!(report.channels_checked, 3);
        assert_eq!(report.channels_synced, 1);
        assert_eq!(report.videos, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].channel_id, "C");
        assert!(source.calls_for("A").is_empty());
    }

    #[tokio::test]
    async fn zero_limit_means_everything() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..2), &["A"]).await;
        let source = Arc::new(
            FakeSource::default()
                .with_pages("A", vec![videos("A", 0..3)])
                .with_pages("B", vec![videos("B", 0..4)]),
        );
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(0), false)
            .await;
        assert_eq!(source.calls_for("A").len(), 1);
        assert_eq!(result.videos.len(), 3);
        assert_eq!(result.from_api, 3);

        let config = SyncConfig {
            background_fetch_count: 0,
            ..test_config()
        };
        let (_other_dir, other_db) = temp_database().await;
        let background = SyncService::new(source, other_db, config);
        let report = background.background_sync_all_channels(&ids(&["B"])).await;
        assert_eq!(report.videos, 4);
    }

    #[tokio::test]
    async fn repeated_channel_ids_sync_once() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(FakeSource::default().with_pages("A", vec![videos("A", 1..3)]));
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A", "A"]), VideoLimit::Limited(5), false)
            .await;

        assert_eq!(source.calls_for("A").len(), 1);
        let got: Vec<_> = result.videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(got, vec!["A-2", "A-1"]);
        assert_eq!(result.from_api, 2);
        assert_eq!(result.from_cache, 0);

        let report = service.background_sync_all_channels(&ids(&["B", "B"])).await;
        assert_eq!(report.channels_checked, 1);
    }

    #[tokio::test]
    async fn huge_max_age_does_not_panic_background_pass() {
        let (_dir, db) = temp_database().await;
        seed(&db, &videos("A", 0..2), &["A"]).await;
        let source = Arc::new(FakeSource::default().with_pages("B", vec![videos("B", 0..2)]));
        let config = test_config().with_max_age_minutes(1_000_000_000_000_000);
        assert!(config.max_age_minutes() > 0);
        assert!(SyncConfig::default().with_max_age_minutes(i64::MAX).max_age_minutes() > 0);
        let service = SyncService::new(source.clone(), db, config);

        let report = service
            .background_sync_all_channels(&ids(&["A", "B"]))
            .await;

        assert!(source.calls_for("A").is_empty());
        assert_eq!(report.channels_synced, 1);
        assert!(report.errors.is_empty());
    }

    async fn reject_writes_for(db: &Database, channel: &str) {
        let conn = db.connect().await.unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER reject_{channel} BEFORE INSERT ON videos \
             WHEN NEW.channel_id = '{channel}' \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;"
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn persist_failure_is_reported_and_fresh_videos_still_returned() {
        let (_dir, db) = temp_database().await;
        reject_writes_for(&db, "A").await;
        let source = Arc::new(
            FakeSource::default()
                .with_pages("A", vec![videos("A", 0..2)])
                .with_pages("B", vec![videos("B", 0..3)]),
        );
        let service = SyncService::new(source, db.clone(), test_config());

        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Limited(5), false)
            .await;

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].channel_id, "A");
        assert!(result.errors[0].message.contains("failed to persist"));
        assert_eq!(result.videos.len(), 5);
        assert_eq!(result.from_api, 5);

        let store = VideoStore::new(db.clone());
        assert_eq!(store.count_for_channel("A").await.unwrap(), 0);
        assert_eq!(store.count_for_channel("B").await.unwrap(), 3);
        let statuses = SyncStatusStore::new(db);
        assert!(statuses.get("A").await.unwrap().is_none());
        assert!(statuses.get("B").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_stored_videos_are_reported_and_refetched() {
        let (_dir, db) = temp_database().await;
        db.connect()
            .await
            .unwrap()
            .execute(
                "INSERT INTO videos (video_id, channel_id, title, published_at, updated_at) \
                 VALUES ('A-bad', 'A', 'broken', 'yesterday', 'now')",
                libsql::params![],
            )
            .await
            .unwrap();
        let source = Arc::new(
            FakeSource::default()
                .with_pages("A", vec![videos("A", 0..2)])
                .with_pages("B", vec![videos("B", 0..2)]),
        );
        let service = SyncService::new(source.clone(), db, test_config());

        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Limited(5), false)
            .await;

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].channel_id, "A");
        assert!(result.errors[0].message.contains("failed to load stored videos"));
        assert_eq!(source.calls_for("A"), vec![(MAX_PAGE_SIZE, None)]);
        assert_eq!(result.videos.len(), 4);
        assert_eq!(result.videos.iter().filter(|v| v.channel_id == "A").count(), 2);
    }

    fn assert_elapsed(started: tokio::time::Instant, secs: u64) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs)
                && elapsed < Duration::from_secs(secs) + Duration::from_millis(500),
            "expected about {secs}s, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn page_and_channel_delays_follow_schedule() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(
            FakeSource::default()
                .with_pages("A", vec![videos("A", 0..2), videos("A", 2..4)])
                .with_pages("B", vec![videos("B", 0..2), videos("B", 2..4)]),
        );
        let service = SyncService::new(source, db, SyncConfig::default());

        let started = tokio::time::Instant::now();
        let result = service
            .sync_channels_videos(&ids(&["A", "B"]), VideoLimit::Unlimited, false)
            .await;

        assert_eq!(result.videos.len(), 8);
        // page (2s), channel (5s), page (2s); nothing after the last channel
        assert_elapsed(started, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_backoff_sleeps_double_each_retry() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(FakeSource::default().failing("A", Failure::RateLimited));
        let service = SyncService::new(source.clone(), db, SyncConfig::default());

        let started = tokio::time::Instant::now();
        let result = service
            .sync_channels_videos(&ids(&["A"]), VideoLimit::Limited(5), false)
            .await;

        assert_eq!(source.calls_for("A").len(), 4);
        assert_eq!(result.errors.len(), 1);
        assert_elapsed(started, 5 + 10 + 20);
    }

    #[tokio::test(start_paused = true)]
    async fn background_batches_are_spaced_out() {
        let (_dir, db) = temp_database().await;
        let source = Arc::new(
            FakeSource::default()
                .with_pages("A", vec![videos("A", 0..2)])
                .with_pages("B", vec![videos("B", 0..2)])
                .with_pages("C", vec![videos("C", 0..2)]),
        );
        let service = SyncService::new(source, db, SyncConfig::default());

        let started = tokio::time::Instant::now();
        let report = service
            .background_sync_all_channels(&ids(&["A", "B", "C"]))
            .await;

        assert_eq!(report.channels_synced, 3);
        assert_elapsed(started, 2 * 30);
    }

    #[test]
    fn merge_prefers_fresh_and_counts_origin() {
        let stored = vec![video("A", 1, 5), video("A", 2, 5), video("A", 3, 5)];
        let fresh = vec![video("A", 4, 1), video("A", 3, 1)];
        let merged = merge_records(&fresh, stored, VideoLimit::Limited(3));
        let got: Vec<_> = merged.videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(got, vec!["A-4", "A-3", "A-2"]);
        assert_eq!(merged.videos[1].view_count, 1);
        assert_eq!(merged.from_api, 2);
        assert_eq!(merged.from_cache, 1);
    }
}
