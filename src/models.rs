#![forbid(unsafe_code)]

//! Records shared by the stores, the sync orchestrator and the HTTP API.
//!
//! Everything serializes as camelCase because the dashboard consumes these
//! structs verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One video as persisted in the `videos` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub view_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    /// Computed when the record was fetched; stored as-is afterwards.
    pub views_per_hour: f64,
}

impl VideoRecord {
    /// Views divided by hours since publish, with the elapsed time floored at
    /// one hour so fresh uploads do not report absurd rates.
    pub fn compute_views_per_hour(
        view_count: i64,
        published_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        let hours = (now - published_at).num_seconds() as f64 / 3600.0;
        view_count.max(0) as f64 / hours.max(1.0)
    }
}

/// Row of `channel_sync_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSyncStatus {
    pub channel_id: String,
    pub last_sync_at: DateTime<Utc>,
    pub total_videos: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_video_at: Option<DateTime<Utc>>,
    pub full_sync_completed: bool,
}

/// A competitor channel the user follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedChannel {
    pub channel_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub subscriber_count: Option<i64>,
    pub video_count: Option<i64>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub video_count: i64,
}

/// How many videos each channel contributes to a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum VideoLimit {
    Limited(usize),
    Unlimited,
}

impl VideoLimit {
    pub fn as_limit(self) -> Option<usize> {
        match self {
            VideoLimit::Limited(n) => Some(n),
            VideoLimit::Unlimited => None,
        }
    }

    /// `Limited(0)` asks for nothing, which callers mean as "everything".
    pub fn normalized(self) -> Self {
        match self {
            VideoLimit::Limited(0) => VideoLimit::Unlimited,
            other => other,
        }
    }
}

impl From<Option<usize>> for VideoLimit {
    /// Zero and "unset" both mean fetch everything.
    fn from(value: Option<usize>) -> Self {
        match value {
            Some(n) if n > 0 => VideoLimit::Limited(n),
            _ => VideoLimit::Unlimited,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub per_channel_limit: Option<usize>,
    #[serde(default)]
    pub force_refresh: bool,
}

impl SyncRequest {
    pub fn limit(&self) -> VideoLimit {
        VideoLimit::from(self.per_channel_limit)
    }
}

/// A failure attributed to one channel during a sync call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSyncError {
    pub channel_id: String,
    pub message: String,
}

impl ChannelSyncError {
    pub fn new(channel_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ChannelSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.channel_id, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub videos: Vec<VideoRecord>,
    pub from_cache: usize,
    pub from_api: usize,
    pub errors: Vec<ChannelSyncError>,
    /// Channels another call was already syncing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncOutcome {
    pub success: bool,
    pub video_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSyncReport {
    pub channels_checked: usize,
    pub channels_synced: usize,
    pub videos: usize,
    pub errors: Vec<ChannelSyncError>,
}

/// Fetch progress for a channel: records so far and, when the channel
/// advertises it, the expected total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub channel_id: String,
    pub fetched: usize,
    pub estimated_total: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn zero_or_missing_limit_means_unlimited() {
        assert_eq!(VideoLimit::from(None), VideoLimit::Unlimited);
        assert_eq!(VideoLimit::from(Some(0)), VideoLimit::Unlimited);
        assert_eq!(VideoLimit::from(Some(12)), VideoLimit::Limited(12));
    }

    #[test]
    fn zero_limit_normalizes_to_unlimited() {
        assert_eq!(VideoLimit::Limited(0).normalized(), VideoLimit::Unlimited);
        assert_eq!(VideoLimit::Limited(3).normalized(), VideoLimit::Limited(3));
        let decoded: VideoLimit =
            serde_json::from_str(r#"{"kind":"limited","value":0}"#).unwrap();
        assert_eq!(decoded.normalized(), VideoLimit::Unlimited);
    }

    #[test]
    fn views_per_hour_uses_elapsed_hours() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let published = now - Duration::hours(10);
        let vph = VideoRecord::compute_views_per_hour(5_000, published, now);
        assert!((vph - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn views_per_hour_floors_elapsed_time_at_one_hour() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let published = now - Duration::minutes(5);
        assert_eq!(VideoRecord::compute_views_per_hour(300, published, now), 300.0);
    }

    #[test]
    fn channel_error_displays_channel_prefix() {
        let err = ChannelSyncError::new("UC123", "quota exhausted");
        assert_eq!(err.to_string(), "UC123: quota exhausted");
    }
}
