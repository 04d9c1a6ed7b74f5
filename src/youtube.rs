#![forbid(unsafe_code)]

//! Read-only access to channel uploads.
//!
//! [`VideoSource`] is the seam the sync orchestrator depends on. The production
//! implementation, [`YouTubeClient`], walks a channel's uploads playlist through
//! the YouTube Data API v3: `channels` resolves the playlist, `playlistItems`
//! pages through it, and `videos` fills in statistics and durations for each
//! page. ureq is blocking, so every request runs on tokio's blocking pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SourceError, SourceResult};
use crate::models::VideoRecord;

/// Largest page the Data API hands out.
pub const MAX_PAGE_SIZE: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_id: String,
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub subscriber_count: Option<i64>,
    /// Advertised upload count. Approximate; used for progress estimates.
    pub video_count: Option<i64>,
    pub uploads_playlist_id: Option<String>,
}

/// One page of a channel's uploads, most recent first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoPage {
    pub videos: Vec<VideoRecord>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Fetches up to `page_size` uploads. `page_token` continues a previous
    /// page; `None` starts from the newest upload.
    async fn fetch_page(
        &self,
        channel_id: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> SourceResult<VideoPage>;

    async fn get_channel(&self, channel_id: &str) -> SourceResult<ChannelInfo>;
}

pub struct YouTubeClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    uploads_playlists: Mutex<HashMap<String, String>>,
}

impl YouTubeClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            uploads_playlists: Mutex::new(HashMap::new()),
        }
    }

    async fn get_json<T>(&self, endpoint: &str, query: Vec<(&'static str, String)>) -> SourceResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let agent = self.agent.clone();
        let url = format!("{}/{}", self.base_url, endpoint);
        let api_key = self.api_key.clone();

        tokio::task::spawn_blocking(move || {
            let mut request = agent.get(&url).query("key", &api_key);
            for (name, value) in &query {
                request = request.query(name, value);
            }
            match request.call() {
                Ok(response) => response
                    .into_json::<T>()
                    .map_err(|err| SourceError::Decode(err.to_string())),
                Err(ureq::Error::Status(status, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    Err(classify_status(status, &body))
                }
                Err(ureq::Error::Transport(err)) => Err(SourceError::Transport(err.to_string())),
            }
        })
        .await
        .map_err(|err| SourceError::Transport(format!("request task failed: {err}")))?
    }

    async fn uploads_playlist(&self, channel_id: &str) -> SourceResult<String> {
        if let Some(playlist) = self.uploads_playlists.lock().get(channel_id) {
            return Ok(playlist.clone());
        }
        let info = self.get_channel(channel_id).await?;
        info.uploads_playlist_id
            .ok_or_else(|| SourceError::NotFound(format!("uploads playlist for {channel_id}")))
    }
}

#[async_trait]
impl VideoSource for YouTubeClient {
    async fn fetch_page(
        &self,
        channel_id: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> SourceResult<VideoPage> {
        let playlist_id = self.uploads_playlist(channel_id).await?;
        let mut query = vec![
            ("part", "contentDetails".to_string()),
            ("playlistId", playlist_id),
            ("maxResults", page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let playlist: PlaylistItemsResponse = self.get_json("playlistItems", query).await?;

        let ids: Vec<String> = playlist
            .items
            .into_iter()
            .map(|item| item.content_details.video_id)
            .collect();
        if ids.is_empty() {
            return Ok(VideoPage {
                videos: Vec::new(),
                next_page_token: playlist.next_page_token,
            });
        }

        let details: VideoListResponse = self
            .get_json(
                "videos",
                vec![
                    ("part", "snippet,statistics,contentDetails".to_string()),
                    ("id", ids.join(",")),
                    ("maxResults", MAX_PAGE_SIZE.to_string()),
                ],
            )
            .await?;

        let now = Utc::now();
        let mut by_id: HashMap<String, VideoRecord> = details
            .items
            .into_iter()
            .map(|item| {
                let record = video_record_from_item(item, now);
                (record.video_id.clone(), record)
            })
            .collect();
        // Keep playlist order; private or deleted uploads have no details.
        let videos: Vec<VideoRecord> = ids.iter().filter_map(|id| by_id.remove(id)).collect();
        if videos.len() < ids.len() {
            debug!(
                channel = channel_id,
                missing = ids.len() - videos.len(),
                "uploads without video details"
            );
        }

        Ok(VideoPage {
            videos,
            next_page_token: playlist.next_page_token,
        })
    }

    async fn get_channel(&self, channel_id: &str) -> SourceResult<ChannelInfo> {
        let response: ChannelListResponse = self
            .get_json(
                "channels",
                vec![
                    ("part", "snippet,statistics,contentDetails".to_string()),
                    ("id", channel_id.to_string()),
                ],
            )
            .await?;
        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound(format!("channel {channel_id}")))?;
        let info = channel_info_from_item(item);
        if let Some(playlist) = &info.uploads_playlist_id {
            self.uploads_playlists
                .lock()
                .insert(channel_id.to_string(), playlist.clone());
        }
        Ok(info)
    }
}

/// Maps an HTTP failure to a [`SourceError`]. The API reports quota
/// exhaustion as 403 with a rate-limit reason, so the body is inspected too.
pub fn classify_status(status: u16, body: &str) -> SourceError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let message = parsed
        .as_ref()
        .map(|envelope| envelope.error.message.clone())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"));
    let rate_limited_reason = parsed.as_ref().is_some_and(|envelope| {
        envelope.error.errors.iter().any(|detail| {
            matches!(
                detail.reason.as_str(),
                "rateLimitExceeded" | "userRateLimitExceeded" | "quotaExceeded"
            )
        })
    });

    match status {
        429 => SourceError::RateLimited(message),
        403 if rate_limited_reason => SourceError::RateLimited(message),
        404 => SourceError::NotFound(message),
        _ => {
            if status >= 500 {
                warn!(status, "video source server error");
            }
            SourceError::Api { status, message }
        }
    }
}

/// Parses ISO 8601 durations as the API reports them (`PT1H2M3S`, `P1DT2H`).
pub fn parse_iso8601_duration(value: &str) -> Option<i64> {
    let rest = value.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, time),
        None => (rest, ""),
    };

    let mut total = 0i64;
    let mut digits = String::new();
    for ch in date_part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let amount: i64 = digits.parse().ok()?;
        digits.clear();
        total += match ch {
            'W' => amount * 7 * 86_400,
            'D' => amount * 86_400,
            _ => return None,
        };
    }
    if !digits.is_empty() {
        return None;
    }
    for ch in time_part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let amount: i64 = digits.parse().ok()?;
        digits.clear();
        total += match ch {
            'H' => amount * 3_600,
            'M' => amount * 60,
            'S' => amount,
            _ => return None,
        };
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

fn parse_count(value: Option<&str>) -> Option<i64> {
    value.and_then(|raw| raw.parse::<i64>().ok())
}

fn video_record_from_item(item: VideoItem, now: DateTime<Utc>) -> VideoRecord {
    let statistics = item.statistics.unwrap_or_default();
    let view_count = parse_count(statistics.view_count.as_deref()).unwrap_or(0);
    let published_at = item.snippet.published_at;
    VideoRecord {
        video_id: item.id,
        channel_id: item.snippet.channel_id,
        title: item.snippet.title,
        description: item.snippet.description,
        thumbnail_url: item.snippet.thumbnails.best_url(),
        published_at,
        view_count,
        like_count: parse_count(statistics.like_count.as_deref()).unwrap_or(0),
        comment_count: parse_count(statistics.comment_count.as_deref()).unwrap_or(0),
        duration_seconds: item
            .content_details
            .and_then(|details| details.duration)
            .as_deref()
            .and_then(parse_iso8601_duration),
        views_per_hour: VideoRecord::compute_views_per_hour(view_count, published_at, now),
    }
}

fn channel_info_from_item(item: ChannelItem) -> ChannelInfo {
    let statistics = item.statistics.unwrap_or_default();
    ChannelInfo {
        channel_id: item.id,
        title: item.snippet.title,
        thumbnail_url: item.snippet.thumbnails.best_url(),
        subscriber_count: parse_count(statistics.subscriber_count.as_deref()),
        video_count: parse_count(statistics.video_count.as_deref()),
        uploads_playlist_id: item
            .content_details
            .and_then(|details| details.related_playlists.uploads),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: String,
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorDetail {
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Thumbnails {
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    #[serde(rename = "default")]
    fallback: Option<Thumbnail>,
}

impl Thumbnails {
    fn best_url(self) -> Option<String> {
        self.high
            .or(self.medium)
            .or(self.fallback)
            .map(|thumbnail| thumbnail.url)
    }
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    id: String,
    snippet: ChannelSnippet,
    statistics: Option<ChannelStatistics>,
    content_details: Option<ChannelContentDetails>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    video_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    #[serde(default)]
    related_playlists: RelatedPlaylists,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RelatedPlaylists {
    uploads: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    content_details: PlaylistItemDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemDetails {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: VideoSnippet,
    statistics: Option<VideoStatistics>,
    content_details: Option<VideoContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    channel_id: String,
    title: String,
    #[serde(default)]
    description: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}
