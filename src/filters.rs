#![forbid(unsafe_code)]

//! Presentation-side filtering and ordering of stored videos and tracked
//! channels. Everything here is pure; callers pass `now` explicitly so that
//! relative time ranges are testable.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{TrackedChannel, VideoRecord};

/// Videos at or under this length count as shorts.
pub const SHORTS_MAX_SECONDS: i64 = 60;

/// Parses counts typed into a filter box: `1200`, `1,200`, `250+`, `1.5k`,
/// `2M`, `1b`. Anything else is `None`.
pub fn parse_threshold(raw: &str) -> Option<u64> {
    let cleaned: String = raw
        .chars()
        .filter(|ch| *ch != ',' && !ch.is_whitespace())
        .collect();
    let cleaned = cleaned.strip_suffix('+').unwrap_or(&cleaned);
    let last = cleaned.chars().last()?;
    let (number, multiplier) = match last.to_ascii_lowercase() {
        'k' => (&cleaned[..cleaned.len() - 1], 1e3),
        'm' => (&cleaned[..cleaned.len() - 1], 1e6),
        'b' => (&cleaned[..cleaned.len() - 1], 1e9),
        _ => (cleaned, 1.0),
    };
    if number.is_empty() || !number.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    let scaled = (value * multiplier).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u64::MAX as f64 {
        return None;
    }
    Some(scaled as u64)
}

/// Parses `HH:MM:SS`, `MM:SS` or a bare number of minutes into minutes.
pub fn parse_duration_minutes(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.contains(':') {
        let minutes: f64 = trimmed.parse().ok()?;
        return (minutes.is_finite() && minutes >= 0.0).then_some(minutes);
    }

    let parts: Vec<u64> = trimmed
        .split(':')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [minutes, seconds] => Some(*minutes as f64 + *seconds as f64 / 60.0),
        [hours, minutes, seconds] => {
            Some(*hours as f64 * 60.0 + *minutes as f64 + *seconds as f64 / 60.0)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShortsMode {
    #[default]
    All,
    ShortsOnly,
    ExcludeShorts,
}

impl ShortsMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shorts" | "shortsonly" | "shorts_only" | "only" => ShortsMode::ShortsOnly,
            "exclude" | "excludeshorts" | "exclude_shorts" | "videos" | "long" => {
                ShortsMode::ExcludeShorts
            }
            _ => ShortsMode::All,
        }
    }
}

/// A video is a short when it runs a minute or less. Without a known
/// duration the `#shorts` title tag decides.
pub fn is_short(video: &VideoRecord) -> bool {
    match video.duration_seconds {
        Some(seconds) => seconds <= SHORTS_MAX_SECONDS,
        None => video.title.to_lowercase().contains("#shorts"),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl CountRange {
    pub fn contains(&self, value: i64) -> bool {
        let value = value.max(0) as u64;
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }

    fn from_raw(min: Option<&str>, max: Option<&str>) -> Self {
        Self {
            min: min.and_then(parse_threshold),
            max: max.and_then(parse_threshold),
        }
    }
}

/// Inclusive bounds in minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationRange {
    pub min_minutes: Option<f64>,
    pub max_minutes: Option<f64>,
}

impl DurationRange {
    pub fn is_unbounded(&self) -> bool {
        self.min_minutes.is_none() && self.max_minutes.is_none()
    }

    /// A video of unknown length only passes an unbounded range.
    pub fn contains(&self, duration_seconds: Option<i64>) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(seconds) = duration_seconds else {
            return false;
        };
        let minutes = seconds as f64 / 60.0;
        self.min_minutes.is_none_or(|min| minutes >= min)
            && self.max_minutes.is_none_or(|max| minutes <= max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TimeRange {
    #[default]
    Any,
    Last24Hours,
    Last7Days,
    Last30Days,
    Last90Days,
    LastYear,
    /// Both dates inclusive, interpreted as UTC days.
    Custom {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

impl TimeRange {
    fn parse(raw: &str, start: Option<&str>, end: Option<&str>) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "24h" | "day" | "today" => TimeRange::Last24Hours,
            "7d" | "week" => TimeRange::Last7Days,
            "30d" | "month" => TimeRange::Last30Days,
            "90d" | "3m" | "quarter" => TimeRange::Last90Days,
            "365d" | "1y" | "year" => TimeRange::LastYear,
            "custom" => TimeRange::Custom {
                start: start.and_then(parse_date),
                end: end.and_then(parse_date),
            },
            _ => TimeRange::Any,
        }
    }

    /// Earliest and latest publish time admitted at `now`.
    pub fn bounds(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match *self {
            TimeRange::Any => (None, None),
            TimeRange::Last24Hours => (Some(now - Duration::hours(24)), None),
            TimeRange::Last7Days => (Some(now - Duration::days(7)), None),
            TimeRange::Last30Days => (Some(now - Duration::days(30)), None),
            TimeRange::Last90Days => (Some(now - Duration::days(90)), None),
            TimeRange::LastYear => (Some(now - Duration::days(365)), None),
            TimeRange::Custom { start, end } => (
                start.map(|date| date.and_time(NaiveTime::MIN).and_utc()),
                end.and_then(|date| date.succ_opt())
                    .map(|date| date.and_time(NaiveTime::MIN).and_utc() - Duration::nanoseconds(1)),
            ),
        }
    }

    pub fn contains(&self, published_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let (from, until) = self.bounds(now);
        from.is_none_or(|from| published_at >= from) && until.is_none_or(|until| published_at <= until)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|value| value.with_timezone(&Utc).date_naive())
        })
}

fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .collect()
}

/// Filter form values as the dashboard submits them. Every field is free
/// text; anything that fails to parse is treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawVideoFilter {
    pub shorts: Option<String>,
    pub min_duration: Option<String>,
    pub max_duration: Option<String>,
    pub min_views: Option<String>,
    pub max_views: Option<String>,
    pub min_likes: Option<String>,
    pub max_likes: Option<String>,
    pub min_comments: Option<String>,
    pub max_comments: Option<String>,
    pub time_range: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Comma separated.
    pub include_keywords: Option<String>,
    pub exclude_keywords: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoFilter {
    pub shorts: ShortsMode,
    pub duration: DurationRange,
    pub views: CountRange,
    pub likes: CountRange,
    pub comments: CountRange,
    pub time_range: TimeRange,
    /// Lowercase. A video must mention at least one.
    pub include_keywords: Vec<String>,
    /// Lowercase. Mentioning any of these excludes the video.
    pub exclude_keywords: Vec<String>,
}

impl VideoFilter {
    pub fn from_raw(raw: &RawVideoFilter) -> Self {
        Self {
            shorts: raw.shorts.as_deref().map(ShortsMode::parse).unwrap_or_default(),
            duration: DurationRange {
                min_minutes: raw.min_duration.as_deref().and_then(parse_duration_minutes),
                max_minutes: raw.max_duration.as_deref().and_then(parse_duration_minutes),
            },
            views: CountRange::from_raw(raw.min_views.as_deref(), raw.max_views.as_deref()),
            likes: CountRange::from_raw(raw.min_likes.as_deref(), raw.max_likes.as_deref()),
            comments: CountRange::from_raw(
                raw.min_comments.as_deref(),
                raw.max_comments.as_deref(),
            ),
            time_range: raw
                .time_range
                .as_deref()
                .map(|value| {
                    TimeRange::parse(value, raw.start_date.as_deref(), raw.end_date.as_deref())
                })
                .unwrap_or_default(),
            include_keywords: raw
                .include_keywords
                .as_deref()
                .map(parse_keywords)
                .unwrap_or_default(),
            exclude_keywords: raw
                .exclude_keywords
                .as_deref()
                .map(parse_keywords)
                .unwrap_or_default(),
        }
    }

    pub fn matches(&self, video: &VideoRecord, now: DateTime<Utc>) -> bool {
        let shorts_ok = match self.shorts {
            ShortsMode::All => true,
            ShortsMode::ShortsOnly => is_short(video),
            ShortsMode::ExcludeShorts => !is_short(video),
        };
        if !shorts_ok
            || !self.duration.contains(video.duration_seconds)
            || !self.views.contains(video.view_count)
            || !self.likes.contains(video.like_count)
            || !self.comments.contains(video.comment_count)
            || !self.time_range.contains(video.published_at, now)
        {
            return false;
        }

        if self.include_keywords.is_empty() && self.exclude_keywords.is_empty() {
            return true;
        }
        let haystack = format!("{}\n{}", video.title, video.description).to_lowercase();
        let included = self.include_keywords.is_empty()
            || self
                .include_keywords
                .iter()
                .any(|keyword| haystack.contains(keyword.as_str()));
        included
            && !self
                .exclude_keywords
                .iter()
                .any(|keyword| haystack.contains(keyword.as_str()))
    }

    pub fn apply(&self, videos: &[VideoRecord], now: DateTime<Utc>) -> Vec<VideoRecord> {
        videos
            .iter()
            .filter(|video| self.matches(video, now))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    Date,
    Likes,
    Views,
    ViewsPerHour,
}

/// Sorts descending by `key`. The sort is stable, so equal keys keep their
/// incoming order and sorting twice gives the same result.
pub fn sort_videos(videos: &mut [VideoRecord], key: SortKey) {
    videos.sort_by(|a, b| compare_desc(a, b, key));
}

fn compare_desc(a: &VideoRecord, b: &VideoRecord, key: SortKey) -> Ordering {
    match key {
        SortKey::Date => b.published_at.cmp(&a.published_at),
        SortKey::Likes => b.like_count.cmp(&a.like_count),
        SortKey::Views => b.view_count.cmp(&a.view_count),
        SortKey::ViewsPerHour => b.views_per_hour.total_cmp(&a.views_per_hour),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawChannelFilter {
    pub min_subscribers: Option<String>,
    pub max_subscribers: Option<String>,
    pub min_videos: Option<String>,
    pub max_videos: Option<String>,
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelFilter {
    pub subscribers: CountRange,
    pub videos: CountRange,
    pub keyword: Option<String>,
}

impl ChannelFilter {
    pub fn from_raw(raw: &RawChannelFilter) -> Self {
        Self {
            subscribers: CountRange::from_raw(
                raw.min_subscribers.as_deref(),
                raw.max_subscribers.as_deref(),
            ),
            videos: CountRange::from_raw(raw.min_videos.as_deref(), raw.max_videos.as_deref()),
            keyword: raw
                .keyword
                .as_deref()
                .map(|value| value.trim().to_lowercase())
                .filter(|value| !value.is_empty()),
        }
    }

    // Channels without a published count fail any bound placed on it.
    fn count_ok(range: &CountRange, value: Option<i64>) -> bool {
        if range.min.is_none() && range.max.is_none() {
            return true;
        }
        value.is_some_and(|value| range.contains(value))
    }

    pub fn matches(&self, channel: &TrackedChannel) -> bool {
        Self::count_ok(&self.subscribers, channel.subscriber_count)
            && Self::count_ok(&self.videos, channel.video_count)
            && self.keyword.as_deref().is_none_or(|keyword| {
                channel.title.to_lowercase().contains(keyword)
                    || channel.channel_id.to_lowercase().contains(keyword)
            })
    }
}

pub fn filter_channels(channels: &[TrackedChannel], filter: &ChannelFilter) -> Vec<TrackedChannel> {
    channels
        .iter()
        .filter(|channel| filter.matches(channel))
        .cloned()
        .collect()
}
