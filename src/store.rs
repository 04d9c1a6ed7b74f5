#![forbid(unsafe_code)]

//! Persistence layer for TubeIntel.
//!
//! All tables live in one SQLite-compatible file opened through libsql.
//! Timestamps are stored as RFC 3339 UTC strings with second precision so that
//! lexical ordering in SQL matches chronological ordering.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::{ChannelSyncStatus, VideoRecord};

async fn configure_connection(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            thumbnail_url TEXT,
            published_at TEXT NOT NULL,
            view_count INTEGER NOT NULL DEFAULT 0,
            like_count INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            duration_seconds INTEGER,
            views_per_hour REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel_published
            ON videos(channel_id, published_at DESC);

        CREATE TABLE IF NOT EXISTS channel_sync_status (
            channel_id TEXT PRIMARY KEY,
            last_sync_at TEXT NOT NULL,
            total_videos INTEGER NOT NULL DEFAULT 0,
            latest_video_at TEXT,
            full_sync_completed INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS tracked_channels (
            channel_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            thumbnail_url TEXT,
            subscriber_count INTEGER,
            video_count INTEGER,
            added_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collection_videos (
            collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
            video_id TEXT NOT NULL,
            added_at TEXT NOT NULL,
            PRIMARY KEY (collection_id, video_id)
        );

        CREATE INDEX IF NOT EXISTS idx_collection_videos_video
            ON collection_videos(video_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Handle to the database file. Cheap to clone; every store operation opens
/// its own short-lived connection so concurrent callers never share a
/// transaction.
#[derive(Clone)]
pub struct Database {
    db: Arc<libsql::Database>,
}

impl Database {
    /// Opens (and if necessary creates) the database file and provisions the
    /// schema.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Builder::new_local(path).build().await?;
        let database = Self { db: Arc::new(db) };
        let conn = database.connect().await?;
        ensure_schema(&conn).await?;
        debug!(path = %path.display(), "database ready");
        Ok(database)
    }

    pub(crate) async fn connect(&self) -> StoreResult<Connection> {
        let conn = self.db.connect()?;
        configure_connection(&conn).await?;
        Ok(conn)
    }
}

pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_timestamp(column: &'static str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}

pub(crate) fn parse_optional_timestamp(
    column: &'static str,
    value: Option<String>,
) -> StoreResult<Option<DateTime<Utc>>> {
    value
        .as_deref()
        .map(|raw| parse_timestamp(column, raw))
        .transpose()
}

pub(crate) const VIDEO_COLUMNS: &str = "video_id, channel_id, title, description, thumbnail_url, \
     published_at, view_count, like_count, comment_count, duration_seconds, views_per_hour";

/// Converts a SQL row into a `VideoRecord`.
// Column order must match VIDEO_COLUMNS.
pub(crate) fn row_to_video(row: &Row) -> StoreResult<VideoRecord> {
    let published_raw: String = row.get(5)?;
    Ok(VideoRecord {
        video_id: row.get(0)?,
        channel_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        thumbnail_url: row.get(4)?,
        published_at: parse_timestamp("published_at", &published_raw)?,
        view_count: row.get(6)?,
        like_count: row.get(7)?,
        comment_count: row.get(8)?,
        duration_seconds: row.get(9)?,
        views_per_hour: row.get(10)?,
    })
}

/// Sorts newest-first; ties fall back to the id so repeated calls agree.
pub fn sort_newest_first(videos: &mut [VideoRecord]) {
    videos.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.video_id.cmp(&b.video_id))
    });
}

/// Collapses duplicate ids, keeping the copy with the higher view count. The
/// first occurrence wins ties. Input order of the survivors is preserved.
pub fn dedupe_by_view_count(records: &[VideoRecord]) -> Vec<VideoRecord> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut unique: Vec<VideoRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(record.video_id.as_str()) {
            Some(&index) => {
                if record.view_count > unique[index].view_count {
                    unique[index] = record.clone();
                }
            }
            None => {
                positions.insert(record.video_id.as_str(), unique.len());
                unique.push(record.clone());
            }
        }
    }
    unique
}

/// Reads and writes rows of the `videos` table.
#[derive(Clone)]
pub struct VideoStore {
    db: Database,
}

impl VideoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored videos for the given channels, newest first. With a limit, each
    /// channel contributes at most that many of its newest videos.
    pub async fn get_for_channels(
        &self,
        channel_ids: &[String],
        per_channel_limit: Option<usize>,
    ) -> StoreResult<Vec<VideoRecord>> {
        let conn = self.db.connect().await?;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = per_channel_limit.map(|n| n as i64).unwrap_or(-1);
        let mut seen = HashSet::new();
        let mut videos = Vec::new();

        for channel_id in channel_ids {
            if !seen.insert(channel_id.as_str()) {
                continue;
            }
            let mut rows = conn
                .query(
                    &format!(
                        r#"
                        SELECT {VIDEO_COLUMNS}
                        FROM videos
                        WHERE channel_id = ?1
                        ORDER BY published_at DESC, video_id ASC
                        LIMIT ?2
                        "#
                    ),
                    params![channel_id.as_str(), limit],
                )
                .await?;
            while let Some(row) = rows.next().await? {
                videos.push(row_to_video(&row)?);
            }
        }

        sort_newest_first(&mut videos);
        Ok(videos)
    }

    pub async fn get(&self, video_id: &str) -> StoreResult<Option<VideoRecord>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE video_id = ?1"),
                params![video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// Missing ids are skipped; the result follows the order of `video_ids`.
    pub async fn get_many(&self, video_ids: &[String]) -> StoreResult<Vec<VideoRecord>> {
        let mut videos = Vec::with_capacity(video_ids.len());
        for video_id in video_ids {
            if let Some(video) = self.get(video_id).await? {
                videos.push(video);
            }
        }
        Ok(videos)
    }

    /// Deduplicates the batch by id (higher view count wins) and upserts every
    /// survivor in one transaction. Returns the number of rows written.
    pub async fn upsert_batch(&self, records: &[VideoRecord]) -> StoreResult<usize> {
        let unique = dedupe_by_view_count(records);
        if unique.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connect().await?;
        let now = format_timestamp(Utc::now());
        let tx = conn.transaction().await?;
        for record in &unique {
            tx.execute(
                r#"
                INSERT INTO videos (
                    video_id, channel_id, title, description, thumbnail_url,
                    published_at, view_count, like_count, comment_count,
                    duration_seconds, views_per_hour, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(video_id) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    title = excluded.title,
                    description = excluded.description,
                    thumbnail_url = excluded.thumbnail_url,
                    published_at = excluded.published_at,
                    view_count = excluded.view_count,
                    like_count = excluded.like_count,
                    comment_count = excluded.comment_count,
                    duration_seconds = excluded.duration_seconds,
                    views_per_hour = excluded.views_per_hour,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.video_id.as_str(),
                    record.channel_id.as_str(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.thumbnail_url.as_deref(),
                    format_timestamp(record.published_at),
                    record.view_count,
                    record.like_count,
                    record.comment_count,
                    record.duration_seconds,
                    record.views_per_hour,
                    now.as_str(),
                ],
            )
            .await?;
        }
        tx.commit().await?;

        debug!(
            received = records.len(),
            written = unique.len(),
            "upserted video batch"
        );
        Ok(unique.len())
    }

    pub async fn latest_publish_date(&self, channel_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                "SELECT MAX(published_at) FROM videos WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        parse_optional_timestamp("published_at", row.get(0)?)
    }

    pub async fn count_for_channel(&self, channel_id: &str) -> StoreResult<i64> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM videos WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// True when the channel has never synced or its last sync is older than
/// `max_age_minutes`.
pub fn is_stale(
    status: Option<&ChannelSyncStatus>,
    max_age_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    match status {
        None => true,
        // An age past the representable range never expires.
        Some(status) => Duration::try_minutes(max_age_minutes)
            .is_some_and(|max_age| now - status.last_sync_at > max_age),
    }
}

fn row_to_status(row: &Row) -> StoreResult<ChannelSyncStatus> {
    let last_sync_raw: String = row.get(1)?;
    Ok(ChannelSyncStatus {
        channel_id: row.get(0)?,
        last_sync_at: parse_timestamp("last_sync_at", &last_sync_raw)?,
        total_videos: row.get(2)?,
        latest_video_at: parse_optional_timestamp("latest_video_at", row.get(3)?)?,
        full_sync_completed: row.get::<i64>(4)? != 0,
    })
}

/// Reads and writes `channel_sync_status`.
#[derive(Clone)]
pub struct SyncStatusStore {
    db: Database,
}

impl SyncStatusStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, channel_id: &str) -> StoreResult<Option<ChannelSyncStatus>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT channel_id, last_sync_at, total_videos, latest_video_at, full_sync_completed
                FROM channel_sync_status
                WHERE channel_id = ?1
                "#,
                params![channel_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_status(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> StoreResult<Vec<ChannelSyncStatus>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT channel_id, last_sync_at, total_videos, latest_video_at, full_sync_completed
                FROM channel_sync_status
                ORDER BY channel_id
                "#,
                params![],
            )
            .await?;
        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await? {
            statuses.push(row_to_status(&row)?);
        }
        Ok(statuses)
    }

    /// Records a completed sync. A `None` latest timestamp keeps whatever was
    /// stored before.
    pub async fn upsert(
        &self,
        channel_id: &str,
        total_videos: i64,
        latest_video_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.record_sync_at(channel_id, total_videos, latest_video_at, Utc::now())
            .await
    }

    pub(crate) async fn record_sync_at(
        &self,
        channel_id: &str,
        total_videos: i64,
        latest_video_at: Option<DateTime<Utc>>,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.db.connect().await?;
        conn.execute(
            r#"
            INSERT INTO channel_sync_status (
                channel_id, last_sync_at, total_videos, latest_video_at, full_sync_completed
            ) VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT(channel_id) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                total_videos = excluded.total_videos,
                latest_video_at = COALESCE(excluded.latest_video_at, channel_sync_status.latest_video_at),
                full_sync_completed = 1
            "#,
            params![
                channel_id,
                format_timestamp(synced_at),
                total_videos,
                latest_video_at.map(format_timestamp),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn needs_sync(&self, channel_id: &str, max_age_minutes: i64) -> StoreResult<bool> {
        let status = self.get(channel_id).await?;
        Ok(is_stale(status.as_ref(), max_age_minutes, Utc::now()))
    }

    /// Keeps the caller's order.
    pub async fn list_channels_needing_sync(
        &self,
        channel_ids: &[String],
        max_age_minutes: i64,
    ) -> StoreResult<Vec<String>> {
        let mut stale = Vec::new();
        for channel_id in channel_ids {
            if self.needs_sync(channel_id, max_age_minutes).await? {
                stale.push(channel_id.clone());
            }
        }
        Ok(stale)
    }

    pub async fn remove(&self, channel_id: &str) -> StoreResult<bool> {
        let conn = self.db.connect().await?;
        let affected = conn
            .execute(
                "DELETE FROM channel_sync_status WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        Ok(affected > 0)
    }
}
