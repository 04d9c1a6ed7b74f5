#![forbid(unsafe_code)]

//! Tracked channels and user-curated video collections.

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::models::{Collection, TrackedChannel};
use crate::store::{Database, format_timestamp, parse_timestamp};

fn row_to_channel(row: &Row) -> StoreResult<TrackedChannel> {
    let added_raw: String = row.get(5)?;
    Ok(TrackedChannel {
        channel_id: row.get(0)?,
        title: row.get(1)?,
        thumbnail_url: row.get(2)?,
        subscriber_count: row.get(3)?,
        video_count: row.get(4)?,
        added_at: parse_timestamp("added_at", &added_raw)?,
    })
}

#[derive(Clone)]
pub struct ChannelStore {
    db: Database,
}

impl ChannelStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the channel or refreshes its metadata. The original `added_at`
    /// survives a refresh.
    pub async fn add(&self, channel: &TrackedChannel) -> StoreResult<()> {
        let conn = self.db.connect().await?;
        conn.execute(
            r#"
            INSERT INTO tracked_channels (
                channel_id, title, thumbnail_url, subscriber_count, video_count, added_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(channel_id) DO UPDATE SET
                title = excluded.title,
                thumbnail_url = excluded.thumbnail_url,
                subscriber_count = excluded.subscriber_count,
                video_count = excluded.video_count
            "#,
            params![
                channel.channel_id.as_str(),
                channel.title.as_str(),
                channel.thumbnail_url.as_deref(),
                channel.subscriber_count,
                channel.video_count,
                format_timestamp(channel.added_at),
            ],
        )
        .await?;
        info!(channel = %channel.channel_id, "tracking channel");
        Ok(())
    }

    pub async fn remove(&self, channel_id: &str) -> StoreResult<bool> {
        let conn = self.db.connect().await?;
        let affected = conn
            .execute(
                "DELETE FROM tracked_channels WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn get(&self, channel_id: &str) -> StoreResult<Option<TrackedChannel>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT channel_id, title, thumbnail_url, subscriber_count, video_count, added_at
                FROM tracked_channels
                WHERE channel_id = ?1
                "#,
                params![channel_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    /// Oldest first.
    pub async fn list(&self) -> StoreResult<Vec<TrackedChannel>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT channel_id, title, thumbnail_url, subscriber_count, video_count, added_at
                FROM tracked_channels
                ORDER BY added_at ASC, rowid ASC
                "#,
                params![],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    pub async fn ids(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|channel| channel.channel_id)
            .collect())
    }
}

fn row_to_collection(row: &Row) -> StoreResult<Collection> {
    let created_raw: String = row.get(2)?;
    Ok(Collection {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_timestamp("created_at", &created_raw)?,
        video_count: row.get(3)?,
    })
}

const COLLECTION_SELECT: &str = r#"
    SELECT c.id, c.name, c.created_at,
           (SELECT COUNT(*) FROM collection_videos cv WHERE cv.collection_id = c.id)
    FROM collections c
"#;

#[derive(Clone)]
pub struct CollectionStore {
    db: Database,
}

impl CollectionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, name: &str) -> StoreResult<Collection> {
        let created_at = Utc::now();
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                "INSERT INTO collections (name, created_at) VALUES (?1, ?2) RETURNING id",
                params![name.trim(), format_timestamp(created_at)],
            )
            .await?;
        let id: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Err(StoreError::NotFound("inserted collection".into())),
        };
        drop(rows);
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("collection {id}")))
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<Collection>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(&format!("{COLLECTION_SELECT} WHERE c.id = ?1"), params![id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_collection(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> StoreResult<Vec<Collection>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                &format!("{COLLECTION_SELECT} ORDER BY c.created_at ASC, c.id ASC"),
                params![],
            )
            .await?;
        let mut collections = Vec::new();
        while let Some(row) = rows.next().await? {
            collections.push(row_to_collection(&row)?);
        }
        Ok(collections)
    }

    pub async fn rename(&self, id: i64, name: &str) -> StoreResult<Collection> {
        let conn = self.db.connect().await?;
        let affected = conn
            .execute(
                "UPDATE collections SET name = ?1 WHERE id = ?2",
                params![name.trim(), id],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("collection {id}")));
        }
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("collection {id}")))
    }

    /// Memberships go with it.
    pub async fn delete(&self, id: i64) -> StoreResult<bool> {
        let conn = self.db.connect().await?;
        let affected = conn
            .execute("DELETE FROM collections WHERE id = ?1", params![id])
            .await?;
        Ok(affected > 0)
    }

    /// Adds a stored video to the collection. Adding it twice is a no-op.
    pub async fn add_video(&self, collection_id: i64, video_id: &str) -> StoreResult<()> {
        self.add_video_at(collection_id, video_id, Utc::now()).await
    }

    async fn add_video_at(
        &self,
        collection_id: i64,
        video_id: &str,
        added_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if self.get(collection_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("collection {collection_id}")));
        }
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM videos WHERE video_id = ?1",
                params![video_id],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(StoreError::NotFound(format!("video {video_id}")));
        }
        drop(rows);

        conn.execute(
            r#"
            INSERT INTO collection_videos (collection_id, video_id, added_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(collection_id, video_id) DO NOTHING
            "#,
            params![collection_id, video_id, format_timestamp(added_at)],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_video(&self, collection_id: i64, video_id: &str) -> StoreResult<bool> {
        let conn = self.db.connect().await?;
        let affected = conn
            .execute(
                "DELETE FROM collection_videos WHERE collection_id = ?1 AND video_id = ?2",
                params![collection_id, video_id],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Members in the order they were added.
    pub async fn video_ids(&self, collection_id: i64) -> StoreResult<Vec<String>> {
        let conn = self.db.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT video_id FROM collection_videos
                WHERE collection_id = ?1
                ORDER BY added_at ASC, rowid ASC
                "#,
                params![collection_id],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }
}
