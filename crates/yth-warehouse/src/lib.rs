//! SQLite warehouse gateway: schema, idempotent writes, read queries and the
//! canned analysis menu.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteColumn, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, info};
use yth_core::{ChannelRow, CommentRow, Diagnostic, DiagnosticKind, Outcome, VideoRow};

pub const CRATE_NAME: &str = "yth-warehouse";

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        channel_id          TEXT PRIMARY KEY NOT NULL,
        channel_name        TEXT NOT NULL,
        subscribers         INTEGER NOT NULL DEFAULT 0,
        total_videos        INTEGER NOT NULL DEFAULT 0,
        uploads_playlist_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS videos (
        video_id         TEXT PRIMARY KEY NOT NULL,
        channel_id       TEXT NOT NULL REFERENCES channels(channel_id),
        title            TEXT NOT NULL,
        published_date   DATE,
        views            INTEGER NOT NULL DEFAULT 0,
        likes            INTEGER NOT NULL DEFAULT 0,
        comments_count   INTEGER NOT NULL DEFAULT 0,
        duration_seconds INTEGER NOT NULL DEFAULT 0 CHECK (duration_seconds >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        comment_id     TEXT PRIMARY KEY NOT NULL,
        video_id       TEXT NOT NULL REFERENCES videos(video_id),
        author         TEXT NOT NULL,
        comment_text   TEXT NOT NULL,
        published_date DATE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_videos_channel_id ON videos(channel_id)",
    "CREATE INDEX IF NOT EXISTS idx_comments_video_id ON comments(video_id)",
];

const UPSERT_CHANNEL: &str = r#"
    INSERT INTO channels (channel_id, channel_name, subscribers, total_videos, uploads_playlist_id)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(channel_id) DO UPDATE SET
        channel_name        = excluded.channel_name,
        subscribers         = excluded.subscribers,
        total_videos        = excluded.total_videos,
        uploads_playlist_id = excluded.uploads_playlist_id
"#;

// channel_id is the owning identity, not a mutable attribute.
const UPSERT_VIDEO: &str = r#"
    INSERT INTO videos (video_id, channel_id, title, published_date, views, likes, comments_count, duration_seconds)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(video_id) DO UPDATE SET
        title            = excluded.title,
        published_date   = excluded.published_date,
        views            = excluded.views,
        likes            = excluded.likes,
        comments_count   = excluded.comments_count,
        duration_seconds = excluded.duration_seconds
"#;

const INSERT_COMMENT: &str = r#"
    INSERT INTO comments (comment_id, video_id, author, comment_text, published_date)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(comment_id) DO NOTHING
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Channels,
    Videos,
    Comments,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Channels => "channels",
            Entity::Videos => "videos",
            Entity::Comments => "comments",
        })
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("invalid warehouse url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connecting to warehouse: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("creating warehouse schema: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("{entity} batch rolled back at row {row} ({key}): {source}")]
    Batch {
        entity: Entity,
        row: usize,
        key: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{entity} batch transaction failed: {source}")]
    Transaction {
        entity: Entity,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

/// Dynamically typed cell of an ad-hoc query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Vec<&CellValue> {
        match self.column_index(name) {
            Some(idx) => self.rows.iter().filter_map(|row| row.get(idx)).collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelListing {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub channels: i64,
    pub videos: i64,
    pub comments: i64,
}

/// Canned analytical queries. Each template takes one optional channel id as
/// `?1`; a NULL binding disables the filter without touching the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisQuery {
    VideosWithChannels,
    ChannelsByVideoCount,
    TopViewedVideos,
    CommentsPerVideo,
    MostLikedVideos,
    LikesPerVideo,
    ViewsPerChannel,
    ChannelsPublishingIn2022,
    AverageDurationPerChannel,
    MostCommentedVideos,
}

impl AnalysisQuery {
    pub const ALL: [AnalysisQuery; 10] = [
        AnalysisQuery::VideosWithChannels,
        AnalysisQuery::ChannelsByVideoCount,
        AnalysisQuery::TopViewedVideos,
        AnalysisQuery::CommentsPerVideo,
        AnalysisQuery::MostLikedVideos,
        AnalysisQuery::LikesPerVideo,
        AnalysisQuery::ViewsPerChannel,
        AnalysisQuery::ChannelsPublishingIn2022,
        AnalysisQuery::AverageDurationPerChannel,
        AnalysisQuery::MostCommentedVideos,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            AnalysisQuery::VideosWithChannels => "videos-with-channels",
            AnalysisQuery::ChannelsByVideoCount => "channels-by-video-count",
            AnalysisQuery::TopViewedVideos => "top-viewed-videos",
            AnalysisQuery::CommentsPerVideo => "comments-per-video",
            AnalysisQuery::MostLikedVideos => "most-liked-videos",
            AnalysisQuery::LikesPerVideo => "likes-per-video",
            AnalysisQuery::ViewsPerChannel => "views-per-channel",
            AnalysisQuery::ChannelsPublishingIn2022 => "channels-publishing-in-2022",
            AnalysisQuery::AverageDurationPerChannel => "average-duration-per-channel",
            AnalysisQuery::MostCommentedVideos => "most-commented-videos",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.slug() == slug)
    }

    pub fn description(self) -> &'static str {
        match self {
            AnalysisQuery::VideosWithChannels => "Names of all videos and their corresponding channels",
            AnalysisQuery::ChannelsByVideoCount => "Channels with the most videos",
            AnalysisQuery::TopViewedVideos => "Top 10 most viewed videos and their channels",
            AnalysisQuery::CommentsPerVideo => "Comments count per video and video names",
            AnalysisQuery::MostLikedVideos => "Videos with the highest likes and their channels",
            AnalysisQuery::LikesPerVideo => "Total likes and dislikes for each video and video names",
            AnalysisQuery::ViewsPerChannel => "Total views per channel and channel names",
            AnalysisQuery::ChannelsPublishingIn2022 => "Channels with videos published in 2022",
            AnalysisQuery::AverageDurationPerChannel => "Average duration of all videos in each channel",
            AnalysisQuery::MostCommentedVideos => "Videos with the highest comments and their channels",
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            AnalysisQuery::VideosWithChannels => {
                r#"
                SELECT v.title AS video_title, c.channel_name
                  FROM videos v
                  JOIN channels c ON v.channel_id = c.channel_id
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 ORDER BY c.channel_name, v.title
                "#
            }
            AnalysisQuery::ChannelsByVideoCount => {
                r#"
                SELECT c.channel_name, c.total_videos
                  FROM channels c
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 ORDER BY c.total_videos DESC, c.channel_name
                "#
            }
            AnalysisQuery::TopViewedVideos => {
                r#"
                SELECT v.title AS video_title, c.channel_name, v.views
                  FROM videos v
                  JOIN channels c ON v.channel_id = c.channel_id
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 ORDER BY v.views DESC, v.title
                 LIMIT 10
                "#
            }
            AnalysisQuery::CommentsPerVideo => {
                r#"
                SELECT v.title AS video_title, v.comments_count
                  FROM videos v
                 WHERE (?1 IS NULL OR v.channel_id = ?1)
                 ORDER BY v.title
                "#
            }
            AnalysisQuery::MostLikedVideos => {
                r#"
                SELECT v.title AS video_title, c.channel_name, v.likes
                  FROM videos v
                  JOIN channels c ON v.channel_id = c.channel_id
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 ORDER BY v.likes DESC, v.title
                "#
            }
            AnalysisQuery::LikesPerVideo => {
                r#"
                SELECT v.title AS video_title, v.likes, 0 AS dislikes
                  FROM videos v
                 WHERE (?1 IS NULL OR v.channel_id = ?1)
                 ORDER BY v.title
                "#
            }
            AnalysisQuery::ViewsPerChannel => {
                r#"
                SELECT c.channel_name, SUM(v.views) AS total_channel_views
                  FROM channels c
                  JOIN videos v ON c.channel_id = v.channel_id
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 GROUP BY c.channel_id, c.channel_name
                 ORDER BY total_channel_views DESC, c.channel_name
                "#
            }
            AnalysisQuery::ChannelsPublishingIn2022 => {
                r#"
                SELECT DISTINCT c.channel_name
                  FROM channels c
                  JOIN videos v ON c.channel_id = v.channel_id
                 WHERE strftime('%Y', v.published_date) = '2022'
                   AND (?1 IS NULL OR c.channel_id = ?1)
                 ORDER BY c.channel_name
                "#
            }
            AnalysisQuery::AverageDurationPerChannel => {
                r#"
                SELECT c.channel_name, AVG(v.duration_seconds) AS average_video_duration_seconds
                  FROM channels c
                  JOIN videos v ON c.channel_id = v.channel_id
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 GROUP BY c.channel_id, c.channel_name
                 ORDER BY c.channel_name
                "#
            }
            AnalysisQuery::MostCommentedVideos => {
                r#"
                SELECT v.title AS video_title, c.channel_name, v.comments_count
                  FROM videos v
                  JOIN channels c ON v.channel_id = c.channel_id
                 WHERE (?1 IS NULL OR c.channel_id = ?1)
                 ORDER BY v.comments_count DESC, v.title
                "#
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    /// Opens (creating if needed) the SQLite warehouse at `url`, e.g.
    /// `sqlite://warehouse.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, WarehouseError> {
        if !url.starts_with("sqlite:") {
            return Err(WarehouseError::InvalidUrl {
                url: url.to_string(),
                reason: "expected a sqlite: connection string".into(),
            });
        }
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| WarehouseError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database.
        let pool_options = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(WarehouseError::Connect)?;
        info!(url, "connected to warehouse");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, WarehouseError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the three tables and their indexes when absent.
    pub async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        let mut tx = self.pool.begin().await.map_err(WarehouseError::Schema)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(WarehouseError::Schema)?;
        }
        tx.commit().await.map_err(WarehouseError::Schema)?;
        debug!("warehouse schema ensured");
        Ok(())
    }

    pub async fn upsert_channels(&self, rows: &[ChannelRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let entity = Entity::Channels;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| WarehouseError::Transaction { entity, source })?;

        // An early return drops `tx`, which rolls the batch back.
        for (idx, row) in rows.iter().enumerate() {
            sqlx::query(UPSERT_CHANNEL)
                .bind(&row.channel_id)
                .bind(&row.channel_name)
                .bind(row.subscribers)
                .bind(row.total_videos)
                .bind(&row.uploads_playlist_id)
                .execute(&mut *tx)
                .await
                .map_err(|source| WarehouseError::Batch {
                    entity,
                    row: idx,
                    key: row.channel_id.clone(),
                    source,
                })?;
        }

        tx.commit()
            .await
            .map_err(|source| WarehouseError::Transaction { entity, source })?;
        info!(%entity, rows = rows.len(), "upserted batch");
        Ok(rows.len())
    }

    pub async fn upsert_videos(&self, rows: &[VideoRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let entity = Entity::Videos;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| WarehouseError::Transaction { entity, source })?;

        for (idx, row) in rows.iter().enumerate() {
            sqlx::query(UPSERT_VIDEO)
                .bind(&row.video_id)
                .bind(&row.channel_id)
                .bind(&row.title)
                .bind(row.published_date)
                .bind(row.views)
                .bind(row.likes)
                .bind(row.comments_count)
                .bind(row.duration_seconds.max(0))
                .execute(&mut *tx)
                .await
                .map_err(|source| WarehouseError::Batch {
                    entity,
                    row: idx,
                    key: row.video_id.clone(),
                    source,
                })?;
        }

        tx.commit()
            .await
            .map_err(|source| WarehouseError::Transaction { entity, source })?;
        info!(%entity, rows = rows.len(), "upserted batch");
        Ok(rows.len())
    }

    /// Inserts comments whose id is not stored yet; returns how many were new.
    pub async fn insert_comments(&self, rows: &[CommentRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let entity = Entity::Comments;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| WarehouseError::Transaction { entity, source })?;

        let mut inserted = 0u64;
        for (idx, row) in rows.iter().enumerate() {
            let result = sqlx::query(INSERT_COMMENT)
                .bind(&row.comment_id)
                .bind(&row.video_id)
                .bind(&row.author)
                .bind(&row.comment_text)
                .bind(row.published_date)
                .execute(&mut *tx)
                .await
                .map_err(|source| WarehouseError::Batch {
                    entity,
                    row: idx,
                    key: row.comment_id.clone(),
                    source,
                })?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|source| WarehouseError::Transaction { entity, source })?;
        info!(%entity, offered = rows.len(), inserted, "inserted batch");
        Ok(inserted as usize)
    }

    /// Runs an ad-hoc read statement. Anything else is refused, and the
    /// statement runs inside a transaction that is always rolled back.
    pub async fn run_query(&self, sql: &str) -> Outcome<QueryResult> {
        if !is_read_statement(sql) {
            return Outcome::with_diagnostic(
                QueryResult::default(),
                Diagnostic::error(
                    DiagnosticKind::StorageFailure,
                    "only a single SELECT, WITH, VALUES or EXPLAIN statement can be run as a query",
                ),
            );
        }
        match self.fetch_table(sql, None).await {
            Ok(table) => Outcome::new(table),
            Err(err) => Outcome::with_diagnostic(
                QueryResult::default(),
                Diagnostic::error(DiagnosticKind::StorageFailure, format!("query failed: {err}")),
            ),
        }
    }

    pub async fn run_analysis(
        &self,
        query: AnalysisQuery,
        channel_filter: Option<&str>,
    ) -> Outcome<QueryResult> {
        let channel_filter = channel_filter.map(str::trim).filter(|c| !c.is_empty());
        match self.fetch_table(query.sql(), Some(channel_filter)).await {
            Ok(table) => Outcome::new(table),
            Err(err) => Outcome::with_diagnostic(
                QueryResult::default(),
                Diagnostic::error(
                    DiagnosticKind::StorageFailure,
                    format!("analysis {} failed: {err}", query.slug()),
                ),
            ),
        }
    }

    pub async fn list_channels(&self) -> Outcome<Vec<ChannelListing>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT channel_name, channel_id FROM channels ORDER BY channel_name, channel_id",
        )
        .fetch_all(&self.pool)
        .await;
        match rows {
            Ok(rows) => Outcome::new(
                rows.into_iter()
                    .map(|(name, id)| ChannelListing { name, id })
                    .collect(),
            ),
            Err(err) => Outcome::with_diagnostic(
                Vec::new(),
                Diagnostic::error(
                    DiagnosticKind::StorageFailure,
                    format!("listing channels failed: {err}"),
                ),
            ),
        }
    }

    pub async fn entity_counts(&self) -> Result<EntityCounts, WarehouseError> {
        let (channels, videos, comments) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT (SELECT COUNT(*) FROM channels),
                   (SELECT COUNT(*) FROM videos),
                   (SELECT COUNT(*) FROM comments)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(EntityCounts {
            channels,
            videos,
            comments,
        })
    }

    async fn fetch_table(
        &self,
        sql: &str,
        channel_filter: Option<Option<&str>>,
    ) -> Result<QueryResult, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let mut query = sqlx::query(sql);
        if let Some(filter) = channel_filter {
            query = query.bind(filter);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let columns = match rows.first() {
            Some(row) => column_names(row.columns()),
            None => column_names((&mut *tx).prepare(sql).await?.columns()),
        };
        let rows = rows.iter().map(row_cells).collect::<Result<Vec<_>, _>>()?;

        tx.rollback().await?;
        Ok(QueryResult { columns, rows })
    }
}

fn column_names(columns: &[SqliteColumn]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

fn row_cells(row: &SqliteRow) -> Result<Vec<CellValue>, sqlx::Error> {
    (0..row.len())
        .map(|idx| {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(CellValue::Null);
            }
            let type_name = raw.type_info().name().to_ascii_uppercase();
            let cell = match type_name.as_str() {
                "INTEGER" => CellValue::Integer(row.try_get_unchecked::<i64, _>(idx)?),
                "REAL" => CellValue::Real(row.try_get_unchecked::<f64, _>(idx)?),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
                    CellValue::Text(format!("<{} bytes>", bytes.len()))
                }
                _ => CellValue::Text(row.try_get_unchecked::<String, _>(idx)?),
            };
            Ok(cell)
        })
        .collect()
}

fn is_read_statement(sql: &str) -> bool {
    let body = strip_leading_comments(sql);
    let body = body.trim_end().trim_end_matches(';');
    if body.is_empty() || has_unquoted_semicolon(body) {
        return false;
    }
    let keyword = body
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(keyword.as_str(), "SELECT" | "WITH" | "VALUES" | "EXPLAIN")
}

// Quotes are SQL-style: a doubled quote inside a literal is an escape, which
// toggling handles without special casing.
fn has_unquoted_semicolon(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match (quote, ch) {
            (None, ';') => return true,
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (Some(open), _) if ch == open => quote = None,
            _ => {}
        }
    }
    false
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else {
            return rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn warehouse() -> Warehouse {
        let wh = Warehouse::in_memory().await.expect("in-memory warehouse");
        wh.ensure_schema().await.expect("schema");
        wh
    }

    fn channel(id: &str, name: &str, subscribers: i64) -> ChannelRow {
        ChannelRow {
            channel_id: id.into(),
            channel_name: name.into(),
            subscribers,
            total_videos: 2,
            uploads_playlist_id: format!("UU{id}"),
        }
    }

    fn video(id: &str, channel_id: &str, views: i64, published: (i32, u32, u32)) -> VideoRow {
        VideoRow {
            video_id: id.into(),
            channel_id: channel_id.into(),
            title: format!("title {id}"),
            published_date: NaiveDate::from_ymd_opt(published.0, published.1, published.2),
            views,
            likes: views / 10,
            comments_count: 1,
            duration_seconds: 60,
        }
    }

    fn comment(id: &str, video_id: &str, text: &str) -> CommentRow {
        CommentRow {
            comment_id: id.into(),
            video_id: video_id.into(),
            author: "@viewer".into(),
            comment_text: text.into(),
            published_date: NaiveDate::from_ymd_opt(2023, 1, 2),
        }
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let wh = warehouse().await;
        wh.ensure_schema().await.expect("second ensure");
        assert_eq!(wh.entity_counts().await.unwrap(), EntityCounts::default());
    }

    #[tokio::test]
    async fn channel_upsert_keeps_one_row_and_last_write_wins() {
        let wh = warehouse().await;
        let rows = vec![channel("C1", "Rust Talks", 10), channel("C2", "Go Talks", 20)];
        assert_eq!(wh.upsert_channels(&rows).await.unwrap(), 2);
        assert_eq!(wh.upsert_channels(&rows).await.unwrap(), 2);
        assert_eq!(wh.entity_counts().await.unwrap().channels, 2);

        wh.upsert_channels(&[channel("C1", "Rust Talks Live", 99)])
            .await
            .unwrap();
        let result = wh
            .run_query("SELECT channel_name, subscribers FROM channels WHERE channel_id = 'C1'")
            .await;
        assert!(result.diagnostics.is_empty());
        assert_eq!(
            result.value.rows,
            vec![vec![CellValue::Text("Rust Talks Live".into()), CellValue::Integer(99)]]
        );
    }

    #[tokio::test]
    async fn video_upsert_overwrites_counts_snapshot() {
        let wh = warehouse().await;
        wh.upsert_channels(&[channel("C1", "Rust Talks", 1)]).await.unwrap();
        wh.upsert_videos(&[video("V1", "C1", 100, (2022, 3, 1))]).await.unwrap();
        wh.upsert_videos(&[video("V1", "C1", 250, (2022, 3, 1))]).await.unwrap();

        let result = wh
            .run_query("SELECT views, published_date FROM videos WHERE video_id = 'V1'")
            .await;
        assert_eq!(
            result.value.rows,
            vec![vec![CellValue::Integer(250), CellValue::Text("2022-03-01".into())]]
        );
        assert_eq!(wh.entity_counts().await.unwrap().videos, 1);
    }

    #[tokio::test]
    async fn comment_insert_is_append_only() {
        let wh = warehouse().await;
        wh.upsert_channels(&[channel("C1", "Rust Talks", 1)]).await.unwrap();
        wh.upsert_videos(&[video("V1", "C1", 1, (2023, 1, 1))]).await.unwrap();

        assert_eq!(wh.insert_comments(&[comment("K1", "V1", "first")]).await.unwrap(), 1);
        assert_eq!(wh.insert_comments(&[comment("K1", "V1", "edited")]).await.unwrap(), 0);

        let result = wh
            .run_query("SELECT comment_text FROM comments WHERE comment_id = 'K1'")
            .await;
        assert_eq!(result.value.rows, vec![vec![CellValue::Text("first".into())]]);
        assert_eq!(wh.entity_counts().await.unwrap().comments, 1);
    }

    #[tokio::test]
    async fn foreign_key_violation_rolls_back_whole_batch() {
        let wh = warehouse().await;
        wh.upsert_channels(&[channel("C1", "Rust Talks", 1)]).await.unwrap();

        let err = wh
            .upsert_videos(&[video("V1", "C1", 1, (2023, 1, 1)), video("V2", "C404", 1, (2023, 1, 1))])
            .await
            .unwrap_err();
        match err {
            WarehouseError::Batch { entity, row, key, .. } => {
                assert_eq!(entity, Entity::Videos);
                assert_eq!(row, 1);
                assert_eq!(key, "V2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(wh.entity_counts().await.unwrap().videos, 0);

        let err = wh
            .insert_comments(&[comment("K1", "V404", "orphan")])
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Batch { entity: Entity::Comments, .. }));
    }

    #[tokio::test]
    async fn negative_durations_are_clamped() {
        let wh = warehouse().await;
        wh.upsert_channels(&[channel("C1", "Rust Talks", 1)]).await.unwrap();
        let mut row = video("V1", "C1", 1, (2023, 1, 1));
        row.duration_seconds = -5;
        wh.upsert_videos(&[row]).await.unwrap();
        let result = wh.run_query("SELECT duration_seconds FROM videos").await;
        assert_eq!(result.value.rows, vec![vec![CellValue::Integer(0)]]);
    }

    #[tokio::test]
    async fn empty_batches_are_no_ops() {
        let wh = warehouse().await;
        assert_eq!(wh.upsert_channels(&[]).await.unwrap(), 0);
        assert_eq!(wh.upsert_videos(&[]).await.unwrap(), 0);
        assert_eq!(wh.insert_comments(&[]).await.unwrap(), 0);
    }

    async fn seeded() -> Warehouse {
        let wh = warehouse().await;
        wh.upsert_channels(&[channel("C1", "Alpha", 10), channel("C2", "Beta", 20)])
            .await
            .unwrap();
        wh.upsert_videos(&[
            video("V1", "C1", 500, (2022, 5, 1)),
            video("V2", "C1", 100, (2023, 5, 1)),
            video("V3", "C2", 900, (2021, 5, 1)),
        ])
        .await
        .unwrap();
        wh
    }

    #[tokio::test]
    async fn analysis_filter_is_a_bound_parameter() {
        let wh = seeded().await;

        let all = wh.run_analysis(AnalysisQuery::VideosWithChannels, None).await;
        assert!(all.diagnostics.is_empty());
        assert_eq!(all.value.columns, vec!["video_title", "channel_name"]);
        assert_eq!(all.value.len(), 3);

        let blank = wh.run_analysis(AnalysisQuery::VideosWithChannels, Some("  ")).await;
        assert_eq!(blank.value.len(), 3);

        let alpha = wh.run_analysis(AnalysisQuery::VideosWithChannels, Some("C1")).await;
        assert_eq!(alpha.value.len(), 2);
        assert!(alpha
            .value
            .column_values("channel_name")
            .iter()
            .all(|v| **v == CellValue::Text("Alpha".into())));

        let hostile = wh
            .run_analysis(AnalysisQuery::VideosWithChannels, Some("C1' OR '1'='1"))
            .await;
        assert!(hostile.value.is_empty());
    }

    #[tokio::test]
    async fn every_canned_query_runs_with_and_without_filter() {
        let wh = seeded().await;
        for query in AnalysisQuery::ALL {
            let unfiltered = wh.run_analysis(query, None).await;
            assert!(unfiltered.diagnostics.is_empty(), "{} failed", query.slug());
            let filtered = wh.run_analysis(query, Some("C2")).await;
            assert!(filtered.diagnostics.is_empty(), "{} failed", query.slug());
            assert!(filtered.value.len() <= unfiltered.value.len());
            assert_eq!(AnalysisQuery::from_slug(query.slug()), Some(query));
        }
    }

    #[tokio::test]
    async fn aggregate_queries_return_typed_cells() {
        let wh = seeded().await;

        let views = wh.run_analysis(AnalysisQuery::ViewsPerChannel, None).await;
        assert_eq!(
            views.value.rows,
            vec![
                vec![CellValue::Text("Beta".into()), CellValue::Integer(900)],
                vec![CellValue::Text("Alpha".into()), CellValue::Integer(600)],
            ]
        );

        let avg = wh
            .run_analysis(AnalysisQuery::AverageDurationPerChannel, Some("C1"))
            .await;
        assert_eq!(
            avg.value.rows,
            vec![vec![CellValue::Text("Alpha".into()), CellValue::Real(60.0)]]
        );

        let in_2022 = wh.run_analysis(AnalysisQuery::ChannelsPublishingIn2022, None).await;
        assert_eq!(in_2022.value.rows, vec![vec![CellValue::Text("Alpha".into())]]);
    }

    #[tokio::test]
    async fn empty_results_still_report_columns() {
        let wh = warehouse().await;
        let result = wh.run_analysis(AnalysisQuery::TopViewedVideos, None).await;
        assert!(result.value.is_empty());
        assert_eq!(result.value.columns, vec!["video_title", "channel_name", "views"]);
    }

    #[tokio::test]
    async fn ad_hoc_queries_refuse_writes_and_report_errors() {
        let wh = seeded().await;

        let drop = wh.run_query("DROP TABLE comments").await;
        assert!(drop.value.is_empty());
        assert_eq!(drop.diagnostics[0].kind, DiagnosticKind::StorageFailure);

        let stacked = wh.run_query("SELECT 1; DELETE FROM videos").await;
        assert_eq!(stacked.diagnostics.len(), 1);

        // A data-modifying CTE slips past the keyword check but is rolled back.
        wh.run_query(
            "WITH doomed AS (SELECT video_id FROM videos) DELETE FROM videos WHERE video_id IN (SELECT video_id FROM doomed)",
        )
        .await;
        assert_eq!(wh.entity_counts().await.unwrap().videos, 3);

        let broken = wh.run_query("SELECT nope FROM nowhere").await;
        assert!(broken.value.is_empty());
        assert!(broken.diagnostics[0].message.contains("query failed"));

        let commented = wh
            .run_query("-- videos per channel\nSELECT COUNT(*) AS n FROM videos;")
            .await;
        assert_eq!(commented.value.rows, vec![vec![CellValue::Integer(3)]]);
    }

    #[tokio::test]
    async fn semicolons_inside_literals_are_not_separators() {
        let wh = seeded().await;

        let like = wh
            .run_query("SELECT COUNT(*) AS n FROM videos WHERE title NOT LIKE '%;%'")
            .await;
        assert!(like.diagnostics.is_empty());
        assert_eq!(like.value.rows, vec![vec![CellValue::Integer(3)]]);

        let literal = wh.run_query("SELECT 'a;b' AS s;").await;
        assert!(literal.diagnostics.is_empty());
        assert_eq!(literal.value.rows, vec![vec![CellValue::Text("a;b".into())]]);
    }

    #[tokio::test]
    async fn channel_listing_is_sorted_by_name() {
        let wh = seeded().await;
        let listing = wh.list_channels().await;
        assert_eq!(
            listing.value,
            vec![
                ChannelListing { name: "Alpha".into(), id: "C1".into() },
                ChannelListing { name: "Beta".into(), id: "C2".into() },
            ]
        );
        assert!(warehouse().await.list_channels().await.value.is_empty());
    }

    #[tokio::test]
    async fn file_backed_warehouse_persists_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("wh.db").display());

        let wh = Warehouse::connect(&url).await.unwrap();
        wh.ensure_schema().await.unwrap();
        wh.upsert_channels(&[channel("C1", "Alpha", 1)]).await.unwrap();
        wh.pool().close().await;

        let reopened = Warehouse::connect(&url).await.unwrap();
        assert_eq!(reopened.entity_counts().await.unwrap().channels, 1);
    }

    #[tokio::test]
    async fn non_sqlite_urls_are_rejected() {
        let err = Warehouse::connect("mysql://root@localhost/yt").await.unwrap_err();
        assert!(matches!(err, WarehouseError::InvalidUrl { .. }));
    }

    #[test]
    fn read_statement_detection() {
        assert!(is_read_statement("select * from videos"));
        assert!(is_read_statement("  /* c */ WITH x AS (SELECT 1) SELECT * FROM x;"));
        assert!(is_read_statement("VALUES (1)"));
        assert!(!is_read_statement(""));
        assert!(!is_read_statement("UPDATE videos SET views = 0"));
        assert!(!is_read_statement("SELECT 1; SELECT 2"));
        assert!(is_read_statement("SELECT * FROM comments WHERE comment_text LIKE '%;%'"));
        assert!(is_read_statement("SELECT 'it''s; fine' AS note;"));
        assert!(is_read_statement("SELECT \"odd;name\" FROM t"));
        assert!(!is_read_statement("SELECT ';'; DELETE FROM videos"));
    }

    #[test]
    fn cells_serialize_as_plain_json() {
        let table = QueryResult {
            columns: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            rows: vec![vec![
                CellValue::Null,
                CellValue::Integer(3),
                CellValue::Real(1.5),
                CellValue::Text("x".into()),
            ]],
        };
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["rows"][0], serde_json::json!([null, 3, 1.5, "x"]));
    }
}
