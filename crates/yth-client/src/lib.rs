//! Video-platform API client: collaborator contract, YouTube Data API v3
//! adapter, and the harvesting facade that paginates, batches, caps and caches.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use yth_core::{ChannelInfo, CommentRecord, Diagnostic, DiagnosticKind, Outcome, VideoRecord};
use yth_fetch::{FetchError, HttpClientConfig, HttpFetcher, TtlCache};

pub const CRATE_NAME: &str = "yth-client";

/// Upstream per-call id limit for batched video lookups.
pub const VIDEO_BATCH_SIZE: usize = 50;
pub const PLAYLIST_PAGE_SIZE: u32 = 50;
/// Upstream per-page limit for comment threads.
pub const COMMENT_PAGE_LIMIT: usize = 100;
pub const DEFAULT_MAX_COMMENTS: usize = 100;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }

    pub fn with_next(items: Vec<T>, token: impl Into<String>) -> Self {
        Self {
            items,
            next_page_token: Some(token.into()),
        }
    }

    fn continuation(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("upstream returned {status}: {message}")]
    Http {
        status: u16,
        reason: Option<String>,
        message: String,
    },
    #[error("upstream request failed: {0}")]
    Fetch(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_comments_disabled(&self) -> bool {
        matches!(
            self,
            ApiError::Http { status: 403, reason: Some(reason), .. } if reason == "commentsDisabled"
        )
    }

    pub fn kind(&self) -> DiagnosticKind {
        match self {
            ApiError::Http { status: 404, .. } => DiagnosticKind::NotFound,
            ApiError::Http { .. } | ApiError::Fetch(_) => DiagnosticKind::UpstreamTransient,
            ApiError::Malformed(_) => DiagnosticKind::MalformedResponse,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorItem {
    reason: Option<String>,
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus {
                status,
                endpoint,
                body,
            } => match serde_json::from_str::<GoogleErrorEnvelope>(&body) {
                Ok(envelope) => ApiError::Http {
                    status,
                    reason: envelope.error.errors.into_iter().find_map(|e| e.reason),
                    message: envelope.error.message,
                },
                Err(_) => ApiError::Http {
                    status,
                    reason: None,
                    message: format!("{endpoint}: {}", body.chars().take(200).collect::<String>()),
                },
            },
            FetchError::Request(err) => ApiError::Fetch(err.to_string()),
        }
    }
}

/// External video-platform collaborator returning typed records.
#[async_trait]
pub trait VideoApi: Send + Sync {
    /// `Ok(None)` when the channel does not exist.
    async fn channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, ApiError>;

    async fn playlist_items(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<Page<String>, ApiError>;

    /// At most [`VIDEO_BATCH_SIZE`] ids per call.
    async fn videos(&self, video_ids: &[String]) -> Result<Vec<VideoRecord>, ApiError>;

    /// `max_results` is at most [`COMMENT_PAGE_LIMIT`].
    async fn comment_threads(
        &self,
        video_id: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<Page<CommentRecord>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct YouTubeApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub http: HttpClientConfig,
}

/// YouTube Data API v3 over plain HTTPS GETs.
#[derive(Debug)]
pub struct YouTubeDataApi {
    base_url: Url,
    api_key: String,
    http: HttpFetcher,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResource {
    id: String,
    snippet: Option<TitleSnippet>,
    statistics: Option<ChannelStatistics>,
    content_details: Option<ChannelContentDetails>,
}

#[derive(Debug, Deserialize)]
struct TitleSnippet {
    title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    video_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelContentDetails {
    related_playlists: Option<RelatedPlaylists>,
}

#[derive(Debug, Deserialize)]
struct RelatedPlaylists {
    uploads: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemResource {
    content_details: Option<PlaylistItemContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemContentDetails {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    id: String,
    snippet: Option<VideoSnippet>,
    statistics: Option<VideoStatistics>,
    content_details: Option<VideoContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    channel_id: String,
    title: String,
    published_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadResource {
    id: String,
    snippet: CommentThreadSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadSnippet {
    top_level_comment: TopLevelComment,
}

#[derive(Debug, Deserialize)]
struct TopLevelComment {
    snippet: CommentSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    author_display_name: String,
    text_display: String,
    published_at: String,
}

fn parse_count(value: Option<&str>) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

impl YouTubeDataApi {
    pub fn new(config: YouTubeApiConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.api_key.trim().is_empty(), "YouTube API key is empty");
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("parsing API base url {}", config.base_url))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "API base url {} cannot carry resource paths",
            config.base_url
        );
        Ok(Self {
            base_url,
            api_key: config.api_key,
            http: HttpFetcher::new(config.http)?,
        })
    }

    fn endpoint(&self, resource: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(resource);
        }
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("key", &self.api_key);
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let resp = self.http.get(url).await?;
        serde_json::from_slice(&resp.body).map_err(|err| ApiError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl VideoApi for YouTubeDataApi {
    async fn channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, ApiError> {
        let url = self.endpoint(
            "channels",
            &[("part", "snippet,statistics,contentDetails"), ("id", channel_id)],
        );
        let resp: ListResponse<ChannelResource> = self.get_json(url).await?;
        let Some(channel) = resp.items.into_iter().next() else {
            return Ok(None);
        };

        let title = channel
            .snippet
            .map(|s| s.title)
            .ok_or_else(|| ApiError::Malformed(format!("channel {} has no snippet", channel.id)))?;
        let uploads = channel
            .content_details
            .and_then(|c| c.related_playlists)
            .and_then(|p| p.uploads)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                ApiError::Malformed(format!("channel {} has no uploads playlist", channel.id))
            })?;
        let stats = channel.statistics.unwrap_or_default();

        Ok(Some(ChannelInfo {
            channel_id: channel.id,
            channel_name: title,
            subscribers: parse_count(stats.subscriber_count.as_deref()),
            total_videos: parse_count(stats.video_count.as_deref()),
            uploads_playlist_id: uploads,
        }))
    }

    async fn playlist_items(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<Page<String>, ApiError> {
        let page_size = PLAYLIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "contentDetails"),
            ("playlistId", playlist_id),
            ("maxResults", page_size.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let resp: ListResponse<PlaylistItemResource> =
            self.get_json(self.endpoint("playlistItems", &params)).await?;
        Ok(Page {
            items: resp
                .items
                .into_iter()
                .filter_map(|item| item.content_details.map(|c| c.video_id))
                .collect(),
            next_page_token: resp.next_page_token,
        })
    }

    async fn videos(&self, video_ids: &[String]) -> Result<Vec<VideoRecord>, ApiError> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = video_ids.join(",");
        let url = self.endpoint(
            "videos",
            &[("part", "snippet,statistics,contentDetails"), ("id", ids.as_str())],
        );
        let resp: ListResponse<VideoResource> = self.get_json(url).await?;

        let mut records = Vec::with_capacity(resp.items.len());
        for item in resp.items {
            let Some(snippet) = item.snippet else {
                warn!(video_id = %item.id, "video resource without snippet; skipping");
                continue;
            };
            let stats = item.statistics.unwrap_or_default();
            records.push(VideoRecord {
                video_id: item.id,
                channel_id: snippet.channel_id,
                title: snippet.title,
                published_date: snippet.published_at,
                views: parse_count(stats.view_count.as_deref()),
                likes: parse_count(stats.like_count.as_deref()),
                comments_count: parse_count(stats.comment_count.as_deref()),
                duration: item.content_details.and_then(|c| c.duration),
            });
        }
        Ok(records)
    }

    async fn comment_threads(
        &self,
        video_id: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<Page<CommentRecord>, ApiError> {
        let max_results = max_results.clamp(1, COMMENT_PAGE_LIMIT as u32).to_string();
        let mut params = vec![
            ("part", "snippet"),
            ("videoId", video_id),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let resp: ListResponse<CommentThreadResource> =
            self.get_json(self.endpoint("commentThreads", &params)).await?;
        Ok(Page {
            items: resp
                .items
                .into_iter()
                .map(|thread| {
                    let snippet = thread.snippet.top_level_comment.snippet;
                    CommentRecord {
                        comment_id: thread.id,
                        video_id: video_id.to_string(),
                        author: snippet.author_display_name,
                        comment_text: snippet.text_display,
                        published_date: snippet.published_at,
                    }
                })
                .collect(),
            next_page_token: resp.next_page_token,
        })
    }
}

type Cache<K, V> = Mutex<TtlCache<K, Outcome<V>>>;

/// Harvest-facing client. Every operation degrades to an empty/absent value
/// plus diagnostics instead of failing, and successful results are memoized
/// per argument set for the configured TTL.
pub struct HarvestClient {
    api: Arc<dyn VideoApi>,
    channels: Cache<String, Option<ChannelInfo>>,
    playlists: Cache<String, Vec<String>>,
    videos: Cache<Vec<String>, Vec<VideoRecord>>,
    comments: Cache<(String, usize), Vec<CommentRecord>>,
}

impl HarvestClient {
    pub fn new(api: Arc<dyn VideoApi>) -> Self {
        Self::with_cache_ttl(api, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(api: Arc<dyn VideoApi>, ttl: Duration) -> Self {
        Self {
            api,
            channels: Mutex::new(TtlCache::new(ttl)),
            playlists: Mutex::new(TtlCache::new(ttl)),
            videos: Mutex::new(TtlCache::new(ttl)),
            comments: Mutex::new(TtlCache::new(ttl)),
        }
    }

    pub async fn get_channel_details(&self, channel_id: &str) -> Outcome<Option<ChannelInfo>> {
        cached(&self.channels, channel_id.to_string(), || {
            self.fetch_channel_details(channel_id)
        })
        .await
    }

    pub async fn get_playlist_video_ids(&self, playlist_id: &str) -> Outcome<Vec<String>> {
        cached(&self.playlists, playlist_id.to_string(), || {
            self.fetch_playlist_video_ids(playlist_id)
        })
        .await
    }

    pub async fn get_video_details(&self, video_ids: &[String]) -> Outcome<Vec<VideoRecord>> {
        if video_ids.is_empty() {
            return Outcome::new(Vec::new());
        }
        cached(&self.videos, video_ids.to_vec(), || {
            self.fetch_video_details(video_ids)
        })
        .await
    }

    pub async fn get_comments_of_video(
        &self,
        video_id: &str,
        max_results: usize,
    ) -> Outcome<Vec<CommentRecord>> {
        cached(&self.comments, (video_id.to_string(), max_results), || {
            self.fetch_comments_of_video(video_id, max_results)
        })
        .await
    }

    async fn fetch_channel_details(&self, channel_id: &str) -> Outcome<Option<ChannelInfo>> {
        match self.api.channel(channel_id).await {
            Ok(Some(info)) => {
                info!(channel_id, channel_name = %info.channel_name, "fetched channel");
                Outcome::new(Some(info))
            }
            Ok(None) => Outcome::with_diagnostic(
                None,
                Diagnostic::error(
                    DiagnosticKind::NotFound,
                    format!("no channel found for id {channel_id}"),
                ),
            ),
            Err(err) => Outcome::with_diagnostic(
                None,
                Diagnostic::error(err.kind(), format!("channel lookup for {channel_id} failed: {err}")),
            ),
        }
    }

    async fn fetch_playlist_video_ids(&self, playlist_id: &str) -> Outcome<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            match self.api.playlist_items(playlist_id, page_token.as_deref()).await {
                Ok(page) => {
                    pages += 1;
                    let next = page.continuation().map(str::to_string);
                    ids.extend(page.items);
                    match next {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
                Err(err) => {
                    return Outcome::with_diagnostic(
                        Vec::new(),
                        Diagnostic::warning(
                            err.kind(),
                            format!("listing playlist {playlist_id} failed on page {}: {err}", pages + 1),
                        ),
                    );
                }
            }
        }

        debug!(playlist_id, pages, videos = ids.len(), "enumerated playlist");
        Outcome::new(ids)
    }

    async fn fetch_video_details(&self, video_ids: &[String]) -> Outcome<Vec<VideoRecord>> {
        let mut outcome = Outcome::new(Vec::with_capacity(video_ids.len()));

        for (batch_index, batch) in video_ids.chunks(VIDEO_BATCH_SIZE).enumerate() {
            let start = batch_index * VIDEO_BATCH_SIZE;
            let end = start + batch.len();
            match self.api.videos(batch).await {
                Ok(records) => {
                    debug!(start, end, fetched = records.len(), "fetched video batch");
                    outcome.value.extend(records);
                }
                Err(err) => outcome.record(Diagnostic::error(
                    err.kind(),
                    format!("video details batch {start}-{end} failed: {err}"),
                )),
            }
        }

        outcome
    }

    async fn fetch_comments_of_video(
        &self,
        video_id: &str,
        max_results: usize,
    ) -> Outcome<Vec<CommentRecord>> {
        let mut comments = Vec::new();
        let mut page_token: Option<String> = None;

        while comments.len() < max_results {
            let remaining = max_results - comments.len();
            let request = remaining.min(COMMENT_PAGE_LIMIT) as u32;
            match self
                .api
                .comment_threads(video_id, page_token.as_deref(), request)
                .await
            {
                Ok(page) => {
                    let next = page.continuation().map(str::to_string);
                    comments.extend(page.items.into_iter().take(remaining));
                    match next {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
                Err(err) if err.is_comments_disabled() => {
                    return Outcome::with_diagnostic(
                        Vec::new(),
                        Diagnostic::info(
                            DiagnosticKind::ExpectedCondition,
                            format!("comments are disabled for video {video_id}"),
                        ),
                    );
                }
                Err(err) => {
                    return Outcome::with_diagnostic(
                        Vec::new(),
                        Diagnostic::error(
                            err.kind(),
                            format!("fetching comments for video {video_id} failed: {err}"),
                        ),
                    );
                }
            }
        }

        Outcome::new(comments)
    }
}

async fn cached<K, V, F, Fut>(cache: &Cache<K, V>, key: K, fetch: F) -> Outcome<V>
where
    K: Eq + Hash,
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Outcome<V>>,
{
    if let Some(hit) = cache.lock().await.get(&key) {
        debug!("serving cached upstream result");
        return hit;
    }
    let outcome = fetch().await;
    if !outcome.has_failures() {
        cache.lock().await.insert(key, outcome.clone());
    }
    outcome
}
