//! Harvest orchestration: per-channel staging and the warehouse load run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use yth_client::{
    HarvestClient, VideoApi, YouTubeApiConfig, YouTubeDataApi, DEFAULT_API_BASE_URL,
    DEFAULT_MAX_COMMENTS,
};
use yth_core::{
    transform_channel, transform_comments, transform_videos, ChannelInfo, CommentRecord,
    Diagnostic, DiagnosticKind, Outcome, VideoRecord,
};
use yth_fetch::{HttpClientConfig, PacingConfig};
use yth_warehouse::{EntityCounts, Warehouse, WarehouseError};

pub const CRATE_NAME: &str = "yth-harvest";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub warehouse_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub max_comments_per_video: usize,
    pub requests_per_second: Option<u32>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            warehouse_url: "sqlite://warehouse.db".to_string(),
            user_agent: "yth-harvester/0.1".to_string(),
            http_timeout_secs: 20,
            cache_ttl_secs: 3600,
            max_comments_per_video: DEFAULT_MAX_COMMENTS,
            requests_per_second: None,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("YOUTUBE_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            api_base_url: std::env::var("YOUTUBE_API_BASE_URL").unwrap_or(defaults.api_base_url),
            warehouse_url: std::env::var("WAREHOUSE_URL").unwrap_or(defaults.warehouse_url),
            user_agent: std::env::var("YTH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("YTH_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            cache_ttl_secs: env_parse("YTH_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl_secs),
            max_comments_per_video: env_parse("YTH_MAX_COMMENTS_PER_VIDEO")
                .unwrap_or(defaults.max_comments_per_video),
            requests_per_second: env_parse::<u32>("YTH_REQUESTS_PER_SECOND").filter(|rps| *rps > 0),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            pacing: self.requests_per_second.map(PacingConfig::per_second),
            ..Default::default()
        }
    }

    pub fn api_config(&self) -> Result<YouTubeApiConfig> {
        let api_key = self
            .api_key
            .clone()
            .context("YOUTUBE_API_KEY must be set to reach the video platform")?;
        Ok(YouTubeApiConfig {
            base_url: self.api_base_url.clone(),
            api_key,
            http: self.http_client_config(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Builds the process-wide API handle.
pub fn build_api(config: &HarvestConfig) -> Result<Arc<dyn VideoApi>> {
    let api = YouTubeDataApi::new(config.api_config()?)?;
    Ok(Arc::new(api))
}

/// Wires the live API, the memoizing client and the warehouse from `config`.
pub async fn harvester_from_config(config: &HarvestConfig) -> Result<Harvester> {
    let api = build_api(config)?;
    let client = HarvestClient::with_cache_ttl(api, Duration::from_secs(config.cache_ttl_secs));
    let warehouse = Warehouse::connect(&config.warehouse_url)
        .await
        .with_context(|| format!("opening warehouse {}", config.warehouse_url))?;
    warehouse.ensure_schema().await.context("preparing warehouse schema")?;
    Ok(Harvester::new(Arc::new(client), warehouse).with_max_comments(config.max_comments_per_video))
}

pub async fn harvester_from_env() -> Result<Harvester> {
    harvester_from_config(&HarvestConfig::from_env()).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStage {
    NotStarted,
    ChannelFetched,
    VideosFetched,
    CommentsFetched,
    Loaded,
}

/// Everything fetched so far for one channel and not yet loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedChannel {
    pub info: ChannelInfo,
    pub videos: Option<Vec<VideoRecord>>,
    pub comments: Option<Vec<CommentRecord>>,
}

impl StagedChannel {
    fn new(info: ChannelInfo) -> Self {
        Self {
            info,
            videos: None,
            comments: None,
        }
    }

    pub fn stage(&self) -> HarvestStage {
        match (&self.videos, &self.comments) {
            (None, _) => HarvestStage::ChannelFetched,
            (Some(_), None) => HarvestStage::VideosFetched,
            (Some(_), Some(_)) => HarvestStage::CommentsFetched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedSummary {
    pub channel_id: String,
    pub channel_name: String,
    pub stage: HarvestStage,
    pub videos: Option<usize>,
    pub comments: Option<usize>,
}

/// Caller-owned staging area, keyed by channel id.
#[derive(Debug, Clone, Default)]
pub struct HarvestSession {
    staged: BTreeMap<String, StagedChannel>,
    loaded: BTreeSet<String>,
}

impl HarvestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_of(&self, channel_id: &str) -> HarvestStage {
        match self.staged.get(channel_id) {
            Some(staged) => staged.stage(),
            None if self.loaded.contains(channel_id) => HarvestStage::Loaded,
            None => HarvestStage::NotStarted,
        }
    }

    pub fn staged(&self, channel_id: &str) -> Option<&StagedChannel> {
        self.staged.get(channel_id)
    }

    pub fn staged_channels(&self) -> Vec<StagedSummary> {
        self.staged
            .iter()
            .map(|(channel_id, staged)| StagedSummary {
                channel_id: channel_id.clone(),
                channel_name: staged.info.channel_name.clone(),
                stage: staged.stage(),
                videos: staged.videos.as_ref().map(Vec::len),
                comments: staged.comments.as_ref().map(Vec::len),
            })
            .collect()
    }

    pub fn loaded_channels(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn get_mut(&mut self, channel_id: &str) -> Result<&mut StagedChannel, HarvestError> {
        self.staged
            .get_mut(channel_id)
            .ok_or_else(|| HarvestError::NotStaged(channel_id.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("channel {0} has not been collected")]
    NotStaged(String),
    #[error("videos for channel {0} have not been fetched")]
    VideosNotFetched(String),
    #[error("channel {channel_id} is unavailable")]
    ChannelUnavailable {
        channel_id: String,
        diagnostics: Vec<Diagnostic>,
    },
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

impl HarvestError {
    pub fn is_not_found(&self) -> bool {
        match self {
            HarvestError::ChannelUnavailable { diagnostics, .. } => diagnostics
                .iter()
                .any(|d| d.kind == DiagnosticKind::NotFound),
            _ => false,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            HarvestError::ChannelUnavailable { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub channel_id: String,
    pub stage: HarvestStage,
    pub videos: Option<usize>,
    pub comments: Option<usize>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelLoad {
    pub channel_id: String,
    pub videos: usize,
    pub comments_offered: usize,
    pub comments_inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChannel {
    pub channel_id: String,
    pub error: String,
}

/// A channel that was written but whose lazy video or comment fetch came
/// back incomplete.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedChannel {
    pub channel_id: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub loaded: Vec<ChannelLoad>,
    pub failed: Vec<FailedChannel>,
    /// Subset of `loaded` written from partial upstream data.
    pub degraded: Vec<DegradedChannel>,
    pub diagnostics: Vec<Diagnostic>,
    pub totals: EntityCounts,
}

pub struct Harvester {
    client: Arc<HarvestClient>,
    warehouse: Warehouse,
    session: HarvestSession,
    max_comments: usize,
}

impl Harvester {
    pub fn new(client: Arc<HarvestClient>, warehouse: Warehouse) -> Self {
        Self {
            client,
            warehouse,
            session: HarvestSession::new(),
            max_comments: DEFAULT_MAX_COMMENTS,
        }
    }

    pub fn with_max_comments(mut self, max_comments: usize) -> Self {
        self.max_comments = max_comments;
        self
    }

    pub fn session(&self) -> &HarvestSession {
        &self.session
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn staged_channels(&self) -> Vec<StagedSummary> {
        self.session.staged_channels()
    }

    pub fn stage_of(&self, channel_id: &str) -> HarvestStage {
        self.session.stage_of(channel_id)
    }

    /// Looks the channel up and stages its info. A channel that is already
    /// staged gets fresh info and keeps its staged videos and comments.
    pub async fn collect(&mut self, channel_id: &str) -> Result<StepReport, HarvestError> {
        let (info, diagnostics) = self.client.get_channel_details(channel_id).await.into_parts();
        let Some(info) = info else {
            return Err(HarvestError::ChannelUnavailable {
                channel_id: channel_id.to_string(),
                diagnostics,
            });
        };

        let mut notes = Outcome::new(());
        notes.extend_diagnostics(diagnostics);
        match self.session.staged.get_mut(channel_id) {
            Some(staged) => {
                staged.info = info;
                notes.record(Diagnostic::info(
                    DiagnosticKind::ExpectedCondition,
                    format!("channel {channel_id} was already staged; refreshed its info"),
                ));
            }
            None => {
                info!(channel_id, channel_name = %info.channel_name, "staged channel");
                self.session
                    .staged
                    .insert(channel_id.to_string(), StagedChannel::new(info));
            }
        }
        self.session.loaded.remove(channel_id);
        Ok(self.step_report(channel_id, notes.diagnostics))
    }

    /// Enumerates the channel's uploads and stages their details. Staged
    /// comments are discarded since they may no longer match the videos.
    pub async fn fetch_videos(&mut self, channel_id: &str) -> Result<StepReport, HarvestError> {
        let playlist_id = self.session.get_mut(channel_id)?.info.uploads_playlist_id.clone();
        let (videos, diagnostics) = self.videos_for(&playlist_id).await.into_parts();

        let staged = self.session.get_mut(channel_id)?;
        info!(channel_id, videos = videos.len(), "staged videos");
        staged.videos = Some(videos);
        staged.comments = None;
        Ok(self.step_report(channel_id, diagnostics))
    }

    pub async fn fetch_comments(&mut self, channel_id: &str) -> Result<StepReport, HarvestError> {
        let videos = self
            .session
            .get_mut(channel_id)?
            .videos
            .clone()
            .ok_or_else(|| HarvestError::VideosNotFetched(channel_id.to_string()))?;
        let (comments, diagnostics) = self.comments_for(channel_id, &videos).await.into_parts();

        let staged = self.session.get_mut(channel_id)?;
        staged.comments = Some(comments);
        Ok(self.step_report(channel_id, diagnostics))
    }

    /// Writes every staged channel to the warehouse, channel by channel.
    /// Channels whose writes all succeed leave staging; the rest stay staged
    /// together with whatever was fetched lazily on their behalf.
    pub async fn load_all(&mut self) -> Result<LoadReport, HarvestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_load", %run_id);
        self.load_all_inner(run_id).instrument(span).await
    }

    async fn load_all_inner(&mut self, run_id: Uuid) -> Result<LoadReport, HarvestError> {
        let started_at = Utc::now();
        self.warehouse.ensure_schema().await?;

        let mut loaded = Vec::new();
        let mut failed = Vec::new();
        let mut degraded = Vec::new();
        let mut diagnostics = Vec::new();

        let channel_ids: Vec<String> = self.session.staged.keys().cloned().collect();
        info!(channels = channel_ids.len(), "loading staged channels");

        for channel_id in channel_ids {
            let noted = diagnostics.len();
            match self.load_channel(&channel_id, &mut diagnostics).await {
                Ok(load) => {
                    let failures: Vec<Diagnostic> = diagnostics[noted..]
                        .iter()
                        .filter(|d| d.is_failure())
                        .cloned()
                        .collect();
                    if !failures.is_empty() {
                        warn!(
                            channel_id,
                            failures = failures.len(),
                            "channel loaded from incomplete upstream data"
                        );
                        degraded.push(DegradedChannel {
                            channel_id: channel_id.clone(),
                            diagnostics: failures,
                        });
                    }
                    self.session.staged.remove(&channel_id);
                    self.session.loaded.insert(channel_id);
                    loaded.push(load);
                }
                Err(err) => {
                    warn!(channel_id, error = %err, "channel load failed; keeping it staged");
                    failed.push(FailedChannel {
                        channel_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        let totals = self.warehouse.entity_counts().await?;
        let finished_at = Utc::now();
        info!(
            loaded = loaded.len(),
            failed = failed.len(),
            degraded = degraded.len(),
            channels = totals.channels,
            videos = totals.videos,
            comments = totals.comments,
            "load finished"
        );

        Ok(LoadReport {
            run_id,
            started_at,
            finished_at,
            loaded,
            failed,
            degraded,
            diagnostics,
            totals,
        })
    }

    async fn load_channel(
        &mut self,
        channel_id: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<ChannelLoad, HarvestError> {
        let info = self.session.get_mut(channel_id)?.info.clone();
        self.warehouse
            .upsert_channels(&transform_channel(Some(&info)))
            .await?;

        if self.session.get_mut(channel_id)?.videos.is_none() {
            let (videos, notes) = self.videos_for(&info.uploads_playlist_id).await.into_parts();
            diagnostics.extend(notes);
            self.session.get_mut(channel_id)?.videos = Some(videos);
        }
        let videos = self.session.get_mut(channel_id)?.videos.clone().unwrap_or_default();
        let video_count = self.warehouse.upsert_videos(&transform_videos(&videos)).await?;

        if !videos.is_empty() && self.session.get_mut(channel_id)?.comments.is_none() {
            let (comments, notes) = self.comments_for(channel_id, &videos).await.into_parts();
            diagnostics.extend(notes);
            self.session.get_mut(channel_id)?.comments = Some(comments);
        }
        let comments = self.session.get_mut(channel_id)?.comments.clone().unwrap_or_default();
        let comments_inserted = self
            .warehouse
            .insert_comments(&transform_comments(&comments))
            .await?;

        Ok(ChannelLoad {
            channel_id: channel_id.to_string(),
            videos: video_count,
            comments_offered: comments.len(),
            comments_inserted,
        })
    }

    async fn videos_for(&self, playlist_id: &str) -> Outcome<Vec<VideoRecord>> {
        let (ids, mut diagnostics) = self.client.get_playlist_video_ids(playlist_id).await.into_parts();
        let (videos, more) = self.client.get_video_details(&ids).await.into_parts();
        diagnostics.extend(more);
        Outcome {
            value: videos,
            diagnostics,
        }
    }

    async fn comments_for(&self, channel_id: &str, videos: &[VideoRecord]) -> Outcome<Vec<CommentRecord>> {
        // One commentThreads walk per video: the most quota-hungry step of a harvest.
        info!(channel_id, videos = videos.len(), max_per_video = self.max_comments, "fetching comments");
        let mut outcome = Outcome::new(Vec::new());
        for video in videos {
            let (comments, diagnostics) = self
                .client
                .get_comments_of_video(&video.video_id, self.max_comments)
                .await
                .into_parts();
            outcome.value.extend(comments);
            outcome.extend_diagnostics(diagnostics);
        }
        outcome
    }

    fn step_report(&self, channel_id: &str, diagnostics: Vec<Diagnostic>) -> StepReport {
        let staged = self.session.staged(channel_id);
        StepReport {
            channel_id: channel_id.to_string(),
            stage: self.session.stage_of(channel_id),
            videos: staged.and_then(|s| s.videos.as_ref().map(Vec::len)),
            comments: staged.and_then(|s| s.comments.as_ref().map(Vec::len)),
            diagnostics,
        }
    }
}
