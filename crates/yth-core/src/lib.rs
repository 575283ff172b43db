//! Core domain model, diagnostics and pure normalization/transform helpers.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "yth-core";

/// Channel metadata as returned by the platform, before tabulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub channel_name: String,
    pub subscribers: i64,
    pub total_videos: i64,
    pub uploads_playlist_id: String,
}

/// Video metadata as returned by the platform. `duration` is the encoded
/// `PnDTnHnMnS` string and `published_date` the raw ISO-8601 timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VideoRecord {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub published_date: String,
    pub views: i64,
    pub likes: i64,
    pub comments_count: i64,
    pub duration: Option<String>,
}

/// Top-level comment as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommentRecord {
    pub comment_id: String,
    pub video_id: String,
    pub author: String,
    pub comment_text: String,
    pub published_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub channel_id: String,
    pub channel_name: String,
    pub subscribers: i64,
    pub total_videos: i64,
    pub uploads_playlist_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRow {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub published_date: Option<NaiveDate>,
    pub views: i64,
    pub likes: i64,
    pub comments_count: i64,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRow {
    pub comment_id: String,
    pub video_id: String,
    pub author: String,
    pub comment_text: String,
    pub published_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    NotFound,
    UpstreamTransient,
    ExpectedCondition,
    StorageFailure,
    MalformedResponse,
}

/// Human-readable note recorded at the point a failure (or expected
/// condition) was absorbed instead of propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn info(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            kind,
            message: message.into(),
        }
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            message: message.into(),
        }
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.severity >= Severity::Warning
    }

    fn emit(&self) {
        match self.severity {
            Severity::Info => info!(kind = ?self.kind, "{}", self.message),
            Severity::Warning => warn!(kind = ?self.kind, "{}", self.message),
            Severity::Error => error!(kind = ?self.kind, "{}", self.message),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}/{:?}] {}", self.severity, self.kind, self.message)
    }
}

/// A value together with the diagnostics recorded while producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostic(value: T, diagnostic: Diagnostic) -> Self {
        let mut outcome = Self::new(value);
        outcome.record(diagnostic);
        outcome
    }

    /// Logs the diagnostic through `tracing` and keeps it for the caller.
    pub fn record(&mut self, diagnostic: Diagnostic) {
        diagnostic.emit();
        self.diagnostics.push(diagnostic);
    }

    pub fn extend_diagnostics(&mut self, diagnostics: Vec<Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    pub fn has_failures(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_failure)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            diagnostics: self.diagnostics,
        }
    }

    pub fn into_parts(self) -> (T, Vec<Diagnostic>) {
        (self.value, self.diagnostics)
    }
}

/// Converts an encoded `P[n]D[T[n]H[n]M[n]S]` duration into whole seconds.
///
/// Absent, malformed, fractional or overflowing input yields 0.
pub fn parse_duration(text: Option<&str>) -> i64 {
    text.and_then(duration_seconds).unwrap_or(0)
}

fn duration_seconds(text: &str) -> Option<i64> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date_part, time_part)) => (date_part, time_part),
        None => (rest, ""),
    };
    let days = sum_designators(date_part, &[('D', 86_400)])?;
    let clock = sum_designators(time_part, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    days.checked_add(clock)
}

// Designators must appear in the given order, at most once each.
fn sum_designators(part: &str, units: &[(char, i64)]) -> Option<i64> {
    let mut remaining = units;
    let mut total = 0i64;
    let mut number_start = 0usize;

    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_digit() {
            continue;
        }
        let digits = &part[number_start..idx];
        if digits.is_empty() {
            return None;
        }
        let position = remaining.iter().position(|(unit, _)| *unit == ch)?;
        let factor = remaining[position].1;
        remaining = &remaining[position + 1..];

        let value: i64 = digits.parse().ok()?;
        total = total.checked_add(value.checked_mul(factor)?)?;
        number_start = idx + ch.len_utf8();
    }

    if number_start != part.len() {
        return None;
    }
    Some(total)
}

/// Reduces an ISO-8601 timestamp (or bare date) to its UTC calendar date.
pub fn normalize_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc).date_naive());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(ts.date());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()
}

pub fn transform_channel(info: Option<&ChannelInfo>) -> Vec<ChannelRow> {
    match info {
        Some(info) if !info.channel_id.is_empty() => vec![ChannelRow {
            channel_id: info.channel_id.clone(),
            channel_name: info.channel_name.clone(),
            subscribers: info.subscribers,
            total_videos: info.total_videos,
            uploads_playlist_id: info.uploads_playlist_id.clone(),
        }],
        _ => Vec::new(),
    }
}

pub fn transform_videos(records: &[VideoRecord]) -> Vec<VideoRow> {
    records
        .iter()
        .map(|record| VideoRow {
            video_id: record.video_id.clone(),
            channel_id: record.channel_id.clone(),
            title: record.title.clone(),
            published_date: normalize_date(&record.published_date),
            views: record.views,
            likes: record.likes,
            comments_count: record.comments_count,
            duration_seconds: parse_duration(record.duration.as_deref()),
        })
        .collect()
}

pub fn transform_comments(records: &[CommentRecord]) -> Vec<CommentRow> {
    records
        .iter()
        .map(|record| CommentRow {
            comment_id: record.comment_id.clone(),
            video_id: record.video_id.clone(),
            author: record.author.clone(),
            comment_text: record.comment_text.clone(),
            published_date: normalize_date(&record.published_date),
        })
        .collect()
}
