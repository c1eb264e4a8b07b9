//! Core domain model, error taxonomy and the pure change-detection / batching logic.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Operating state reported by upstream for a single attraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttractionStatus {
    Opened,
    #[serde(alias = "virtualQueue")]
    VirtualQueue,
    Maintenance,
    #[serde(alias = "closedIce")]
    ClosedIce,
    #[serde(alias = "closedWeather")]
    ClosedWeather,
    Closed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One wait-time observation. Field names follow the upstream payload so a cached
/// snapshot is exactly what was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaittimeRecord {
    pub code: String,
    pub name: String,
    #[serde(rename = "waitingtime", default, deserialize_with = "null_as_zero")]
    pub waiting_minutes: u32,
    #[serde(default)]
    pub status: AttractionStatus,
}

impl WaittimeRecord {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        waiting_minutes: u32,
        status: AttractionStatus,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            waiting_minutes,
            status,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AttractionStatus::Opened
    }
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or_default())
}

/// Detected wait-time movement for one attraction within a single reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub attraction_code: String,
    pub name: String,
    pub waiting_minutes: u32,
    pub increased: bool,
}

impl ChangeEvent {
    pub fn message(&self) -> String {
        format!(
            "Waittime for {} {} to {} minutes!",
            self.name,
            if self.increased { "increased" } else { "sank" },
            self.waiting_minutes
        )
    }
}

/// Flattened user -> notification method -> attraction -> park row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: i64,
    pub attraction_api_code: String,
    pub themepark_api_name: String,
    pub webhook_url: String,
    pub notification_provider_name: String,
}

/// A park that has at least one active attraction subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedPark {
    pub api_code: String,
}

/// Park row as known to the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Park {
    pub id: i64,
    pub api_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPark {
    pub api_code: String,
    pub name: String,
    pub country_code: String,
}

/// Attraction listing entry from the upstream catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownAttraction {
    pub code: String,
    pub park_api_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttraction {
    pub code: String,
    pub name: String,
    pub park_api_code: String,
}

/// Whether an error aborts only the park being processed or the whole invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Park,
    Invocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Upstream unavailable, non-2xx or timed out.
    Fetch,
    /// Cached snapshot exists but is not a valid record list.
    CacheParse,
    /// Snapshot store I/O failed.
    Cache,
    /// Webhook send failed.
    Delivery,
    /// Insert into the relational store failed.
    Storage,
    /// Listing parks/subscriptions at invocation start failed.
    Query,
    /// Cron descriptor could not be turned into a batch window.
    Schedule,
}

impl JobErrorKind {
    pub fn scope(self) -> ErrorScope {
        match self {
            Self::Fetch | Self::CacheParse | Self::Cache | Self::Delivery | Self::Storage => {
                ErrorScope::Park
            }
            Self::Query | Self::Schedule => ErrorScope::Invocation,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::CacheParse => "cache_parse",
            Self::Cache => "cache",
            Self::Delivery => "delivery",
            Self::Storage => "storage",
            Self::Query => "query",
            Self::Schedule => "schedule",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(
        kind: JobErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn scope(&self) -> ErrorScope {
        self.kind.scope()
    }

    /// Message plus the chain of wrapped causes, for log lines.
    pub fn detail(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

impl From<CronError> for JobError {
    fn from(err: CronError) -> Self {
        JobError::wrap(JobErrorKind::Schedule, "invalid cron descriptor", err)
    }
}

/// Compare a cached snapshot against a fresh one.
///
/// Only attractions that are `opened` in `current` are considered. A code missing from
/// `cached` has a baseline of 0, so the first sighting of a non-zero wait time is reported
/// as an increase while a first sighting at 0 is silent. Records only present in `cached`
/// are ignored. Output order follows `current`.
pub fn diff_waittimes(cached: &[WaittimeRecord], current: &[WaittimeRecord]) -> Vec<ChangeEvent> {
    let baseline: HashMap<&str, u32> = cached
        .iter()
        .map(|r| (r.code.as_str(), r.waiting_minutes))
        .collect();

    current
        .iter()
        .filter(|record| record.is_open())
        .filter_map(|record| {
            let old = baseline.get(record.code.as_str()).copied().unwrap_or(0);
            if record.waiting_minutes == old {
                return None;
            }
            Some(ChangeEvent {
                attraction_code: record.code.clone(),
                name: record.name.clone(),
                waiting_minutes: record.waiting_minutes,
                increased: record.waiting_minutes > old,
            })
        })
        .collect()
}

/// Pair every subscription of `park_api_code` with the change for its attraction, if any.
pub fn match_subscriptions<'a>(
    subscriptions: &'a [Subscription],
    changes: &'a [ChangeEvent],
    park_api_code: &str,
) -> Vec<(&'a Subscription, &'a ChangeEvent)> {
    if changes.is_empty() {
        return Vec::new();
    }

    let by_code: HashMap<&str, &ChangeEvent> = changes
        .iter()
        .map(|c| (c.attraction_code.as_str(), c))
        .collect();

    subscriptions
        .iter()
        .filter(|sub| sub.themepark_api_name == park_api_code)
        .filter_map(|sub| {
            by_code
                .get(sub.attraction_api_code.as_str())
                .map(|change| (sub, *change))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron descriptor `{expr}` has {found} fields, expected 5")]
    FieldCount { expr: String, found: usize },
    #[error("unsupported hour field `{field}`")]
    UnsupportedHourField { field: String },
    #[error("hour field `{field}` schedules no runs")]
    NoOccurrences { field: String },
}

/// Number of runs per day encoded in the hour field of a 5-field cron descriptor.
///
/// `a-b` counts `b-a+1`, a comma list counts its items (ranges inside a list count their
/// span), `*` counts 24 and a single hour counts 1.
pub fn occurrences_per_day(cron: &str) -> Result<u32, CronError> {
    let fields = cron.split_whitespace().collect::<Vec<_>>();
    if fields.len() != 5 {
        return Err(CronError::FieldCount {
            expr: cron.to_string(),
            found: fields.len(),
        });
    }

    let hour_field = fields[1];
    if hour_field == "*" {
        return Ok(24);
    }

    let mut total = 0u32;
    for item in hour_field.split(',') {
        total += count_hour_item(item, hour_field)?;
    }
    if total == 0 {
        return Err(CronError::NoOccurrences {
            field: hour_field.to_string(),
        });
    }
    Ok(total)
}

fn count_hour_item(item: &str, field: &str) -> Result<u32, CronError> {
    let unsupported = || CronError::UnsupportedHourField {
        field: field.to_string(),
    };
    let parse_hour = |s: &str| -> Result<u32, CronError> {
        s.trim()
            .parse::<u32>()
            .ok()
            .filter(|h| *h < 24)
            .ok_or_else(unsupported)
    };

    match item.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse_hour(start)?, parse_hour(end)?);
            if end < start {
                return Err(unsupported());
            }
            Ok(end - start + 1)
        }
        None => parse_hour(item).map(|_| 1),
    }
}

/// Slice of a worklist owned by one scheduled invocation.
///
/// Derived from wall-clock time only: the run in UTC hour `h` owns window `h - 1`, so the
/// first run of the day is expected at 01:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub window_index: usize,
    pub window_size: usize,
}

impl BatchWindow {
    /// `None` when the timestamp falls in hour 0, which owns no window.
    pub fn at(
        timestamp: DateTime<Utc>,
        occurrences_per_day: u32,
        worklist_len: usize,
    ) -> Option<Self> {
        let window_index = (timestamp.hour() as usize).checked_sub(1)?;
        let per_day = occurrences_per_day.max(1) as usize;
        Some(Self {
            window_index,
            window_size: worklist_len.div_ceil(per_day),
        })
    }

    pub fn for_invocation(
        timestamp: DateTime<Utc>,
        cron: &str,
        worklist_len: usize,
    ) -> Result<Option<Self>, CronError> {
        let per_day = occurrences_per_day(cron)?;
        Ok(Self::at(timestamp, per_day, worklist_len))
    }

    /// Index range into a worklist of `len` items; out-of-range windows are empty.
    pub fn range(&self, len: usize) -> Range<usize> {
        let start = self.window_index.saturating_mul(self.window_size).min(len);
        let end = (self.window_index + 1)
            .saturating_mul(self.window_size)
            .min(len);
        start..end
    }

    pub fn slice<'a, T>(&self, worklist: &'a [T]) -> &'a [T] {
        &worklist[self.range(worklist.len())]
    }
}

pub fn select_slice<T>(worklist: &[T], timestamp: DateTime<Utc>, occurrences_per_day: u32) -> &[T] {
    match BatchWindow::at(timestamp, occurrences_per_day, worklist.len()) {
        Some(window) => window.slice(worklist),
        None => &[],
    }
}
