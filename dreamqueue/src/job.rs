use std::{collections::BTreeMap, fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Image;

pub mod builder;
pub(crate) mod overrides;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// An opaque chat or channel handle understood by the [`crate::backend::Transport`].
#[derive(Debug, Eq, PartialEq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination(String);

impl Destination {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for Destination {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a message sent through the [`crate::backend::Transport`].
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct MessageId(i64);

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<MessageId> for i64 {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The resolved parameters a job is generated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub seed: u32,
    pub scale: f64,
    pub steps: u32,
    pub count: u32,
    pub size: Option<(u32, u32)>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            seed: 0,
            scale: 0.0,
            steps: 0,
            count: 1,
            size: None,
        }
    }
}

/// What a job currently holds of its generated images.
///
/// Pixels are owned by the job until they are persisted to the image cache, after which only
/// the paths are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Output {
    #[default]
    Empty,
    Rendered(Vec<Image>),
    Cached(Vec<PathBuf>),
}

impl Output {
    pub fn is_generated(&self) -> bool {
        !matches!(self, Self::Empty)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Rendered(images) => images.len(),
            Self::Cached(paths) => paths.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_paths(&self) -> &[PathBuf] {
        match self {
            Self::Cached(paths) => paths,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    /// The message id of the primary delivery, set once it succeeded.
    pub primary: Option<MessageId>,
    /// Per secondary channel outcome, keyed by channel name.
    pub secondary: BTreeMap<String, bool>,
}

impl DeliveryState {
    pub fn delivered_to_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn delivered_to(&self, channel: &str) -> bool {
        self.secondary.get(channel).copied().unwrap_or(false)
    }
}

// #[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub prompt: String,
    pub target: Destination,
    pub params: GenerationParams,
    pub output: Output,
    pub enhanced: bool,
    pub delivery: DeliveryState,
    pub status_message: Option<MessageId>,
    pub attempt: u16,
    pub errors: Vec<JobError>,
    pub inserted_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn record_error(&mut self, error_type: ErrorType, details: impl Into<String>) {
        self.errors.push(JobError {
            attempt: self.attempt,
            error_type,
            details: details.into(),
            recorded_at: Utc::now(),
        });
    }

    pub(crate) fn mark_attempted(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        self.attempted_at = Some(Utc::now());
    }

    pub(crate) fn mark_done(&mut self) {
        self.status = JobStatus::Done;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_dropped(&mut self) {
        self.status = JobStatus::Dropped;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Generating,
    Generated,
    RetryGeneration,
    Delivering,
    Delivered,
    RetryDelivery,
    Done,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub attempt: u16,
    pub error_type: ErrorType,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    IndexOutOfRange,
    ResourceExhausted,
    Generation,
    Panic,
    Delivery,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IndexOutOfRange => "index_out_of_range",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Generation => "generation",
            Self::Panic => "panic",
            Self::Delivery => "delivery",
        };
        f.write_str(name)
    }
}
