//! The external collaborators of the queue.
//!
//! Generation, prompt synthesis and enhancement are blocking calls and are always invoked from
//! the blocking thread pool. The [`Transport`] and [`SocialChannel`] adapters are async.
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    caption,
    job::{Destination, ErrorType, Job, MessageId},
    review::ReviewAction,
};

/// An encoded image, as produced by the [`Generator`].
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    bytes: Vec<u8>,
}

impl Image {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub seed: u32,
    pub scale: f64,
    pub steps: u32,
    pub count: u32,
    pub size: Option<(u32, u32)>,
}

impl From<&Job> for GenerationRequest {
    fn from(job: &Job) -> Self {
        Self {
            prompt: job.prompt.clone(),
            seed: job.params.seed,
            scale: job.params.scale,
            steps: job.params.steps,
            count: job.params.count,
            size: job.params.size,
        }
    }
}

/// The images produced by a generation call together with the parameters actually used.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendering {
    pub images: Vec<Image>,
    pub seed: u32,
    pub scale: f64,
    pub steps: u32,
}

/// The diffusion backend.
///
/// Implementations are not expected to be re-entrant: the dispatcher guarantees that at most
/// one call to [`Generator::generate`] is in flight at any time.
#[cfg_attr(test, mockall::automock)]
pub trait Generator: Send {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Rendering, GenerationError>;

    /// Frees any cached device memory after a [`GenerationError::ResourceExhausted`].
    fn release_memory(&mut self) {}
}

/// The text model producing prompts.
#[cfg_attr(test, mockall::automock)]
pub trait PromptSource: Send + Sync {
    /// Generates a prompt continuing `seed_text`. With probability `random_probability` an empty
    /// seed text yields a fully random prompt instead of one seeded from the word list.
    ///
    /// Returns [`None`] when no usable prompt could be produced.
    fn generate(&self, seed_text: &str, random_probability: f64) -> Option<String>;
}

/// Image post-processing: upscaling and face restoration.
#[cfg_attr(test, mockall::automock)]
pub trait Enhancer: Send + Sync {
    fn detect_face(&self, image: &Image) -> Result<bool, EnhanceError>;
    fn upscale(&self, image: &Image, face_restore: bool) -> Result<Image, EnhanceError>;
    fn fix_face(&self, image: &Image) -> Result<Image, EnhanceError>;
}

/// The chat transport used for the primary channel, admin chats and status notices.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the images with a caption and, for reviewable deliveries, the review controls.
    async fn send_images(
        &self,
        target: &Destination,
        images: &[Image],
        caption: &str,
        controls: &[ReviewAction],
    ) -> Result<MessageId, DeliveryError>;

    /// Sends a silent text notice.
    async fn send_notice(&self, target: &Destination, text: &str)
        -> Result<MessageId, DeliveryError>;

    async fn delete_message(
        &self,
        target: &Destination,
        message: MessageId,
    ) -> Result<(), DeliveryError>;

    async fn copy_message(
        &self,
        to: &Destination,
        from: &Destination,
        message: MessageId,
    ) -> Result<MessageId, DeliveryError>;

    /// Downloads the (largest) image attached to a message.
    async fn fetch_image(
        &self,
        chat: &Destination,
        message: MessageId,
    ) -> Result<Image, DeliveryError>;

    async fn replace_image(
        &self,
        chat: &Destination,
        message: MessageId,
        image: &Image,
        caption: &str,
        controls: &[ReviewAction],
    ) -> Result<(), DeliveryError>;

    async fn clear_controls(
        &self,
        chat: &Destination,
        message: MessageId,
    ) -> Result<(), DeliveryError>;
}

/// A secondary distribution channel, e.g. a social network account.
#[async_trait]
pub trait SocialChannel: Send + Sync {
    /// Stable lower case name, also used in review callbacks (`post_to_<name>`).
    fn name(&self) -> &str;

    /// Whether the channel is currently logged in and able to post.
    fn is_available(&self) -> bool {
        true
    }

    /// Adapts a primary caption text to the channel.
    fn caption(&self, primary: &str) -> String {
        caption::social(primary)
    }

    /// Posts the cached image, returning a link to the post.
    async fn post(&self, image: &Path, caption: &str) -> Result<String, DeliveryError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The requested step count hit an internal indexing problem in the scheduler.
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),
    /// The device ran out of memory.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("generation failed: {0}")]
    Other(String),
}

impl GenerationError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::IndexOutOfRange(_) => ErrorType::IndexOutOfRange,
            Self::ResourceExhausted(_) => ErrorType::ResourceExhausted,
            Self::Other(_) => ErrorType::Generation,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("channel unavailable")]
    Unavailable,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("enhancement failed: {0}")]
pub struct EnhanceError(pub String);
