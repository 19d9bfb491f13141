//! The purpose of this module is to alleviate the need to import many of the `[dreamqueue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use dreamqueue::prelude::*;
//! ```
pub use crate::backend::{
    DeliveryError, EnhanceError, Enhancer, GenerationError, GenerationRequest, Generator, Image,
    PromptSource, Rendering, SocialChannel, Transport,
};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::cache::sweeper::CacheSweepConfig;
pub use crate::cache::ImageCache;
pub use crate::commands::{Command, CommandHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Destination, Job, JobStatus, MessageId};
pub use crate::producer::{Cadence, ProducerSchedule};
pub use crate::queue::WorkQueue;
pub use crate::retry::RetryPolicy;
pub use crate::review::{ReviewAction, ReviewDesk};
pub use crate::settings::{Settings, SharedSettings};
pub use crate::{Dreamqueue, DreamqueueError, Services};
