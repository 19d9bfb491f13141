//! A job queue and generation-retry loop for an image generation bot.
//!
//! Producers push [`job::Job`]s on a shared [`queue::WorkQueue`]; a single dispatcher takes them
//! one at a time, generates images, enhances them, delivers them and requeues jobs whose
//! generation or delivery failed. [`Dreamqueue`] wires the pieces together:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dreamqueue::prelude::*;
//! # async fn run(
//! #     generator: Box<dyn Generator>,
//! #     prompts: Arc<dyn PromptSource>,
//! #     transport: Arc<dyn Transport>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let settings = SharedSettings::from_env()?;
//! let services = Services::new(generator, prompts, transport);
//! let schedule = ProducerSchedule::from_settings(&settings.snapshot());
//!
//! let dreamqueue = Dreamqueue::new(settings, services)
//!     .with_dispatcher(RetryPolicy::default())?
//!     .with_producers(schedule)
//!     .with_cache_sweeper(CacheSweepConfig::hourly()?);
//!
//! dreamqueue.cancellation_token().cancelled().await;
//! dreamqueue.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

pub mod backend;
pub mod backoff;
pub mod cache;
pub mod caption;
pub mod commands;
mod dispatcher;
pub mod job;
pub mod prelude;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod review;
pub mod settings;
#[doc(hidden)]
pub mod testing;

use backend::{Enhancer, Generator, PromptSource, SocialChannel, Transport};
use cache::sweeper::{CacheSweepConfig, CacheSweeper};
use commands::CommandHandler;
use dispatcher::Dispatcher;
use producer::{ProducerRunner, ProducerSchedule};
use queue::{JobReceiver, WorkQueue};
use retry::RetryPolicy;
use review::ReviewDesk;
use settings::SharedSettings;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// The external collaborators the queue drives.
#[derive(Clone)]
pub struct Services {
    pub(crate) generator: Arc<Mutex<Box<dyn Generator>>>,
    pub(crate) prompts: Arc<dyn PromptSource>,
    pub(crate) enhancer: Option<Arc<dyn Enhancer>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) channels: Vec<Arc<dyn SocialChannel>>,
}

impl Services {
    pub fn new(
        generator: Box<dyn Generator>,
        prompts: Arc<dyn PromptSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            generator: Arc::new(Mutex::new(generator)),
            prompts,
            enhancer: None,
            transport,
            channels: Vec::new(),
        }
    }

    pub fn with_enhancer(self, enhancer: Arc<dyn Enhancer>) -> Self {
        Self {
            enhancer: Some(enhancer),
            ..self
        }
    }

    /// Adds a secondary channel. Channels are posted to in the order they were added.
    pub fn with_channel(mut self, channel: Arc<dyn SocialChannel>) -> Self {
        self.channels.push(channel);
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("enhancer", &self.enhancer.is_some())
            .field(
                "channels",
                &self
                    .channels
                    .iter()
                    .map(|channel| channel.name())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Dreamqueue {
    settings: SharedSettings,
    queue: WorkQueue,
    receiver: Option<JobReceiver>,
    services: Services,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Dreamqueue {
    pub fn new(settings: SharedSettings, services: Services) -> Self {
        let (queue, receiver) = queue::channel();
        Self {
            settings,
            queue,
            receiver: Some(receiver),
            services,
            cancellation_token: Default::default(),
            handles: Default::default(),
        }
    }

    /// A handle for pushing jobs from outside the queue, e.g. a transport adapter.
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// The token cancelled on shutdown, including a `/die` command.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Starts the dispatcher. There is exactly one dispatcher per queue.
    pub fn with_dispatcher(mut self, retry: RetryPolicy) -> Result<Self, DreamqueueError> {
        let receiver = self
            .receiver
            .take()
            .ok_or(DreamqueueError::DispatcherAlreadyRunning)?;
        let dispatcher = Dispatcher::new(
            self.settings.clone(),
            self.queue.clone(),
            &self.services,
            retry,
        );
        self.handles
            .push(dispatcher.spawn(receiver, self.cancellation_token.clone()));
        Ok(self)
    }

    pub fn with_producers(mut self, schedule: ProducerSchedule) -> Self {
        if schedule.is_empty() {
            tracing::debug!("No producers scheduled");
            return self;
        }
        let runner = ProducerRunner::new(
            schedule,
            self.settings.clone(),
            self.queue.clone(),
            &self.services,
        );
        self.handles
            .push(runner.spawn(self.cancellation_token.clone()));
        self
    }

    pub fn with_cache_sweeper(mut self, config: CacheSweepConfig) -> Self {
        let sweeper = CacheSweeper::new(self.settings.clone(), config);
        self.handles
            .push(sweeper.spawn(self.cancellation_token.clone()));
        self
    }

    pub fn commands(&self) -> CommandHandler {
        CommandHandler::new(
            self.settings.clone(),
            self.queue.clone(),
            &self.services,
            self.cancellation_token.clone(),
        )
    }

    pub fn review_desk(&self) -> ReviewDesk {
        ReviewDesk::new(
            self.settings.clone(),
            self.services.transport.clone(),
            self.services.enhancer.clone(),
            self.services.channels.clone(),
        )
    }

    /// Stops every background task, waiting for a job in flight to finish.
    pub async fn graceful_shutdown(self) -> Result<(), DreamqueueError> {
        tracing::debug!("Shutting down Dreamqueue tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| {
                result.map_err(|err| {
                    tracing::error!(?err, "Background task failed: {err}");
                    DreamqueueError::GracefulShutdownFailed
                })
            })
    }
}

#[derive(Debug, Error)]
pub enum DreamqueueError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("The dispatcher is already running")]
    DispatcherAlreadyRunning,
    #[error("Error loading settings")]
    Settings(#[from] settings::SettingsError),
}
