//! The single consumer of the work queue.
//!
//! The dispatcher pops one job at a time and drives it as far as it can: generation (only while
//! the job holds no images), enhancement, delivery to the job's destination and, for broadcast
//! destinations, the secondary channels. A job that fails a recoverable step is pushed back to
//! the end of the queue with its state, so a redelivery never generates again.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{
        DeliveryError, Enhancer, GenerationError, GenerationRequest, Generator, Image,
        SocialChannel, Transport,
    },
    cache::ImageCache,
    caption::Caption,
    job::{ErrorType, Job, JobStatus, Output},
    queue::{JobReceiver, WorkQueue},
    retry::{Retry, RetryPolicy},
    review::review_controls,
    settings::{Audience, Settings, SharedSettings},
    Services,
};

#[derive(Debug)]
pub(crate) enum Outcome {
    Requeue { job: Job, delay: Option<Duration> },
    Done(Job),
    Dropped(Job),
}

pub(crate) struct Dispatcher {
    settings: SharedSettings,
    queue: WorkQueue,
    generator: Arc<Mutex<Box<dyn Generator>>>,
    enhancer: Option<Arc<dyn Enhancer>>,
    transport: Arc<dyn Transport>,
    channels: Vec<Arc<dyn SocialChannel>>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        settings: SharedSettings,
        queue: WorkQueue,
        services: &Services,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            settings,
            queue,
            generator: services.generator.clone(),
            enhancer: services.enhancer.clone(),
            transport: services.transport.clone(),
            channels: services.channels.clone(),
            retry,
        }
    }

    /// Processes jobs until cancelled. A job in flight is always finished first.
    pub fn spawn(
        self,
        mut receiver: JobReceiver,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the dispatcher");
                        break;
                    }
                    job = receiver.pop() => job,
                };
                let Some(job) = job else {
                    tracing::debug!("Work queue closed, stopping the dispatcher");
                    break;
                };
                let outcome = self.process(job).await;
                self.settle(outcome);
            }
        })
    }

    fn settle(&self, outcome: Outcome) {
        match outcome {
            Outcome::Requeue { job, delay: None } => self.queue.push(job),
            Outcome::Requeue {
                job,
                delay: Some(delay),
            } => {
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.push(job);
                });
            }
            Outcome::Done(job) => {
                tracing::info!(job_id = %job.id, "Job {} done", job.id);
            }
            Outcome::Dropped(job) => {
                tracing::warn!(
                    job_id = %job.id,
                    errors = job.errors.len(),
                    "Job {} dropped after {} attempts",
                    job.id,
                    job.attempt
                );
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, target = %job.target))]
    pub(crate) async fn process(&self, mut job: Job) -> Outcome {
        job.mark_attempted();

        if !job.output.is_generated() && !self.generate(&mut job).await {
            return self.retry(job).await;
        }

        let settings = self.settings.snapshot();
        let audience = settings.audience(&job.target);
        self.enhance(&mut job, &settings).await;

        if let Err(err) = self.deliver(&mut job, &settings, audience).await {
            job.record_error(ErrorType::Delivery, err.to_string());
            if audience == Audience::Admin {
                tracing::error!(?err, "Failed to deliver to admin chat, dropping job: {err}");
                return self.drop_job(job).await;
            }
            tracing::warn!(?err, "Failed to deliver images, will retry: {err}");
            job.status = JobStatus::RetryDelivery;
            return self.retry(job).await;
        }

        if audience == Audience::Broadcast {
            self.fan_out(&mut job, &settings).await;
        }

        self.clear_status_message(&job).await;
        job.mark_done();
        Outcome::Done(job)
    }

    /// Runs the generator and returns whether the job now holds images.
    async fn generate(&self, job: &mut Job) -> bool {
        if job.prompt.is_empty() {
            tracing::warn!("Generating with an empty prompt");
        }
        job.status = JobStatus::Generating;
        let request = GenerationRequest::from(&*job);
        let mut generator = self.generator.clone().lock_owned().await;
        tracing::debug!(
            seed = request.seed,
            scale = request.scale,
            steps = request.steps,
            count = request.count,
            "Generating {:?}",
            request.prompt
        );

        let result = tokio::task::spawn_blocking(move || {
            let result = generator.generate(&request);
            if matches!(result, Err(GenerationError::ResourceExhausted(_))) {
                generator.release_memory();
            }
            result
        })
        .await;

        match result {
            Ok(Ok(rendering)) if !rendering.images.is_empty() => {
                job.params.seed = rendering.seed;
                job.params.scale = rendering.scale;
                job.params.steps = rendering.steps;
                job.output = Output::Rendered(rendering.images);
                job.status = JobStatus::Generated;
                true
            }
            Ok(Ok(_)) => {
                let err = GenerationError::Other("no images returned".to_owned());
                self.generation_failed(job, err);
                false
            }
            Ok(Err(err)) => {
                self.generation_failed(job, err);
                false
            }
            Err(err) => {
                let message = panic_message(err);
                tracing::error!(%message, "Generator panicked: {message}");
                job.record_error(ErrorType::Panic, message);
                job.status = JobStatus::RetryGeneration;
                false
            }
        }
    }

    fn generation_failed(&self, job: &mut Job, err: GenerationError) {
        tracing::warn!(?err, "Failed to generate images, will retry: {err}");
        job.record_error(err.error_type(), err.to_string());
        match err {
            GenerationError::IndexOutOfRange(_) => {
                job.params.steps = job.params.steps.saturating_add(1);
            }
            GenerationError::ResourceExhausted(_) if job.params.count > 1 => {
                job.params.count -= 1;
            }
            _ => {}
        }
        job.status = JobStatus::RetryGeneration;
    }

    async fn enhance(&self, job: &mut Job, settings: &Settings) {
        if job.enhanced || !settings.upscaling {
            return;
        }
        let Some(enhancer) = self.enhancer.clone() else {
            return;
        };
        let Output::Rendered(images) = &mut job.output else {
            return;
        };

        let originals = images.clone();
        let face_restoring = settings.face_restoring;
        let enhanced = tokio::task::spawn_blocking(move || {
            originals
                .into_iter()
                .map(|image| enhance_image(&*enhancer, image, face_restoring))
                .collect::<Vec<_>>()
        })
        .await;

        match enhanced {
            Ok(enhanced) => *images = enhanced,
            Err(err) => {
                let message = panic_message(err);
                tracing::error!(%message, "Enhancer panicked, keeping original images: {message}");
            }
        }
        job.enhanced = true;
    }

    async fn deliver(
        &self,
        job: &mut Job,
        settings: &Settings,
        audience: Audience,
    ) -> Result<(), DeliveryError> {
        if job.delivery.delivered_to_primary() {
            return Ok(());
        }
        job.status = JobStatus::Delivering;

        let caption = Caption::from(&*job).primary();
        let controls = match audience {
            Audience::Admin | Audience::Turbo => review_controls(&self.channels, false),
            Audience::Broadcast => Vec::new(),
        };
        let images: &[Image] = match &job.output {
            Output::Rendered(images) => images,
            _ => {
                tracing::warn!("Nothing to deliver");
                &[]
            }
        };

        let message = self
            .transport
            .send_images(&job.target, images, &caption, &controls)
            .await?;
        job.delivery.primary = Some(message);
        job.status = JobStatus::Delivered;
        tracing::debug!(%message, "Delivered {} images", images.len());

        self.cache_output(job, settings).await;
        Ok(())
    }

    /// Moves delivered images into the image cache. On failure the images stay in memory.
    async fn cache_output(&self, job: &mut Job, settings: &Settings) {
        let (Some(message), Output::Rendered(images)) = (job.delivery.primary, &job.output) else {
            return;
        };
        let cache = ImageCache::new(&settings.image_cache_dir);
        match cache.store(message, images).await {
            Ok(paths) => job.output = Output::Cached(paths),
            Err(err) => {
                tracing::error!(?err, %message, "Failed to cache delivered images: {err}")
            }
        }
    }

    async fn fan_out(&self, job: &mut Job, settings: &Settings) {
        if job.output.cached_paths().is_empty() {
            self.cache_output(job, settings).await;
        }
        let caption = Caption::from(&*job).primary();
        let Some(image) = job.output.cached_paths().first().cloned() else {
            let pending = self
                .channels
                .iter()
                .filter(|channel| {
                    channel.is_available() && !job.delivery.delivered_to(channel.name())
                })
                .map(|channel| channel.name().to_owned())
                .collect::<Vec<_>>();
            if pending.is_empty() {
                return;
            }
            tracing::error!(channels = ?pending, "No cached image to post to secondary channels");
            job.record_error(
                ErrorType::Delivery,
                format!("no cached image for {}", pending.join(", ")),
            );
            for name in pending {
                job.delivery.secondary.insert(name, false);
            }
            return;
        };

        for channel in &self.channels {
            let name = channel.name();
            if job.delivery.delivered_to(name) || !channel.is_available() {
                continue;
            }
            let posted = match channel.post(&image, &channel.caption(&caption)).await {
                Ok(link) => {
                    tracing::info!(channel = name, %link, "Posted to {name}");
                    true
                }
                Err(err) => {
                    tracing::error!(?err, channel = name, "Failed to post to {name}: {err}");
                    job.record_error(ErrorType::Delivery, format!("{name}: {err}"));
                    false
                }
            };
            job.delivery.secondary.insert(name.to_owned(), posted);
        }
    }

    async fn retry(&self, job: Job) -> Outcome {
        match self.retry.decide(job.attempt) {
            Retry::Now => Outcome::Requeue { job, delay: None },
            Retry::After(delay) => Outcome::Requeue {
                job,
                delay: Some(delay),
            },
            Retry::GiveUp => {
                tracing::error!(
                    attempt = job.attempt,
                    "Job failed and will be discarded after {} attempts",
                    job.attempt
                );
                self.drop_job(job).await
            }
        }
    }

    async fn drop_job(&self, mut job: Job) -> Outcome {
        self.clear_status_message(&job).await;
        job.mark_dropped();
        Outcome::Dropped(job)
    }

    async fn clear_status_message(&self, job: &Job) {
        let Some(message) = job.status_message else {
            return;
        };
        let _ = self
            .transport
            .delete_message(&job.target, message)
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, %message, "Failed to delete status message, error: {err}")
            });
    }
}

fn enhance_image(enhancer: &dyn Enhancer, image: Image, face_restoring: bool) -> Image {
    let face = face_restoring
        && enhancer.detect_face(&image).unwrap_or_else(|err| {
            tracing::warn!(?err, "Face detection failed: {err}");
            false
        });
    match enhancer.upscale(&image, face) {
        Ok(upscaled) => upscaled,
        Err(err) => {
            tracing::error!(?err, "Failed to enhance image, keeping original: {err}");
            image
        }
    }
}

fn panic_message(err: JoinError) -> String {
    let msg = err.to_string();
    match err.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    }
}
