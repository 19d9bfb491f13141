//! Periodic producers feeding synthesized prompts into the queue.
//!
//! Every configured destination gets a producer with a [`Cadence`]. All producers are driven by a
//! single scheduler task; the interval of a producer is read from the current settings each time
//! it is rescheduled, so changing `sleep_time` or `turbo_sleep_time` applies from the next run.
//! The first run of every producer happens as soon as the scheduler starts.
use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::PromptSource,
    job::{builder::JobBuilder, Destination, Job},
    queue::WorkQueue,
    settings::{Settings, SharedSettings},
    Services,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Every `sleep_time` seconds.
    Primary,
    /// Every `turbo_sleep_time` seconds.
    Turbo,
}

impl Cadence {
    fn interval(self, settings: &Settings) -> Duration {
        match self {
            Self::Primary => settings.sleep_interval(),
            Self::Turbo => settings.turbo_interval(),
        }
    }
}

#[derive(Debug, Clone)]
struct Producer {
    destination: Destination,
    cadence: Cadence,
    skip_when_pending: bool,
    next_run: Option<Instant>,
}

/// The set of periodic producers to run.
#[derive(Debug, Clone, Default)]
pub struct ProducerSchedule {
    producers: Vec<Producer>,
}

impl ProducerSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The primary channel producer, unless premoderation is on, and the turbo chat producer
    /// when a turbo chat is configured. Both skip a run while a job for their destination is
    /// still waiting.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut schedule = Self::new();
        if let Some(primary) = settings.primary_chat.clone() {
            if !settings.premoderation {
                schedule = schedule.with_deduplicated_producer(primary, Cadence::Primary);
            }
        }
        if let Some(turbo) = settings.turbo_chat.clone() {
            schedule = schedule.with_deduplicated_producer(turbo, Cadence::Turbo);
        }
        schedule
    }

    pub fn with_producer(mut self, destination: impl Into<Destination>, cadence: Cadence) -> Self {
        self.producers.push(Producer {
            destination: destination.into(),
            cadence,
            skip_when_pending: false,
            next_run: None,
        });
        self
    }

    /// Adds a producer that does nothing while the queue holds a job for `destination`.
    pub fn with_deduplicated_producer(
        mut self,
        destination: impl Into<Destination>,
        cadence: Cadence,
    ) -> Self {
        self.producers.push(Producer {
            destination: destination.into(),
            cadence,
            skip_when_pending: true,
            next_run: None,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn destinations(&self) -> impl Iterator<Item = (&Destination, Cadence)> {
        self.producers
            .iter()
            .map(|producer| (&producer.destination, producer.cadence))
    }
}

struct Feed {
    settings: SharedSettings,
    queue: WorkQueue,
    prompts: Arc<dyn PromptSource>,
}

impl Feed {
    async fn tick(&self, producer: &Producer, settings: Arc<Settings>) -> Option<Job> {
        let destination = &producer.destination;
        if settings.command_only_mode {
            tracing::trace!(%destination, "Command only mode, skipping producer run");
            return None;
        }
        if producer.skip_when_pending && self.queue.pending_for(destination) > 0 {
            tracing::debug!(%destination, "Job already waiting, skipping producer run");
            return None;
        }

        let prompts = self.prompts.clone();
        let target = destination.clone();
        let job = tokio::task::spawn_blocking(move || {
            let prompt = prompts
                .generate("", settings.random_prompt_probability)
                .filter(|prompt| !prompt.trim().is_empty())?;
            Some(
                JobBuilder::new(prompt, target)
                    .with_settings(&settings)
                    .build(&*prompts),
            )
        })
        .await;

        match job {
            Ok(Some(job)) => {
                tracing::info!(job_id = %job.id, %destination, "Queued prompt {:?}", job.prompt);
                self.queue.push(job.clone());
                Some(job)
            }
            Ok(None) => {
                tracing::warn!(%destination, "Prompt generation failed");
                None
            }
            Err(err) => {
                tracing::error!(?err, %destination, "Prompt generation panicked");
                None
            }
        }
    }
}

pub(crate) struct ProducerRunner {
    producers: Vec<Producer>,
    feed: Feed,
}

impl ProducerRunner {
    pub fn new(
        schedule: ProducerSchedule,
        settings: SharedSettings,
        queue: WorkQueue,
        services: &Services,
    ) -> Self {
        Self {
            producers: schedule.producers,
            feed: Feed {
                settings,
                queue,
                prompts: services.prompts.clone(),
            },
        }
    }

    pub fn spawn(mut self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.run_due(Instant::now()).await;
                let Some(next) = self.next_run() else {
                    tracing::debug!("No producers configured");
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep_until(next) => {}
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the producers");
                        break;
                    }
                }
            }
        })
    }

    /// Runs every producer that is due at `now` and reschedules it. Returns the number of jobs
    /// queued.
    pub(crate) async fn run_due(&mut self, now: Instant) -> usize {
        let mut queued = 0;
        for producer in &mut self.producers {
            if producer.next_run.is_some_and(|next_run| next_run > now) {
                continue;
            }
            let settings = self.feed.settings.snapshot();
            if self.feed.tick(producer, settings.clone()).await.is_some() {
                queued += 1;
            }
            producer.next_run = Some(now + producer.cadence.interval(&settings));
        }
        queued
    }

    fn next_run(&self) -> Option<Instant> {
        self.producers
            .iter()
            .filter_map(|producer| producer.next_run)
            .min()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::{
        backend::MockPromptSource,
        job::builder::JobBuilder,
        queue::{self, JobReceiver},
        testing::{assert_enqueued, RecordingTransport, ScriptedGenerator},
    };

    use super::*;

    fn settings() -> Settings {
        Settings {
            sleep_time: 600.0,
            turbo_sleep_time: 60.0,
            min_steps: 30,
            max_steps: 40,
            resolution: Some((768, 512)),
            ..Settings::default()
        }
    }

    fn runner(
        schedule: ProducerSchedule,
        settings: SharedSettings,
        prompts: MockPromptSource,
    ) -> (ProducerRunner, WorkQueue, JobReceiver) {
        let (queue, receiver) = queue::channel();
        let services = Services::new(
            Box::new(ScriptedGenerator::new()),
            Arc::new(prompts),
            Arc::new(RecordingTransport::new()),
        );
        (
            ProducerRunner::new(schedule, settings, queue.clone(), &services),
            queue,
            receiver,
        )
    }

    fn counting_prompts(calls: Arc<AtomicUsize>) -> MockPromptSource {
        let mut prompts = MockPromptSource::new();
        prompts
            .expect_generate()
            .withf(|seed_text, probability| seed_text.is_empty() && *probability == 0.5)
            .returning(move |_, _| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Some(format!("a castle  number {n}"))
            });
        prompts
    }

    #[test]
    fn schedule_from_settings() {
        let mut settings = settings();
        assert!(ProducerSchedule::from_settings(&settings).is_empty());

        settings.primary_chat = Some(Destination::from("channel"));
        settings.turbo_chat = Some(Destination::from("turbo"));
        let schedule = ProducerSchedule::from_settings(&settings);
        assert_eq!(
            schedule.destinations().collect::<Vec<_>>(),
            vec![
                (&Destination::from("channel"), Cadence::Primary),
                (&Destination::from("turbo"), Cadence::Turbo),
            ]
        );

        settings.premoderation = true;
        let schedule = ProducerSchedule::from_settings(&settings);
        assert_eq!(
            schedule.destinations().collect::<Vec<_>>(),
            vec![(&Destination::from("turbo"), Cadence::Turbo)]
        );
    }

    #[tokio::test]
    async fn queues_job_with_configured_parameters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (mut runner, _queue, mut receiver) = runner(
            ProducerSchedule::new().with_producer("channel", Cadence::Primary),
            SharedSettings::new(settings()),
            counting_prompts(calls.clone()),
        );

        assert_eq!(runner.run_due(Instant::now()).await, 1);

        let jobs = receiver.drain();
        assert_enqueued!(1 job, in: jobs, with_prompt: "a castle number 0", for_target: "channel");
        assert!((30..=40).contains(&jobs[0].params.steps));
        assert_eq!(jobs[0].params.size, Some((768, 512)));
    }

    #[tokio::test]
    async fn follows_each_cadence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (mut runner, _queue, mut receiver) = runner(
            ProducerSchedule::new()
                .with_producer("channel", Cadence::Primary)
                .with_producer("turbo", Cadence::Turbo),
            SharedSettings::new(settings()),
            counting_prompts(calls.clone()),
        );
        let start = Instant::now();

        assert_eq!(runner.run_due(start).await, 2);
        assert_eq!(runner.next_run(), Some(start + Duration::from_secs(60)));
        assert_eq!(runner.run_due(start + Duration::from_secs(30)).await, 0);
        assert_eq!(runner.run_due(start + Duration::from_secs(60)).await, 1);
        assert_eq!(runner.run_due(start + Duration::from_secs(600)).await, 2);

        let jobs = receiver.drain();
        assert_enqueued!(2 jobs, in: jobs, for_target: "channel");
        assert_enqueued!(3 jobs, in: jobs, for_target: "turbo");
    }

    #[tokio::test]
    async fn interval_changes_apply_on_reschedule() {
        let settings = SharedSettings::new(settings());
        let (mut runner, _queue, _receiver) = runner(
            ProducerSchedule::new().with_producer("turbo", Cadence::Turbo),
            settings.clone(),
            counting_prompts(Arc::new(AtomicUsize::new(0))),
        );
        let start = Instant::now();

        runner.run_due(start).await;
        settings.set("turbo_sleep_time", "5").unwrap();
        runner.run_due(start + Duration::from_secs(60)).await;

        assert_eq!(runner.next_run(), Some(start + Duration::from_secs(65)));
    }

    #[tokio::test]
    async fn command_only_mode_skips_prompt_generation() {
        let mut prompts = MockPromptSource::new();
        prompts.expect_generate().never();
        let settings = SharedSettings::new(Settings {
            command_only_mode: true,
            ..settings()
        });
        let (mut runner, queue, _receiver) = runner(
            ProducerSchedule::new().with_producer("channel", Cadence::Primary),
            settings,
            prompts,
        );

        assert_eq!(runner.run_due(Instant::now()).await, 0);
        assert!(queue.is_empty());
        assert!(runner.next_run().is_some());
    }

    #[tokio::test]
    async fn deduplicated_producer_waits_for_pending_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (mut runner, queue, mut receiver) = runner(
            ProducerSchedule::new().with_deduplicated_producer("channel", Cadence::Primary),
            SharedSettings::new(settings()),
            counting_prompts(calls.clone()),
        );
        queue.push(JobBuilder::new("waiting", "channel").build(&MockPromptSource::new()));
        let start = Instant::now();

        assert_eq!(runner.run_due(start).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        receiver.drain();
        assert_eq!(runner.run_due(start + Duration::from_secs(600)).await, 1);
    }

    #[tokio::test]
    async fn failed_prompt_generation_queues_nothing() {
        let mut prompts = MockPromptSource::new();
        prompts.expect_generate().times(2).returning(|_, _| None);
        let (mut runner, queue, _receiver) = runner(
            ProducerSchedule::new().with_producer("channel", Cadence::Primary),
            SharedSettings::new(settings()),
            prompts,
        );
        let start = Instant::now();

        assert_eq!(runner.run_due(start).await, 0);
        assert_eq!(runner.run_due(start + Duration::from_secs(600)).await, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let (runner, _queue, _receiver) = runner(
            ProducerSchedule::new().with_producer("channel", Cadence::Primary),
            SharedSettings::new(Settings {
                command_only_mode: true,
                ..settings()
            }),
            MockPromptSource::new(),
        );
        let token = CancellationToken::new();
        let handle = runner.spawn(token.clone());

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
