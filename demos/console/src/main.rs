use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::TimeDelta;
use dreamqueue::prelude::*;
use rand::seq::SliceRandom;
use tokio::io::{AsyncBufReadExt, BufReader};

const ADMIN: i64 = 1;
const GALLERY: &str = "@gallery";

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let settings = SharedSettings::with_source(|| {
        let mut settings = Settings::from_env()?;
        if settings.admin_ids.is_empty() {
            settings.admin_ids.push(ADMIN);
        }
        if settings.primary_chat.is_none() {
            settings.primary_chat = Some(GALLERY.into());
        }
        Ok(settings)
    })?;
    let prompts = Arc::new(WordSalad);
    let services = Services::new(
        Box::new(FlakyGenerator::default()),
        prompts.clone(),
        Arc::new(ConsoleTransport::default()),
    );
    let retry = RetryPolicy::default()
        .with_max_attempts(5)
        .with_backoff(BackoffStrategy::constant(TimeDelta::seconds(1)));
    let schedule = ProducerSchedule::from_settings(&settings.snapshot());

    let dreamqueue = Dreamqueue::new(settings, services)
        .with_dispatcher(retry)?
        .with_producers(schedule)
        .with_cache_sweeper(CacheSweepConfig::hourly()?);

    let snapshot = dreamqueue.settings().snapshot();
    let bootstrap = std::env::args().nth(1);
    if let (Some(prompt), Some(primary)) = (bootstrap, snapshot.primary_chat.clone()) {
        let job = JobBuilder::new(prompt, primary)
            .with_settings(&snapshot)
            .build(&*prompts);
        println!("Inserted job {}", job.id);
        dreamqueue.queue().push(job);
    }

    let commands = dreamqueue.commands();
    let admin = Destination::from(snapshot.admin_ids.first().copied().unwrap_or(ADMIN));
    println!("Type a prompt or a command (/help, /random, /config, /die)");
    let token = dreamqueue.cancellation_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(err) = commands.handle(&admin, &line).await {
                        tracing::error!(?err, "Command failed: {err}");
                    }
                }
                None => break,
            },
        }
    }

    dreamqueue.graceful_shutdown().await?;
    Ok(())
}

/// Fails every third call with an out of memory error to show the retry loop.
#[derive(Default)]
struct FlakyGenerator {
    calls: u32,
}

impl Generator for FlakyGenerator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Rendering, GenerationError> {
        self.calls += 1;
        std::thread::sleep(std::time::Duration::from_millis(500));
        if self.calls % 3 == 0 {
            return Err(GenerationError::ResourceExhausted("out of memory".to_owned()));
        }
        Ok(Rendering {
            images: (0..request.count)
                .map(|_| Image::new(request.prompt.as_bytes()))
                .collect(),
            seed: request.seed,
            scale: request.scale,
            steps: request.steps,
        })
    }

    fn release_memory(&mut self) {
        println!("[generator] releasing memory");
    }
}

struct WordSalad;

impl PromptSource for WordSalad {
    fn generate(&self, seed_text: &str, _random_probability: f64) -> Option<String> {
        const WORDS: &[&str] = &["misty", "neon", "harbour", "owl", "cathedral", "desert"];
        let mut rng = rand::thread_rng();
        let words = WORDS
            .choose_multiple(&mut rng, 3)
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        Some(format!("{seed_text} {words}, digital art").trim().to_owned())
    }
}

#[derive(Default)]
struct ConsoleTransport {
    next_message: AtomicI64,
}

impl ConsoleTransport {
    fn next(&self) -> MessageId {
        MessageId::from(self.next_message.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send_images(
        &self,
        target: &Destination,
        images: &[Image],
        caption: &str,
        controls: &[ReviewAction],
    ) -> Result<MessageId, DeliveryError> {
        let message = self.next();
        println!(
            "[{target}] #{message}: {} image(s) {caption:?} {controls:?}",
            images.len()
        );
        Ok(message)
    }

    async fn send_notice(
        &self,
        target: &Destination,
        text: &str,
    ) -> Result<MessageId, DeliveryError> {
        let message = self.next();
        println!("[{target}] #{message}: {text}");
        Ok(message)
    }

    async fn delete_message(
        &self,
        target: &Destination,
        message: MessageId,
    ) -> Result<(), DeliveryError> {
        println!("[{target}] deleted #{message}");
        Ok(())
    }

    async fn copy_message(
        &self,
        to: &Destination,
        from: &Destination,
        message: MessageId,
    ) -> Result<MessageId, DeliveryError> {
        println!("[{to}] copy of {from} #{message}");
        Ok(self.next())
    }

    async fn fetch_image(
        &self,
        _chat: &Destination,
        _message: MessageId,
    ) -> Result<Image, DeliveryError> {
        Err(DeliveryError::Rejected("no remote images in the console".to_owned()))
    }

    async fn replace_image(
        &self,
        chat: &Destination,
        message: MessageId,
        _image: &Image,
        caption: &str,
        controls: &[ReviewAction],
    ) -> Result<(), DeliveryError> {
        println!("[{chat}] replaced #{message}: {caption:?} {controls:?}");
        Ok(())
    }

    async fn clear_controls(
        &self,
        chat: &Destination,
        message: MessageId,
    ) -> Result<(), DeliveryError> {
        println!("[{chat}] cleared controls of #{message}");
        Ok(())
    }
}
