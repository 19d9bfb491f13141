//! Administrative commands.
//!
//! The transport adapter hands every text message from a chat to [`CommandHandler::handle`].
//! Only admin chats are served; plain text is a prompt, everything starting with `/` a command.
use std::{path::Path, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{DeliveryError, PromptSource, Transport},
    job::{
        builder::{JobBuilder, EXPANSION_MARKER},
        overrides, Destination, Job,
    },
    queue::WorkQueue,
    settings::{SettingsError, SharedSettings},
    Services,
};

static BATCH_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"batch=(\d+)").unwrap());

const MAX_BATCH: u32 = 50;
const WORD_LIST_EXTENSION: &str = "txt";

pub const HELP: &str = "Just type the text prompt for image generation\n\n\
Use the + symbol at the end of the query to expand it with random data, for example:\ncat+";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    ShowConfig,
    SetConfig { name: String, value: String },
    Reset,
    Random,
    Die,
    Generate(String),
    Invalid(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let Some(command) = text.strip_prefix('/') else {
            return Self::Generate(text.to_owned());
        };
        let mut words = command.split_whitespace();
        let name = words
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_lowercase();

        match name.as_str() {
            "start" | "help" => Self::Help,
            "reset" => Self::Reset,
            "random" => Self::Random,
            "die" => Self::Die,
            "config" => match (words.next(), words.collect::<Vec<_>>()) {
                (None, _) => Self::ShowConfig,
                (Some(name), value) if !value.is_empty() => Self::SetConfig {
                    name: name.to_lowercase(),
                    value: value.join(" "),
                },
                (Some(_), _) => Self::Invalid("Usage: /config <parameter> <value>".to_owned()),
            },
            _ => Self::Invalid(format!("Unknown command /{name}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Chat {0} is not an admin chat")]
    NotAllowed(Destination),
    #[error("Failed to reply: {0}")]
    Reply(#[from] DeliveryError),
}

/// Serves the admin commands of every admin chat.
#[derive(Clone)]
pub struct CommandHandler {
    settings: SharedSettings,
    queue: WorkQueue,
    prompts: Arc<dyn PromptSource>,
    transport: Arc<dyn Transport>,
    cancellation_token: CancellationToken,
}

impl CommandHandler {
    pub fn new(
        settings: SharedSettings,
        queue: WorkQueue,
        services: &Services,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            settings,
            queue,
            prompts: services.prompts.clone(),
            transport: services.transport.clone(),
            cancellation_token,
        }
    }

    #[instrument(skip(self, text), fields(%chat))]
    pub async fn handle(&self, chat: &Destination, text: &str) -> Result<(), CommandError> {
        self.ensure_admin(chat)?;
        match Command::parse(text) {
            Command::Help => self.reply(chat, HELP).await,
            Command::ShowConfig => {
                let reply = self
                    .settings
                    .to_json()
                    .unwrap_or_else(|err| format!("Failed to read settings: {err}"));
                self.reply(chat, &reply).await
            }
            Command::SetConfig { name, value } => self.set_config(chat, &name, &value).await,
            Command::Reset => {
                let reply = match self.settings.reset() {
                    Ok(()) => "Config reset".to_owned(),
                    Err(err) => {
                        tracing::error!(?err, "Failed to reload settings with error {err}");
                        format!("Failed to reset config: {err}")
                    }
                };
                self.reply(chat, &reply).await
            }
            Command::Random => self.random(chat).await,
            Command::Die => {
                let reply = self.reply(chat, "Bye!").await;
                tracing::info!("Shutdown requested by admin");
                self.cancellation_token.cancel();
                reply
            }
            Command::Generate(text) => self.generate(chat, &text).await,
            Command::Invalid(reply) => self.reply(chat, &reply).await,
        }
    }

    /// Overwrites an existing word list in the word list directory with an uploaded file.
    #[instrument(skip(self, contents), fields(%chat))]
    pub async fn update_word_list(
        &self,
        chat: &Destination,
        file_name: &str,
        contents: &[u8],
    ) -> Result<(), CommandError> {
        self.ensure_admin(chat)?;
        let is_word_list = Path::new(file_name)
            .file_name()
            .is_some_and(|name| name == file_name)
            && Path::new(file_name)
                .extension()
                .is_some_and(|extension| extension == WORD_LIST_EXTENSION);
        let path = self.settings.snapshot().word_list_dir.join(file_name);

        let exists = is_word_list && tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !exists {
            return self.reply(chat, &format!("File {file_name} not found!")).await;
        }
        match tokio::fs::write(&path, contents).await {
            Ok(()) => self.reply(chat, &format!("File {file_name} updated")).await,
            Err(err) => {
                tracing::error!(?err, "Failed to write word list {file_name}: {err}");
                self.reply(chat, &format!("Failed to update {file_name}")).await
            }
        }
    }

    fn ensure_admin(&self, chat: &Destination) -> Result<(), CommandError> {
        if self.settings.snapshot().is_admin(chat) {
            Ok(())
        } else {
            tracing::debug!("Ignoring message from non admin chat");
            Err(CommandError::NotAllowed(chat.clone()))
        }
    }

    async fn reply(&self, chat: &Destination, text: &str) -> Result<(), CommandError> {
        self.transport.send_notice(chat, text).await?;
        Ok(())
    }

    async fn set_config(
        &self,
        chat: &Destination,
        name: &str,
        value: &str,
    ) -> Result<(), CommandError> {
        let reply = match self.settings.set(name, value) {
            Ok(Value::String(stored)) => format!("Parameter {name} changed to {stored}"),
            Ok(stored) => format!("Parameter {name} changed to {stored}"),
            Err(SettingsError::UnknownParameter(_)) => format!("Parameter {name} not found"),
            Err(err) => {
                tracing::warn!(?err, "Failed to change parameter {name}: {err}");
                format!("Invalid value {value} for parameter {name}")
            }
        };
        self.reply(chat, &reply).await
    }

    async fn random(&self, chat: &Destination) -> Result<(), CommandError> {
        let settings = self.settings.snapshot();
        let prompts = self.prompts.clone();
        let target = chat.clone();
        let job = tokio::task::spawn_blocking(move || {
            let prompt = prompts
                .generate("", 1.0)
                .filter(|prompt| !prompt.trim().is_empty())?;
            Some(
                JobBuilder::new(prompt, target)
                    .with_settings(&settings)
                    .with_random_prompt_probability(1.0)
                    .build(&*prompts),
            )
        })
        .await;

        match job {
            Ok(Some(job)) => {
                let notice = format!(
                    "Put random prompt `{}` in queue: {}",
                    job.prompt,
                    self.queue.size() + 1
                );
                self.push_with_notice(job, &notice).await;
                Ok(())
            }
            Ok(None) => self.reply(chat, "Prompt generation failed").await,
            Err(err) => {
                tracing::error!(?err, "Prompt generation panicked");
                self.reply(chat, "Prompt generation failed").await
            }
        }
    }

    async fn generate(&self, chat: &Destination, text: &str) -> Result<(), CommandError> {
        let (text, batch) = extract_batch(text);
        if text.is_empty() {
            return self.reply(chat, "Please provide a prompt").await;
        }

        let (stripped, _) = overrides::extract(&text);
        let expands = stripped.is_empty() || stripped.ends_with(EXPANSION_MARKER);

        let settings = self.settings.snapshot();
        for index in 0..batch {
            let prompts = self.prompts.clone();
            let builder = JobBuilder::new(text.clone(), chat.clone()).with_settings(&settings);
            let mut job = match tokio::task::spawn_blocking(move || builder.build(&*prompts)).await
            {
                Ok(job) => job,
                Err(err) => {
                    tracing::error!(?err, "Failed to build job");
                    return self.reply(chat, "Failed to queue prompt").await;
                }
            };
            job.params.seed = job.params.seed.wrapping_add(index).max(1);

            if expands || index + 1 == batch {
                let notice = format!(
                    "Put prompt `{}` in queue: {}",
                    job.prompt,
                    self.queue.size() + 1
                );
                self.push_with_notice(job, &notice).await;
            } else {
                self.queue.push(job);
            }
        }
        Ok(())
    }

    /// Sends the status notice, attaches it to the job and only then queues the job.
    async fn push_with_notice(&self, mut job: Job, notice: &str) {
        match self.transport.send_notice(&job.target, notice).await {
            Ok(message) => job.status_message = Some(message),
            Err(err) => {
                tracing::warn!(?err, job_id = %job.id, "Failed to send status notice: {err}")
            }
        }
        tracing::info!(job_id = %job.id, "Queued prompt {:?}", job.prompt);
        self.queue.push(job);
    }
}

/// Removes every `batch=N` token and returns the remaining text with the batch size of the first.
fn extract_batch(text: &str) -> (String, u32) {
    let batch = BATCH_TOKEN
        .captures(text)
        .and_then(|captures| captures[1].parse::<u32>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_BATCH);
    let remaining = BATCH_TOKEN.replace_all(text, "");
    (remaining.trim().to_owned(), batch)
}
