//! Process wide settings and the shared handle through which they are read and updated.
//!
//! Settings are loaded from the environment, after reading an optional `.env` file. Every
//! component takes a [`SharedSettings`] at construction and reads a fresh [`Settings`] snapshot
//! whenever it needs one, so administrative updates apply on the next iteration without a
//! restart.
use std::{
    ops::RangeInclusive,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::job::Destination;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stop the periodic producers; only admin commands create jobs.
    pub command_only_mode: bool,
    /// Do not run the periodic producer for the primary channel.
    pub premoderation: bool,
    pub upscaling: bool,
    pub face_restoring: bool,
    pub image_cache_dir: PathBuf,
    /// Age in seconds after which cached images are swept.
    pub cache_max_age: u64,
    pub random_prompt_probability: f64,
    pub resolution: Option<(u32, u32)>,
    /// Seconds between two jobs of the primary producer.
    pub sleep_time: f64,
    /// Seconds between two jobs of the turbo producer.
    pub turbo_sleep_time: f64,
    pub min_steps: u32,
    pub max_steps: u32,
    pub admin_ids: Vec<i64>,
    pub primary_chat: Option<Destination>,
    pub turbo_chat: Option<Destination>,
    /// Directory holding the word lists used by the prompt source.
    pub word_list_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            command_only_mode: false,
            premoderation: false,
            upscaling: true,
            face_restoring: false,
            image_cache_dir: PathBuf::from("imagecache"),
            cache_max_age: 86_400,
            random_prompt_probability: 0.5,
            resolution: Some((512, 512)),
            sleep_time: 600.0,
            turbo_sleep_time: 60.0,
            min_steps: 20,
            max_steps: 100,
            admin_ids: Vec::new(),
            primary_chat: None,
            turbo_chat: None,
            word_list_dir: PathBuf::from("."),
        }
    }
}

/// How a destination is treated by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// An administrator's chat: reviewable, never fanned out, never redelivered.
    Admin,
    /// The fast lane chat: reviewable, never fanned out.
    Turbo,
    /// A production channel: fanned out to the secondary channels.
    Broadcast,
}

impl Settings {
    /// Loads settings from the process environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self, SettingsError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(?err, "Failed to read .env file: {err}");
            }
        }
        Self::from_vars(std::env::vars())
    }

    /// Builds settings from `(name, value)` pairs using the environment variable names.
    pub fn from_vars(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        for (name, value) in vars {
            let invalid = || SettingsError::InvalidValue {
                name: name.clone(),
                value: value.clone(),
            };
            match name.as_str() {
                "COMMAND_ONLY_MODE" => settings.command_only_mode = is_truthy(&value),
                "PREMODERATION" => settings.premoderation = is_truthy(&value),
                "UPSCALING" => settings.upscaling = is_truthy(&value),
                "FACE_RESTORING" => settings.face_restoring = is_truthy(&value),
                "IMAGE_CACHE_DIR" => settings.image_cache_dir = PathBuf::from(&value),
                "CACHE_MAX_AGE" => settings.cache_max_age = value.parse().map_err(|_| invalid())?,
                "RANDOM_PROMPT_PROBABILITY" => {
                    settings.random_prompt_probability = value.parse().map_err(|_| invalid())?
                }
                "RESOLUTION" => {
                    settings.resolution = Some(parse_resolution(&value).ok_or_else(invalid)?)
                }
                "SLEEP_TIME" => settings.sleep_time = value.parse().map_err(|_| invalid())?,
                "TURBO_SLEEP_TIME" => {
                    settings.turbo_sleep_time = value.parse().map_err(|_| invalid())?
                }
                "MIN_STEPS" => settings.min_steps = value.parse().map_err(|_| invalid())?,
                "MAX_STEPS" => settings.max_steps = value.parse().map_err(|_| invalid())?,
                "TELEGRAM_ADMIN_ID" => {
                    settings.admin_ids = value
                        .split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::parse)
                        .collect::<Result<_, _>>()
                        .map_err(|_| invalid())?
                }
                "TELEGRAM_CHAT_ID" => settings.primary_chat = non_empty(&value).map(Into::into),
                "TELEGRAM_TURBO_CHAT_ID" => settings.turbo_chat = non_empty(&value).map(Into::into),
                "WORD_LIST_DIR" => settings.word_list_dir = PathBuf::from(&value),
                _ => {}
            }
        }
        Ok(settings)
    }

    pub fn is_admin(&self, chat: &Destination) -> bool {
        chat.as_str()
            .parse::<i64>()
            .is_ok_and(|id| self.is_admin_user(id))
    }

    pub fn is_admin_user(&self, user: i64) -> bool {
        self.admin_ids.contains(&user)
    }

    pub fn audience(&self, target: &Destination) -> Audience {
        if self.is_admin(target) {
            Audience::Admin
        } else if self.turbo_chat.as_ref() == Some(target) {
            Audience::Turbo
        } else {
            Audience::Broadcast
        }
    }

    pub fn steps_range(&self) -> RangeInclusive<u32> {
        self.min_steps..=self.max_steps
    }

    pub fn sleep_interval(&self) -> Duration {
        seconds(self.sleep_time)
    }

    pub fn turbo_interval(&self) -> Duration {
        seconds(self.turbo_sleep_time)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .unwrap_or(MIN_INTERVAL)
        .max(MIN_INTERVAL)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "on" | "yes" | "1"
    )
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.trim().to_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().parse().ok(), h.trim().parse().ok())
    })?;
    Some((width?, height?))
}

type Source = dyn Fn() -> Result<Settings, SettingsError> + Send + Sync;

/// A thread safe handle to the current [`Settings`].
///
/// Updates build a complete new [`Settings`] and swap it in, so a reader always observes either
/// the old or the new snapshot.
#[derive(Clone)]
pub struct SharedSettings {
    current: Arc<RwLock<Arc<Settings>>>,
    source: Arc<Source>,
}

impl std::fmt::Debug for SharedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSettings")
            .field("current", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl SharedSettings {
    /// A handle whose [`SharedSettings::reset`] restores `settings`.
    pub fn new(settings: Settings) -> Self {
        let initial = settings.clone();
        Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            source: Arc::new(move || Ok(initial.clone())),
        }
    }

    /// A handle loaded from the environment, which is re-read on [`SharedSettings::reset`].
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::with_source(Settings::from_env)
    }

    pub fn with_source(
        source: impl Fn() -> Result<Settings, SettingsError> + Send + Sync + 'static,
    ) -> Result<Self, SettingsError> {
        let settings = source()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            source: Arc::new(source),
        })
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, update: impl FnOnce(&mut Settings)) {
        let mut settings = Settings::clone(&self.snapshot());
        update(&mut settings);
        self.replace(settings);
    }

    /// Sets a single parameter by name from its textual representation.
    ///
    /// The value is interpreted according to the type of the current value: booleans accept
    /// `true`, `on`, `yes` and `1`; lists are comma separated. An unset optional parameter is
    /// taken as text, or as a list when text does not fit. Returns the stored value.
    pub fn set(&self, name: &str, value: &str) -> Result<Value, SettingsError> {
        let name = name.to_lowercase();
        let document = serde_json::to_value(&*self.snapshot())?;
        let current = document
            .as_object()
            .ok_or(SettingsError::BadState)?
            .get(&name)
            .ok_or_else(|| SettingsError::UnknownParameter(name.clone()))?;
        let candidates = match current {
            Value::Null => vec![
                Some(Value::String(value.trim().to_owned())),
                coerce(&Value::Array(Vec::new()), value),
            ],
            current => vec![coerce(current, value)],
        };

        for candidate in candidates.into_iter().flatten() {
            let mut document = document.clone();
            if let Some(slot) = document.get_mut(&name) {
                *slot = candidate.clone();
            }
            if let Ok(settings) = serde_json::from_value::<Settings>(document) {
                self.replace(settings);
                return Ok(candidate);
            }
        }
        Err(SettingsError::InvalidValue {
            name,
            value: value.to_owned(),
        })
    }

    /// Reloads the settings from their source.
    pub fn reset(&self) -> Result<(), SettingsError> {
        let settings = (self.source)()?;
        self.replace(settings);
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(&*self.snapshot())?)
    }

    fn replace(&self, settings: Settings) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }
}

fn coerce(current: &Value, raw: &str) -> Option<Value> {
    let raw = raw.trim();
    match current {
        Value::Bool(_) => Some(Value::Bool(is_truthy(raw))),
        Value::Number(number) if number.is_f64() => parse_number(raw),
        Value::Number(_) => raw.parse::<i64>().ok().map(Value::from),
        Value::String(_) => Some(Value::String(raw.to_owned())),
        Value::Array(_) => Some(Value::Array(
            raw.split(|c| c == ',' || c == 'x')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| parse_number(item).unwrap_or_else(|| Value::String(item.to_owned())))
                .collect(),
        )),
        Value::Null | Value::Object(_) => None,
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(integer) = raw.parse::<i64>() {
        return Some(Value::from(integer));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
    #[error("Unknown parameter {0}")]
    UnknownParameter(String),
    #[error("Error encoding or decoding settings")]
    EncodeError(#[from] serde_json::Error),
    #[error("Settings in bad state")]
    BadState,
}
