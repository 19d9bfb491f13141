use std::{
    ops::RangeInclusive,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use rand::Rng;

use crate::{backend::PromptSource, settings::Settings};

use super::{
    overrides, DeliveryState, Destination, GenerationParams, Job, JobStatus, MessageId, Output,
};

/// Marks a prompt that should be expanded by the [`PromptSource`].
pub const EXPANSION_MARKER: char = '+';

const DEFAULT_STEPS_RANGE: RangeInclusive<u32> = 20..=100;
const SCALE_RANGE: RangeInclusive<f64> = 7.0..=10.0;
/// Largest number of images rendered by one generation call.
pub const MAX_COUNT: u32 = 16;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Builds a fully resolved [`Job`] from raw prompt text.
///
/// Any parameter not set on the builder, and not given inline in the prompt text, is drawn at
/// random when calling [`JobBuilder::build`].
#[derive(Debug, Clone)]
pub struct JobBuilder {
    prompt: String,
    target: Destination,
    params: GenerationParams,
    steps_range: RangeInclusive<u32>,
    random_prompt_probability: f64,
    status_message: Option<MessageId>,
}

impl JobBuilder {
    pub fn new(prompt: impl Into<String>, target: impl Into<Destination>) -> Self {
        Self {
            prompt: prompt.into(),
            target: target.into(),
            params: GenerationParams::default(),
            steps_range: DEFAULT_STEPS_RANGE,
            random_prompt_probability: 0.5,
            status_message: None,
        }
    }

    /// Picks up the steps range, image size and random prompt probability from the settings.
    pub fn with_settings(self, settings: &Settings) -> Self {
        Self {
            steps_range: settings.steps_range(),
            random_prompt_probability: settings.random_prompt_probability,
            params: GenerationParams {
                size: settings.resolution,
                ..self.params
            },
            ..self
        }
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.params.seed = seed;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.params.scale = scale;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.params.steps = steps;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.params.count = count;
        self
    }

    pub fn with_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.params.size = size;
        self
    }

    pub fn with_steps_range(self, steps_range: RangeInclusive<u32>) -> Self {
        Self {
            steps_range,
            ..self
        }
    }

    pub fn with_random_prompt_probability(self, random_prompt_probability: f64) -> Self {
        Self {
            random_prompt_probability,
            ..self
        }
    }

    pub fn with_status_message(self, status_message: MessageId) -> Self {
        Self {
            status_message: Some(status_message),
            ..self
        }
    }

    /// Normalises the prompt, expands it through `prompts` when empty or ending with
    /// [`EXPANSION_MARKER`], and resolves every generation parameter.
    pub fn build(self, prompts: &dyn PromptSource) -> Job {
        let (mut prompt, overrides) = overrides::extract(&self.prompt);

        if prompt.is_empty() || prompt.ends_with(EXPANSION_MARKER) {
            let seed_text = overrides::normalise(prompt.trim_end_matches(EXPANSION_MARKER));
            prompt = prompts
                .generate(&seed_text, self.random_prompt_probability)
                .map(|generated| overrides::normalise(&generated))
                .unwrap_or_default();
            if prompt.is_empty() {
                tracing::warn!(
                    target = %self.target,
                    "Prompt source returned no prompt for seed text {seed_text:?}"
                );
            }
        }

        let mut rng = rand::thread_rng();
        let preset = self.params;
        let params = GenerationParams {
            seed: overrides
                .seed
                .filter(|seed| *seed != 0)
                .or((preset.seed != 0).then_some(preset.seed))
                .unwrap_or_else(|| rng.gen_range(1..=u32::MAX)),
            scale: overrides
                .scale
                .filter(|scale| *scale > 0.0)
                .or((preset.scale > 0.0).then_some(preset.scale))
                .unwrap_or_else(|| round_to_tenth(rng.gen_range(SCALE_RANGE))),
            steps: overrides
                .steps
                .filter(|steps| *steps != 0)
                .or((preset.steps != 0).then_some(preset.steps))
                .unwrap_or_else(|| {
                    if self.steps_range.is_empty() {
                        *self.steps_range.start()
                    } else {
                        rng.gen_range(self.steps_range.clone())
                    }
                }),
            count: overrides.count.unwrap_or(preset.count).clamp(1, MAX_COUNT),
            size: preset.size,
        };

        Job {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed).into(),
            status: JobStatus::Queued,
            prompt,
            target: self.target,
            params,
            output: Output::Empty,
            enhanced: false,
            delivery: DeliveryState::default(),
            status_message: self.status_message,
            attempt: 0,
            errors: Vec::new(),
            inserted_at: Utc::now(),
            attempted_at: None,
            completed_at: None,
        }
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
