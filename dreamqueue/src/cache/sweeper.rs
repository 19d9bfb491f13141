//! Periodic clean up of the image cache.
//!
//! Cached images are only needed while an admin may still act on a delivered message, so old
//! files are removed on a [`cron::Schedule`]. The cache directory and the maximum age are read
//! from the [`SharedSettings`] on every run unless the age is fixed with
//! [`CacheSweepConfig::with_max_age`].
//!
//! # Example
//!
//! ```
//! # use dreamqueue::prelude::*;
//! # use std::{str::FromStr, time::Duration};
//! let config = CacheSweepConfig::new(cron::Schedule::from_str("0 */30 * * * *").unwrap())
//!     .with_max_age(Duration::from_secs(6 * 3600));
//! ```
use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::settings::SharedSettings;

use super::ImageCache;

const HOURLY: &str = "0 0 * * * *";

#[derive(Debug, Clone)]
pub struct CacheSweepConfig {
    schedule: cron::Schedule,
    max_age: Option<Duration>,
}

impl CacheSweepConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_age: None,
        }
    }

    /// Sweeps at the start of every hour.
    pub fn hourly() -> Result<Self, cron::error::Error> {
        Ok(Self::new(cron::Schedule::from_str(HOURLY)?))
    }

    /// Uses a fixed maximum age instead of `cache_max_age` from the settings.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

pub(crate) struct CacheSweeper {
    config: CacheSweepConfig,
    settings: SharedSettings,
}

impl CacheSweeper {
    pub fn new(settings: SharedSettings, config: CacheSweepConfig) -> Self {
        Self { config, settings }
    }

    /// Sweeps once per scheduled slot. Slots missed while a sweep was running are skipped.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut after = Utc::now();
            loop {
                let Some(next) = self.config.next_after(&after) else {
                    tracing::warn!("No future scheduled time for the cache sweeper");
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.sweep().await;
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the cache sweeper");
                        break;
                    },
                }
                after = next.max(Utc::now());
            }
        })
    }

    pub async fn sweep(&self) -> usize {
        let settings = self.settings.snapshot();
        let cache = ImageCache::new(&settings.image_cache_dir);
        let max_age = self
            .config
            .max_age
            .unwrap_or(Duration::from_secs(settings.cache_max_age));

        match cache.sweep(max_age).await {
            Ok(removed) => {
                tracing::debug!(removed, "Swept {removed} cached images");
                removed
            }
            Err(err) => {
                tracing::error!(?err, "Failed to sweep the image cache with error {err}");
                0
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::SystemTime;

    use crate::{backend::Image, job::MessageId, settings::Settings};

    use super::*;

    fn settings(dir: &std::path::Path, max_age: u64) -> SharedSettings {
        SharedSettings::new(Settings {
            image_cache_dir: dir.to_path_buf(),
            cache_max_age: max_age,
            ..Settings::default()
        })
    }

    fn age(cache: &ImageCache, message: i64, seconds: u64) {
        let path = cache.path_for(MessageId::from(message), 0);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(seconds))
            .unwrap();
    }

    #[test]
    fn hourly_schedule_parses() {
        let config = CacheSweepConfig::hourly().unwrap();
        let next = config.schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.timestamp() % 3600, 0);
    }

    #[test]
    fn next_slot_is_strictly_after_the_previous_one() {
        let config = CacheSweepConfig::hourly().unwrap();
        let slot = config.next_after(&Utc::now()).unwrap();

        assert_eq!(
            config.next_after(&slot).unwrap(),
            slot + chrono::TimeDelta::hours(1)
        );
    }

    #[tokio::test]
    async fn sweep_uses_settings_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        for message in [1, 2] {
            cache
                .store(MessageId::from(message), &[Image::new(vec![message as u8])])
                .await
                .unwrap();
        }
        age(&cache, 1, 7200);
        let sweeper = CacheSweeper::new(
            settings(dir.path(), 3600),
            CacheSweepConfig::hourly().unwrap(),
        );

        assert_eq!(sweeper.sweep().await, 1);
        assert!(cache.contains(MessageId::from(2)).await.unwrap());
    }

    #[tokio::test]
    async fn configured_max_age_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        cache
            .store(MessageId::from(1), &[Image::new(vec![1])])
            .await
            .unwrap();
        age(&cache, 1, 120);
        let sweeper = CacheSweeper::new(
            settings(dir.path(), 86_400),
            CacheSweepConfig::hourly()
                .unwrap()
                .with_max_age(Duration::from_secs(60)),
        );

        assert_eq!(sweeper.sweep().await, 1);
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let handle = CacheSweeper::new(
            settings(dir.path(), 60),
            CacheSweepConfig::hourly().unwrap(),
        )
        .spawn(token.clone());

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
