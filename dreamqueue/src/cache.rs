//! On-disk cache of delivered images, keyed by the message they were delivered in.
//!
//! The first image of a message is stored as `<message_id>.jpg`, further images of the same
//! batch as `<message_id>_<n>.jpg`. Review actions that modify an image keep the previous
//! version next to it with a `.bak` suffix.
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::fs;

use crate::{backend::Image, job::MessageId};

pub mod sweeper;

const EXTENSION: &str = "jpg";
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, message: MessageId, index: usize) -> PathBuf {
        let name = match index {
            0 => format!("{message}.{EXTENSION}"),
            n => format!("{message}_{n}.{EXTENSION}"),
        };
        self.dir.join(name)
    }

    fn backup_path(&self, message: MessageId) -> PathBuf {
        let mut path = self.path_for(message, 0).into_os_string();
        path.push(BACKUP_SUFFIX);
        path.into()
    }

    /// Writes the images of a delivered message, leaving already cached files untouched.
    pub async fn store(
        &self,
        message: MessageId,
        images: &[Image],
    ) -> Result<Vec<PathBuf>, CacheError> {
        fs::create_dir_all(&self.dir).await?;
        let mut paths = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let path = self.path_for(message, index);
            if !fs::try_exists(&path).await? {
                fs::write(&path, image.as_bytes()).await?;
            }
            paths.push(path);
        }
        Ok(paths)
    }

    pub async fn contains(&self, message: MessageId) -> Result<bool, CacheError> {
        Ok(fs::try_exists(self.path_for(message, 0)).await?)
    }

    pub async fn read(&self, message: MessageId) -> Result<Image, CacheError> {
        match fs::read(self.path_for(message, 0)).await {
            Ok(bytes) => Ok(Image::new(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::Missing(message))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Moves the cached image aside as a backup and stores `image` in its place.
    pub async fn replace_keeping_backup(
        &self,
        message: MessageId,
        image: &Image,
    ) -> Result<PathBuf, CacheError> {
        let path = self.path_for(message, 0);
        if !fs::try_exists(&path).await? {
            return Err(CacheError::Missing(message));
        }
        fs::rename(&path, self.backup_path(message)).await?;
        fs::write(&path, image.as_bytes()).await?;
        Ok(path)
    }

    /// Puts the backup made by [`ImageCache::replace_keeping_backup`] back in place.
    pub async fn restore_backup(&self, message: MessageId) -> Result<Image, CacheError> {
        let backup = self.backup_path(message);
        if !fs::try_exists(&backup).await? {
            return Err(CacheError::Missing(message));
        }
        fs::rename(&backup, self.path_for(message, 0)).await?;
        self.read(message).await
    }

    /// Deletes every file last modified more than `max_age` ago and returns how many were
    /// removed. A missing cache directory is not an error.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize, CacheError> {
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(0);
        };
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || metadata.modified()? >= cutoff {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(
                    ?err,
                    path = %entry.path().display(),
                    "Failed to remove cached image: {err}"
                ),
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No cached image for message {0}")]
    Missing(MessageId),
    #[error("Image cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn message(id: i64) -> MessageId {
        MessageId::from(id)
    }

    #[tokio::test]
    async fn stores_batches_under_message_id() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("cache"));
        let images = [Image::new(b"a".to_vec()), Image::new(b"b".to_vec())];

        let paths = cache.store(message(7), &images).await.unwrap();

        assert_eq!(
            paths,
            vec![
                dir.path().join("cache").join("7.jpg"),
                dir.path().join("cache").join("7_1.jpg")
            ]
        );
        assert!(cache.contains(message(7)).await.unwrap());
        assert_eq!(cache.read(message(7)).await.unwrap().as_bytes(), b"a");
    }

    #[tokio::test]
    async fn store_keeps_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        cache.store(message(1), &[Image::new(b"first".to_vec())]).await.unwrap();

        cache.store(message(1), &[Image::new(b"second".to_vec())]).await.unwrap();

        assert_eq!(cache.read(message(1)).await.unwrap().as_bytes(), b"first");
    }

    #[tokio::test]
    async fn read_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());

        assert_matches!(cache.read(message(3)).await, Err(CacheError::Missing(id)) if id == message(3));
        assert!(!cache.contains(message(3)).await.unwrap());
    }

    #[tokio::test]
    async fn replace_and_restore_backup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        cache.store(message(5), &[Image::new(b"original".to_vec())]).await.unwrap();

        cache
            .replace_keeping_backup(message(5), &Image::new(b"fixed".to_vec()))
            .await
            .unwrap();
        assert_eq!(cache.read(message(5)).await.unwrap().as_bytes(), b"fixed");
        assert!(dir.path().join("5.jpg.bak").exists());

        let restored = cache.restore_backup(message(5)).await.unwrap();
        assert_eq!(restored.as_bytes(), b"original");
        assert!(!dir.path().join("5.jpg.bak").exists());
    }

    #[tokio::test]
    async fn restore_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        cache.store(message(5), &[Image::new(b"original".to_vec())]).await.unwrap();

        assert_matches!(cache.restore_backup(message(5)).await, Err(CacheError::Missing(_)));
        assert_eq!(cache.read(message(5)).await.unwrap().as_bytes(), b"original");
    }

    #[tokio::test]
    async fn sweep_removes_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        cache.store(message(1), &[Image::new(b"old".to_vec())]).await.unwrap();
        cache.store(message(2), &[Image::new(b"new".to_vec())]).await.unwrap();
        let two_days_ago = SystemTime::now() - Duration::from_secs(2 * 86_400);
        std::fs::File::options()
            .write(true)
            .open(cache.path_for(message(1), 0))
            .unwrap()
            .set_modified(two_days_ago)
            .unwrap();

        let removed = cache.sweep(Duration::from_secs(86_400)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!cache.contains(message(1)).await.unwrap());
        assert!(cache.contains(message(2)).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("missing"));

        assert_eq!(cache.sweep(Duration::from_secs(1)).await.unwrap(), 0);
    }
}
