//! Recovery log of permanently missed instances
//!
//! One instance id per line, append only. A reconcile pass rotates the log
//! aside, retries what it holds, and deletes the rotated copy when done. A
//! rotated copy left behind by an interrupted pass is picked up again
//! instead of being overwritten.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::InstanceId;

/// Append-only file of instance ids
#[derive(Debug)]
pub struct MissedLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MissedLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the copy held by a reconcile pass
    pub fn rotated_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("missed");
        let file_name = match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{stem}.temp.{ext}"),
            None => format!("{stem}.temp"),
        };
        self.path.with_file_name(file_name)
    }

    /// Append one id
    pub async fn append(&self, instance_id: InstanceId) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{instance_id}\n").as_bytes()).await?;
        file.flush().await
    }

    /// Move the log aside and return its distinct ids in ascending order
    ///
    /// A fresh empty log takes its place, so appends during the pass are
    /// kept for the next one.
    pub async fn rotate(&self) -> io::Result<Vec<InstanceId>> {
        let rotated = self.rotated_path();

        {
            let _guard = self.write_lock.lock().await;
            if !fs::try_exists(&rotated).await? {
                if fs::try_exists(&self.path).await? {
                    fs::rename(&self.path, &rotated).await?;
                } else {
                    fs::write(&rotated, b"").await?;
                }
                fs::write(&self.path, b"").await?;
            } else {
                tracing::info!(path = %rotated.display(), "Resuming interrupted reconcile pass");
            }
        }

        let contents = fs::read_to_string(&rotated).await?;
        Ok(parse_ids(&contents))
    }

    /// Delete the rotated copy once a pass has finished
    pub async fn discard_rotated(&self) -> io::Result<()> {
        match fs::remove_file(self.rotated_path()).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn parse_ids(contents: &str) -> Vec<InstanceId> {
    let mut ids = BTreeSet::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.parse::<InstanceId>() {
            Ok(id) => {
                ids.insert(id);
            }
            Err(e) => tracing::warn!(line = line, error = %e, "Skipping unparsable missed log line"),
        }
    }
    ids.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_creates_directory() {
        let dir = TempDir::new().unwrap();
        let log = MissedLog::new(dir.path().join("logs").join("missed.log"));

        log.append(12_000_000_001).await.unwrap();
        log.append(12_000_000_002).await.unwrap();

        let contents = fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(contents, "12000000001\n12000000002\n");
    }

    #[tokio::test]
    async fn test_rotate_dedups_and_sorts() {
        let dir = TempDir::new().unwrap();
        let log = MissedLog::new(dir.path().join("missed.log"));
        for id in [30, 10, 20, 10, 30] {
            log.append(id).await.unwrap();
        }

        let ids = log.rotate().await.unwrap();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(log.rotated_path(), dir.path().join("missed.temp.log"));

        let fresh = fs::read_to_string(log.path()).await.unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_rotate_resumes_interrupted_pass() {
        let dir = TempDir::new().unwrap();
        let log = MissedLog::new(dir.path().join("missed.log"));
        log.append(1).await.unwrap();
        assert_eq!(log.rotate().await.unwrap(), vec![1]);

        log.append(2).await.unwrap();
        assert_eq!(log.rotate().await.unwrap(), vec![1]);

        log.discard_rotated().await.unwrap();
        assert_eq!(log.rotate().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_rotate_without_log() {
        let dir = TempDir::new().unwrap();
        let log = MissedLog::new(dir.path().join("missed.log"));
        assert!(log.rotate().await.unwrap().is_empty());
        log.discard_rotated().await.unwrap();
        log.discard_rotated().await.unwrap();
    }

    #[test]
    fn test_parse_skips_garbage() {
        assert_eq!(parse_ids("5\nabc\n\n3\n5\n"), vec![3, 5]);
    }
}
