use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::capability::{Backup, BackupRef, CapabilityError};
use crate::platform::{NativePlatform, Platform};

/// Archives the subject directory into a gzip tarball and restores by
/// replacing the directory contents with the archive.
#[derive(Debug, Clone)]
pub struct SnapshotBackup {
    root: PathBuf,
    keep: usize,
}

impl SnapshotBackup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep: 5,
        }
    }

    /// Number of snapshots retained per subject.
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }
}

fn snapshot_prefix(subject: &str) -> String {
    let name: String = subject
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() {
        "root".to_string()
    } else {
        name
    }
}

fn write_snapshot(root: &Path, subject: &Path, keep: usize) -> Result<PathBuf, CapabilityError> {
    if !subject.is_dir() {
        return Err(CapabilityError::Backup(format!(
            "{} is not a directory",
            subject.display()
        )));
    }
    std::fs::create_dir_all(root)?;
    NativePlatform::restrict_dir_permissions(root);

    let prefix = snapshot_prefix(&subject.to_string_lossy());
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%6f");
    let path = root.join(format!("{}-{}.tar.gz", prefix, stamp));

    let file = File::create(&path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", subject)?;
    builder.into_inner()?.finish()?;
    NativePlatform::restrict_file_permissions(&path);

    prune(root, &prefix, keep);
    Ok(path)
}

fn prune(root: &Path, prefix: &str, keep: usize) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    let mut snapshots: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&format!("{}-", prefix)) && n.ends_with(".tar.gz"))
        })
        .collect();
    snapshots.sort();
    let excess = snapshots.len().saturating_sub(keep);
    for old in snapshots.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&old) {
            warn!("Failed to prune snapshot {}: {}", old.display(), e);
        }
    }
}

fn restore_snapshot(subject: &Path, archive: &Path) -> Result<(), CapabilityError> {
    if !archive.is_file() {
        return Err(CapabilityError::Restore(format!(
            "snapshot {} is missing",
            archive.display()
        )));
    }
    std::fs::create_dir_all(subject)?;
    for entry in std::fs::read_dir(subject)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    let decoder = GzDecoder::new(File::open(archive)?);
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(subject)?;
    Ok(())
}

#[async_trait]
impl Backup for SnapshotBackup {
    async fn backup(&self, subject: &str) -> Result<BackupRef, CapabilityError> {
        let root = self.root.clone();
        let subject = PathBuf::from(subject);
        let keep = self.keep;
        let path = tokio::task::spawn_blocking(move || write_snapshot(&root, &subject, keep))
            .await
            .map_err(|e| CapabilityError::Backup(e.to_string()))?
            .map_err(|e| match e {
                CapabilityError::Io(io) => CapabilityError::Backup(io.to_string()),
                other => other,
            })?;
        debug!("Snapshot written to {}", path.display());
        Ok(BackupRef(path.to_string_lossy().into_owned()))
    }

    async fn restore(&self, subject: &str, backup: &BackupRef) -> Result<(), CapabilityError> {
        let subject = PathBuf::from(subject);
        let archive = PathBuf::from(&backup.0);
        tokio::task::spawn_blocking(move || restore_snapshot(&subject, &archive))
            .await
            .map_err(|e| CapabilityError::Restore(e.to_string()))?
            .map_err(|e| match e {
                CapabilityError::Io(io) => CapabilityError::Restore(io.to_string()),
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restore_brings_back_the_snapshot() {
        let subject = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        std::fs::write(subject.path().join("Cargo.lock"), "serde 1.0.0").unwrap();
        std::fs::create_dir(subject.path().join("src")).unwrap();
        std::fs::write(subject.path().join("src/main.rs"), "fn main() {}").unwrap();

        let backup = SnapshotBackup::new(store.path());
        let subject_str = subject.path().to_str().unwrap();
        let snapshot = backup.backup(subject_str).await.unwrap();

        std::fs::write(subject.path().join("Cargo.lock"), "serde 2.0.0").unwrap();
        std::fs::write(subject.path().join("stray.tmp"), "junk").unwrap();
        std::fs::remove_dir_all(subject.path().join("src")).unwrap();

        backup.restore(subject_str, &snapshot).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(subject.path().join("Cargo.lock")).unwrap(),
            "serde 1.0.0"
        );
        assert_eq!(
            std::fs::read_to_string(subject.path().join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert!(!subject.path().join("stray.tmp").exists());
    }

    #[tokio::test]
    async fn backup_of_missing_subject_fails() {
        let store = tempfile::tempdir().unwrap();
        let err = SnapshotBackup::new(store.path())
            .backup("/no/such/subject")
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Backup(_)));
    }

    #[tokio::test]
    async fn old_snapshots_are_pruned() {
        let subject = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        std::fs::write(subject.path().join("a"), "1").unwrap();
        let backup = SnapshotBackup::new(store.path()).with_retention(2);
        for _ in 0..4 {
            backup.backup(subject.path().to_str().unwrap()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(std::fs::read_dir(store.path()).unwrap().count(), 2);
    }
}
