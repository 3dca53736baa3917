//! Timestamped file backups with per-class retention.

use crate::{BridgeError, BridgeResult};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Largest file the backup step will copy.
pub const MAX_BACKUP_FILE_SIZE_MB: u64 = 50;

/// Free disk space required before a migration step may run.
pub const MIN_FREE_DISK_SPACE_MB: u64 = 100;

/// Retention class of a backed-up file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// The user configuration document.
    Config,
    /// Entity-registry exports.
    Registry,
}

impl FileClass {
    pub fn retention_days(&self) -> u64 {
        match self {
            FileClass::Config => 60,
            FileClass::Registry => 30,
        }
    }
}

/// Writes and restores `<original>.<yyyymmdd_HHMMSS>.bak` artifacts under
/// one backup directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the backup directory (mode 0755) and verify it is writable.
    pub fn preflight(&self) -> BridgeResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o755))?;
        }

        let probe = self.dir.join(".write_probe");
        std::fs::write(&probe, b"ok").map_err(|e| {
            BridgeError::resource(format!(
                "Backup directory {} not writable: {e}",
                self.dir.display()
            ))
        })?;
        let _ = std::fs::remove_file(&probe);

        let free = free_disk_mb(&self.dir);
        if free < MIN_FREE_DISK_SPACE_MB {
            return Err(BridgeError::resource(format!(
                "Insufficient disk space: {free} MB free, {MIN_FREE_DISK_SPACE_MB} MB required"
            )));
        }
        Ok(())
    }

    /// Copy a file into the backup directory with a timestamped name.
    /// Returns the backup path.
    pub fn backup_file(&self, source: &Path) -> BridgeResult<PathBuf> {
        let metadata = std::fs::metadata(source)?;
        let size_mb = metadata.len() / (1024 * 1024);
        if size_mb > MAX_BACKUP_FILE_SIZE_MB {
            return Err(BridgeError::resource(format!(
                "{} is {size_mb} MB, exceeds the {MAX_BACKUP_FILE_SIZE_MB} MB backup cap",
                source.display()
            )));
        }

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BridgeError::input_invalid("Backup source has no file name"))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let target = self.dir.join(format!("{file_name}.{stamp}.bak"));

        std::fs::copy(source, &target)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644))?;
        }
        tracing::debug!(source = %source.display(), backup = %target.display(), "Backup written");
        Ok(target)
    }

    /// Write an in-memory snapshot (e.g. a registry export) as a timestamped
    /// backup artifact named after `file_name`.
    pub fn backup_snapshot(&self, file_name: &str, contents: &str) -> BridgeResult<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let target = self.dir.join(format!("{file_name}.{stamp}.bak"));
        std::fs::write(&target, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644))?;
        }
        tracing::debug!(backup = %target.display(), "Snapshot backup written");
        Ok(target)
    }

    /// Restore a backup over its original location.
    pub fn restore(&self, backup: &Path, original: &Path) -> BridgeResult<()> {
        std::fs::copy(backup, original)?;
        tracing::info!(backup = %backup.display(), original = %original.display(),
            "Restored from backup");
        Ok(())
    }

    /// Expire backups of one original file past the class retention.
    ///
    /// The newest backup is always kept so there is never a window with no
    /// copy newer than the last successful commit. Returns the number of
    /// files removed.
    pub fn cleanup(&self, original_file_name: &str, class: FileClass) -> BridgeResult<usize> {
        let prefix = format!("{original_file_name}.");
        let mut backups: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".bak") {
                let modified = entry.metadata()?.modified()?;
                backups.push((entry.path(), modified));
            }
        }

        backups.sort_by(|a, b| b.1.cmp(&a.1));
        let cutoff = std::time::Duration::from_secs(class.retention_days() * 24 * 3600);
        let now = SystemTime::now();

        let mut removed = 0;
        for (path, modified) in backups.iter().skip(1) {
            let age = now.duration_since(*modified).unwrap_or_default();
            if age > cutoff {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(file = original_file_name, removed, "Expired old backups");
        }
        Ok(removed)
    }
}

/// Available space in megabytes on the filesystem holding `path`.
pub fn free_disk_mb(path: &Path) -> u64 {
    let target = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / (1024 * 1024))
        .unwrap_or(u64::MAX)
}
