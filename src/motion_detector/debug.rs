//! Scoring-stage dumps for tuning
//!
//! Each stage is written as `<unix_ms>_<frame:04>_<stage>.png`. The
//! directory is pruned when opened: files older than a day go, and past
//! 100 MB the oldest files go until it is under 50 MB.

use image::GrayImage;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const MAX_DIR_BYTES: u64 = 100 * 1024 * 1024;
const TARGET_DIR_BYTES: u64 = 50 * 1024 * 1024;
const MAX_FILE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct DebugDump {
    dir: PathBuf,
}

impl DebugDump {
    /// Create and prune `dir`. None when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Option<Self> {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(path = %dir.display(), error = %e, "Failed to create motion debug directory");
            return None;
        }

        match prune(&dir, MAX_DIR_BYTES, TARGET_DIR_BYTES, MAX_FILE_AGE) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(path = %dir.display(), removed = removed, "Motion debug directory pruned"),
            Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to prune motion debug directory"),
        }

        tracing::info!(path = %dir.display(), "Motion debug dumps enabled");
        Some(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one stage. Failures are logged and otherwise ignored.
    pub fn save(&self, frame: u64, stage: &str, image: &GrayImage) {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = self.dir.join(format!("{}_{:04}_{}.png", millis, frame, stage));
        if let Err(e) = image.save(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save motion debug frame");
        }
    }
}

/// Remove expired files, then the oldest ones while the directory exceeds
/// `max_bytes`, stopping below `target_bytes`. Returns the number removed.
pub fn prune(dir: &Path, max_bytes: u64, target_bytes: u64, max_age: Duration) -> io::Result<usize> {
    let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut files = Vec::new();
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if modified < cutoff {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        } else {
            files.push((modified, meta.len(), entry.path()));
        }
    }

    let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
    if total > max_bytes {
        files.sort_by_key(|(modified, _, _)| *modified);
        for (_, len, path) in files {
            if total < target_bytes {
                break;
            }
            std::fs::remove_file(&path)?;
            total = total.saturating_sub(len);
            removed += 1;
        }
    }

    Ok(removed)
}
