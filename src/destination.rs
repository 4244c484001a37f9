//! Where a session's files go.
//!
//! Data lands in `<dir>/<stem>/`, where `<stem>` is the behavior filename
//! without its `.csv` suffix. If that folder already exists the session gets
//! `<dir>/<stem>-<unix seconds>` instead, so earlier runs are never
//! overwritten.

use crate::config::StorageConfig;
use crate::error::{AcquisitionError, AcquisitionResult};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const DATA_SUBDIR: [&str; 2] = ["REACHER", "DATA"];
const LOG_SUBDIR: [&str; 2] = ["REACHER", "LOG"];

/// Timestamp format used for default file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Default data root, `~/REACHER/DATA`.
pub fn default_data_dir() -> PathBuf {
    home_subdir(&DATA_SUBDIR)
}

/// Default log directory, `~/REACHER/LOG`.
pub fn default_log_dir() -> PathBuf {
    home_subdir(&LOG_SUBDIR)
}

fn home_subdir(parts: &[&str]) -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.extend(parts);
    path
}

/// Current local time formatted for file names.
pub fn file_timestamp() -> String {
    Local::now().format(FILE_TIMESTAMP_FORMAT).to_string()
}

/// Target directory and behavior filename for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDestination {
    dir: PathBuf,
    filename: String,
}

impl DataDestination {
    /// `filename` gets a `.csv` suffix when it has none.
    pub fn new(dir: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        let mut filename = filename.into();
        if !filename.ends_with(".csv") {
            filename.push_str(".csv");
        }
        Self {
            dir: dir.into(),
            filename,
        }
    }

    /// Destination from storage settings, defaulting the directory and a
    /// timestamped filename.
    pub fn from_config(storage: &StorageConfig) -> Self {
        let dir = storage.data_dir.clone().unwrap_or_else(default_data_dir);
        let filename = storage.filename.clone().unwrap_or_else(file_timestamp);
        Self::new(dir, filename)
    }

    /// Same directory, different filename.
    pub fn with_filename(&self, filename: impl Into<String>) -> Self {
        Self::new(self.dir.clone(), filename)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Filename without the `.csv` suffix.
    pub fn stem(&self) -> &str {
        self.filename
            .strip_suffix(".csv")
            .unwrap_or(&self.filename)
    }

    /// Create and return the session folder.
    pub fn prepare(&self) -> AcquisitionResult<PathBuf> {
        let preferred = self.dir.join(self.stem());
        let folder = if preferred.exists() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| AcquisitionError::Config(format!("system clock before epoch: {e}")))?;
            self.dir
                .join(format!("{}-{:.4}", self.stem(), now.as_secs_f64()))
        } else {
            preferred
        };
        std::fs::create_dir_all(&folder)?;
        debug!(folder = %folder.display(), "Data folder ready");
        Ok(folder)
    }
}
