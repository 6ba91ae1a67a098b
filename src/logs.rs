use crate::paths::{path_with_suffix, AppPaths};
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_MAX_BACKUPS: usize = 3;
const LOG_MAX_AGE_DAYS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Append-only JSONL event log. One object per line:
/// `{ts_ms, scope, level, event, data}`.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    scope: String,
}

impl EventLog {
    pub fn new(path: PathBuf, scope: impl Into<String>) -> Self {
        Self {
            path,
            scope: scope.into(),
        }
    }

    pub fn for_session(paths: &AppPaths, session_id: &str) -> Self {
        Self::new(paths.session_log_path(session_id), session_id)
    }

    pub fn for_scheduler(paths: &AppPaths) -> Self {
        Self::new(paths.scheduler_log_path(), "scheduler")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, level: Level, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "scope": self.scope,
            "level": level.as_str(),
            "event": event,
            "data": data
        })
        .to_string();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rotate_if_needed(&self.path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    /// Logging never fails the operation being logged.
    pub fn emit(&self, level: Level, event: &str, data: serde_json::Value) {
        let _ = self.write(level, event, data);
    }
}

pub fn emit(log: Option<&EventLog>, level: Level, event: &str, data: serde_json::Value) {
    if let Some(log) = log {
        log.emit(level, event, data);
    }
}

fn rotate_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };

    if len < LOG_ROTATE_BYTES {
        return Ok(());
    }

    rotate_file_backups(path, LOG_MAX_BACKUPS)?;
    Ok(())
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };

        if !src.exists() {
            continue;
        }

        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

/// Removes files in `logs/` and `logs/sessions/` older than the retention
/// window, rotated backups included. Returns how many files were deleted.
pub fn prune_logs(paths: &AppPaths) -> Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(LOG_MAX_AGE_DAYS * 24 * 60 * 60))
        .unwrap_or(UNIX_EPOCH);

    let mut removed = 0_usize;
    for dir in [paths.logs_dir(), paths.session_logs_dir()] {
        removed += prune_dir(&dir, cutoff)?;
    }
    Ok(removed)
}

fn prune_dir(dir: &Path, cutoff: SystemTime) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0_usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        if modified < cutoff && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
