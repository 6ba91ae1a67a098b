use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// `%LOCALAPPDATA%\DvrEngine` on Windows, `$HOME/.local/share/dvr_engine`
    /// elsewhere, falling back to the working directory.
    pub fn default_base_dir() -> Option<PathBuf> {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return Some(PathBuf::from(local).join("DvrEngine"));
        }
        if let Some(home) = std::env::var_os("HOME") {
            return Some(
                PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join("dvr_engine"),
            );
        }
        std::env::current_dir().ok()
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    /// Wrapper scripts handed to the OS scheduler live here.
    pub fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    pub fn task_wrapper_path(&self, task_name: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_name}.cmd"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn session_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("sessions")
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.session_logs_dir().join(format!("{session_id}.jsonl"))
    }

    pub fn scheduler_log_path(&self) -> PathBuf {
        self.logs_dir().join("scheduler.jsonl")
    }

    pub fn default_recordings_dir(&self) -> PathBuf {
        self.base_dir.join("recordings")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffmpeg");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// The bundled engine when present, otherwise whatever `ffmpeg` resolves
    /// to on PATH.
    pub fn ffmpeg_cmd(&self) -> PathBuf {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffmpeg")
        }
    }

    pub fn resolve_engine(&self, override_path: Option<&Path>) -> PathBuf {
        match override_path {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => self.ffmpeg_cmd(),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.tasks_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.session_logs_dir())?;
        Ok(())
    }
}

/// `out.mp4` + `.fixed.mp4` → `out.mp4.fixed.mp4`.
pub fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}
