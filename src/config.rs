use crate::invocation::QualityProfile;
use crate::paths::AppPaths;
use crate::{DvrError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SERIES_LOOKAHEAD_DAYS: u32 = 30;
const DEFAULT_BUFFER_MINUTES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSetting {
    pub enabled: bool,
    pub minutes: u32,
}

impl BufferSetting {
    pub fn minutes_if_enabled(&self) -> Option<u32> {
        if self.enabled {
            Some(self.minutes)
        } else {
            None
        }
    }
}

impl Default for BufferSetting {
    fn default() -> Self {
        Self {
            enabled: true,
            minutes: DEFAULT_BUFFER_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Where recordings land when the caller gives no directory.
    pub out_dir: Option<PathBuf>,
    pub quality: QualityProfile,
    pub series_days: u32,
    pub crash_safe: bool,
    pub start_buffer: BufferSetting,
    pub end_buffer: BufferSetting,
    pub engine_path: Option<PathBuf>,
    pub m3u_url: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            out_dir: None,
            quality: QualityProfile::Copy,
            series_days: DEFAULT_SERIES_LOOKAHEAD_DAYS,
            crash_safe: false,
            start_buffer: BufferSetting::default(),
            end_buffer: BufferSetting::default(),
            engine_path: None,
            m3u_url: String::new(),
        }
    }
}

impl RecorderSettings {
    pub fn effective_out_dir(&self, paths: &AppPaths) -> PathBuf {
        match &self.out_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => paths.default_recordings_dir(),
        }
    }

    pub fn series_days(&self) -> u32 {
        self.series_days.max(1)
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<RecorderSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(RecorderSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: RecorderSettings =
        serde_json::from_slice(&bytes).map_err(|e| DvrError::InvalidSettings {
            path: path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &RecorderSettings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let settings = load_settings(&paths).expect("load");
        assert_eq!(settings.series_days, 30);
        assert_eq!(settings.start_buffer.minutes_if_enabled(), Some(5));
        assert_eq!(settings.end_buffer.minutes_if_enabled(), Some(5));
        assert!(!settings.crash_safe);
        assert_eq!(settings.effective_out_dir(&paths), paths.default_recordings_dir());
    }

    #[test]
    fn settings_roundtrip_and_partial_files_fill_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let mut settings = RecorderSettings::default();
        settings.quality = QualityProfile::TranscodeLow;
        settings.end_buffer.enabled = false;
        save_settings(&paths, &settings).expect("save");
        let loaded = load_settings(&paths).expect("load");
        assert_eq!(loaded.quality, QualityProfile::TranscodeLow);
        assert_eq!(loaded.end_buffer.minutes_if_enabled(), None);

        std::fs::write(paths.settings_path(), r#"{"crash_safe": true}"#).expect("write");
        let partial = load_settings(&paths).expect("load partial");
        assert!(partial.crash_safe);
        assert_eq!(partial.series_days, 30);
    }

    #[test]
    fn malformed_settings_name_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("mkdir");
        std::fs::write(paths.settings_path(), "{not json").expect("write");
        let err = load_settings(&paths).expect_err("malformed");
        assert!(err.to_string().contains("settings.json"));
    }
}
