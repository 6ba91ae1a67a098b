use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Fields one engine stats line may carry. Absent fields stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSample {
    pub elapsed_seconds: Option<u64>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub size_bytes: Option<f64>,
}

impl ProgressSample {
    pub fn is_empty(&self) -> bool {
        self.elapsed_seconds.is_none()
            && self.fps.is_none()
            && self.bitrate_kbps.is_none()
            && self.size_bytes.is_none()
    }
}

struct ProgressPatterns {
    time: Regex,
    fps: Regex,
    bitrate: Regex,
    size: Regex,
}

fn patterns() -> &'static ProgressPatterns {
    static PATTERNS: OnceLock<ProgressPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ProgressPatterns {
        time: Regex::new(r"time=(\d+):(\d+):(\d+)").unwrap(),
        fps: Regex::new(r"fps=\s*([0-9.]+)").unwrap(),
        bitrate: Regex::new(r"bitrate=\s*([0-9.]+)\s*kbits/s").unwrap(),
        size: Regex::new(r"size=\s*([0-9.]+)\s*([kKmM]i?B|B)").unwrap(),
    })
}

pub fn parse_line(line: &str) -> ProgressSample {
    let p = patterns();
    let mut sample = ProgressSample::default();

    if let Some(caps) = p.time.captures(line) {
        let parts: Option<Vec<u64>> = (1..=3).map(|i| caps[i].parse::<u64>().ok()).collect();
        if let Some(parts) = parts {
            sample.elapsed_seconds = Some(parts[0] * 3600 + parts[1] * 60 + parts[2]);
        }
    }
    sample.fps = p
        .fps
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok());
    sample.bitrate_kbps = p
        .bitrate
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok());
    sample.size_bytes = p.size.captures(line).and_then(|c| {
        let amount = c[1].parse::<f64>().ok()?;
        let multiplier = match c[2].to_ascii_lowercase().as_str() {
            "kb" | "kib" => 1024.0,
            "mb" | "mib" => 1024.0 * 1024.0,
            _ => 1.0,
        };
        Some(amount * multiplier)
    });

    sample
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Waiting,
    Running,
    Completed,
    StoppedFinalized,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Waiting => "waiting",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::StoppedFinalized => "stopped_finalized",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::StoppedFinalized
                | SessionState::Aborted
                | SessionState::Failed
        )
    }
}

/// Live view of one capture, updated from engine output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSession {
    pub elapsed_seconds: u64,
    pub target_duration_seconds: u64,
    pub bitrate_kbps: Option<f64>,
    pub fps: Option<f64>,
    pub state: SessionState,
}

impl RecordingSession {
    pub fn new(target_duration_seconds: u64) -> Self {
        Self {
            elapsed_seconds: 0,
            target_duration_seconds,
            bitrate_kbps: None,
            fps: None,
            state: SessionState::Pending,
        }
    }

    /// Folds one line of engine output in. Returns whether anything changed.
    pub fn apply_line(&mut self, line: &str) -> bool {
        let sample = parse_line(line);
        if sample.is_empty() {
            return false;
        }
        self.apply(&sample);
        true
    }

    pub fn apply(&mut self, sample: &ProgressSample) {
        if let Some(elapsed) = sample.elapsed_seconds {
            self.elapsed_seconds = elapsed;
        }
        if let Some(fps) = sample.fps {
            self.fps = Some(fps);
        }
        match (sample.bitrate_kbps, sample.size_bytes) {
            (Some(kbps), _) => self.bitrate_kbps = Some(kbps),
            (None, Some(bytes)) if self.elapsed_seconds > 0 => {
                self.bitrate_kbps = Some(bytes * 8.0 / 1000.0 / self.elapsed_seconds as f64);
            }
            _ => {}
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.target_duration_seconds == 0 {
            return 0.0;
        }
        (self.elapsed_seconds as f64 / self.target_duration_seconds as f64 * 100.0).min(100.0)
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.target_duration_seconds
            .saturating_sub(self.elapsed_seconds)
    }
}

pub fn fmt_hms(total_seconds: u64) -> String {
    let h = total_seconds / 3600;
    let m = (total_seconds % 3600) / 60;
    let s = total_seconds % 60;
    format!("{h}:{m:02}:{s:02}")
}

pub fn fmt_bytes(n: u64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let n = n as f64;
    if n >= GB {
        format!("{:.2} GB", n / GB)
    } else {
        format!("{:.1} MB", n / MB)
    }
}
