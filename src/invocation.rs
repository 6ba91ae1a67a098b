//! The capture engine (ffmpeg) command-line contract, and its inverse for
//! reading a job back out of a scheduler task.

use crate::window::ResolvedWindow;
use crate::{cmd, DvrError, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

/// Identity presented to the origin server. Some IPTV providers only serve
/// known player user agents.
pub const CLIENT_USER_AGENT: &str = "VLC/3.0.20";

const SAFE_START_MOVFLAGS: &str = "+faststart";
const FRAGMENTED_MOVFLAGS: &str = "+frag_keyframe+empty_moov+default_base_moof";
const VIDEO_BUFSIZE: &str = "2M";
const MAX_CHANNEL_NAME_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    Copy,
    TranscodeMedium,
    TranscodeLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Passthrough,
    Transcode {
        video_bitrate: &'static str,
        audio_bitrate: &'static str,
    },
}

impl QualityProfile {
    pub fn encoding(&self) -> Encoding {
        match self {
            QualityProfile::Copy => Encoding::Passthrough,
            QualityProfile::TranscodeMedium => Encoding::Transcode {
                video_bitrate: "4500k",
                audio_bitrate: "128k",
            },
            QualityProfile::TranscodeLow => Encoding::Transcode {
                video_bitrate: "2500k",
                audio_bitrate: "96k",
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityProfile::Copy => "high",
            QualityProfile::TranscodeMedium => "medium",
            QualityProfile::TranscodeLow => "low",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "copy" => Some(QualityProfile::Copy),
            "medium" => Some(QualityProfile::TranscodeMedium),
            "low" => Some(QualityProfile::TranscodeLow),
            _ => None,
        }
    }

    fn from_video_bitrate(value: &str) -> Option<Self> {
        [QualityProfile::TranscodeMedium, QualityProfile::TranscodeLow]
            .into_iter()
            .find(|q| match q.encoding() {
                Encoding::Transcode { video_bitrate, .. } => video_bitrate == value,
                Encoding::Passthrough => false,
            })
    }
}

/// A fully resolved, immediately actionable capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureJob {
    pub source_url: String,
    pub output_path: PathBuf,
    pub start_at: NaiveDateTime,
    pub duration_seconds: u64,
    pub quality_profile: QualityProfile,
    pub crash_safe: bool,
}

impl CaptureJob {
    pub fn from_window(
        source_url: impl Into<String>,
        output_path: impl Into<PathBuf>,
        window: &ResolvedWindow,
        quality_profile: QualityProfile,
        crash_safe: bool,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            output_path: output_path.into(),
            start_at: window.start_at,
            duration_seconds: window.duration_seconds.max(1),
            quality_profile,
            crash_safe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn to_command(&self) -> Command {
        let mut command = cmd::command(&self.program);
        command.args(&self.args);
        command
    }

    /// Single-line rendering; arguments with spaces or shell metacharacters
    /// are double-quoted unless they are flags.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote_always(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|a| quote_if_needed(a)));
        parts.join(" ")
    }

    /// Batch file body for the OS scheduler. CRLF endings; `%` doubled so
    /// cmd.exe does not expand it.
    pub fn wrapper_script(&self) -> String {
        format!("@echo off\r\n{}\r\n", self.command_line().replace('%', "%%"))
    }
}

fn quote_always(value: &str) -> String {
    format!("\"{value}\"")
}

fn quote_if_needed(value: &str) -> String {
    let needs = value.is_empty()
        || (!value.starts_with('-')
            && value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '&' | '|' | '<' | '>' | '^' | '(' | ')')));
    if needs {
        quote_always(value)
    } else {
        value.to_string()
    }
}

pub fn build(
    engine_path: &Path,
    source_url: &str,
    output_path: &Path,
    duration_seconds: u64,
    quality_profile: QualityProfile,
    crash_safe: bool,
) -> Invocation {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "info", "-stats"]
        .into_iter()
        .map(String::from)
        .collect();

    args.extend(
        [
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_at_eof",
            "1",
            "-user_agent",
            CLIENT_USER_AGENT,
        ]
        .into_iter()
        .map(String::from),
    );
    args.push("-i".to_string());
    args.push(source_url.to_string());
    args.push("-t".to_string());
    args.push(duration_seconds.max(1).to_string());

    let movflags = if crash_safe {
        format!("{SAFE_START_MOVFLAGS}{FRAGMENTED_MOVFLAGS}")
    } else {
        SAFE_START_MOVFLAGS.to_string()
    };

    match quality_profile.encoding() {
        Encoding::Passthrough => {
            args.extend(["-c", "copy"].into_iter().map(String::from));
        }
        Encoding::Transcode {
            video_bitrate,
            audio_bitrate,
        } => {
            args.extend(
                [
                    "-map",
                    "0:v:0?",
                    "-map",
                    "0:a:0?",
                    "-c:v",
                    "libx264",
                    "-preset",
                    "veryfast",
                    "-b:v",
                    video_bitrate,
                    "-maxrate",
                    video_bitrate,
                    "-bufsize",
                    VIDEO_BUFSIZE,
                    "-c:a",
                    "aac",
                    "-b:a",
                    audio_bitrate,
                ]
                .into_iter()
                .map(String::from),
            );
        }
    }

    args.push("-movflags".to_string());
    args.push(movflags);
    args.push(output_path.to_string_lossy().to_string());

    Invocation {
        program: engine_path.to_path_buf(),
        args,
    }
}

pub fn build_for_job(engine_path: &Path, job: &CaptureJob) -> Invocation {
    build(
        engine_path,
        &job.source_url,
        &job.output_path,
        job.duration_seconds,
        job.quality_profile,
        job.crash_safe,
    )
}

/// Stream-copy remux of a (possibly truncated) recording with the index
/// moved to the front.
pub fn build_finalize(engine_path: &Path, input: &Path, fixed_output: &Path) -> Invocation {
    let mut args: Vec<String> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"]
        .into_iter()
        .map(String::from)
        .collect();
    args.push(input.to_string_lossy().to_string());
    args.extend(
        ["-c", "copy", "-movflags", SAFE_START_MOVFLAGS]
            .into_iter()
            .map(String::from),
    );
    args.push(fixed_output.to_string_lossy().to_string());
    Invocation {
        program: engine_path.to_path_buf(),
        args,
    }
}

/// What can be read back out of a command line this module generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredInvocation {
    pub program: String,
    pub source_url: String,
    pub duration_seconds: u64,
    pub output_path: String,
    pub quality_profile: Option<QualityProfile>,
    pub crash_safe: bool,
}

/// Splits a command line on whitespace, treating double-quoted runs as part
/// of one argument.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(current);
    }
    out
}

pub fn recover(command_line: &str) -> Result<RecoveredInvocation> {
    let unrecoverable = || DvrError::InvocationUnrecoverable {
        command_line: command_line.to_string(),
    };

    let tokens = split_command_line(command_line);
    let program = tokens.first().cloned().ok_or_else(unrecoverable)?;

    let value_after = |flag: &str| -> Option<(usize, &String)> {
        let idx = tokens.iter().position(|t| t == flag)?;
        tokens.get(idx + 1).map(|v| (idx + 1, v))
    };

    let (input_idx, source_url) = value_after("-i").ok_or_else(unrecoverable)?;
    let (duration_idx, duration_raw) = value_after("-t").ok_or_else(unrecoverable)?;
    if duration_idx < input_idx {
        return Err(unrecoverable());
    }
    let duration_seconds: u64 = duration_raw
        .parse()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(unrecoverable)?;

    let output_idx = tokens.len() - 1;
    let output_path = &tokens[output_idx];
    if output_idx <= duration_idx || output_path.starts_with('-') {
        return Err(unrecoverable());
    }

    let quality_profile = if tokens
        .windows(2)
        .any(|w| w[0] == "-c" && w[1] == "copy")
    {
        Some(QualityProfile::Copy)
    } else {
        value_after("-b:v").and_then(|(_, v)| QualityProfile::from_video_bitrate(v))
    };
    let crash_safe = value_after("-movflags")
        .map(|(_, v)| v.contains("frag_keyframe"))
        .unwrap_or(false);

    Ok(RecoveredInvocation {
        program,
        source_url: source_url.clone(),
        duration_seconds,
        output_path: output_path.clone(),
        quality_profile,
        crash_safe,
    })
}

/// `CNN HD` at 2025-03-01 19:55 → `CNN_HD_2025-03-01_19-55.mp4`.
pub fn auto_filename(channel_name: &str, start_at: NaiveDateTime) -> String {
    static UNSAFE_RE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

    let safe: String = re
        .replace_all(channel_name, "_")
        .chars()
        .take(MAX_CHANNEL_NAME_CHARS)
        .collect();
    format!(
        "{}_{}.mp4",
        safe.trim_end_matches('.'),
        start_at.format("%Y-%m-%d_%H-%M")
    )
}

pub fn ensure_mp4_extension(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.to_ascii_lowercase().ends_with(".mp4") {
        trimmed.to_string()
    } else {
        format!("{}.mp4", trimmed.trim_end_matches('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PathBuf {
        PathBuf::from("C:/FFmpeg/bin/ffmpeg.exe")
    }

    #[test]
    fn copy_profile_layout() {
        let inv = build(
            &engine(),
            "http://iptv.example/live/1.ts",
            Path::new("D:/DVR/out.mp4"),
            3900,
            QualityProfile::Copy,
            false,
        );
        assert_eq!(
            inv.args,
            vec![
                "-hide_banner",
                "-loglevel",
                "info",
                "-stats",
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_at_eof",
                "1",
                "-user_agent",
                "VLC/3.0.20",
                "-i",
                "http://iptv.example/live/1.ts",
                "-t",
                "3900",
                "-c",
                "copy",
                "-movflags",
                "+faststart",
                "D:/DVR/out.mp4",
            ]
        );
    }

    #[test]
    fn transcode_profile_layout_with_crash_safe() {
        let inv = build(
            &engine(),
            "http://iptv.example/live/1.ts",
            Path::new("D:/DVR/out.mp4"),
            60,
            QualityProfile::TranscodeMedium,
            true,
        );
        let joined = inv.args.join(" ");
        assert!(joined.contains(
            "-map 0:v:0? -map 0:a:0? -c:v libx264 -preset veryfast -b:v 4500k -maxrate 4500k -bufsize 2M -c:a aac -b:a 128k"
        ));
        assert!(joined.ends_with(
            "-movflags +faststart+frag_keyframe+empty_moov+default_base_moof D:/DVR/out.mp4"
        ));

        let low = build(
            &engine(),
            "u",
            Path::new("o.mp4"),
            60,
            QualityProfile::TranscodeLow,
            false,
        );
        assert!(low.args.join(" ").contains("-b:v 2500k -maxrate 2500k"));
        assert!(low.args.join(" ").contains("-b:a 96k"));
    }

    #[test]
    fn reconnect_and_agent_precede_input_and_duration() {
        let inv = build(&engine(), "u", Path::new("o.mp4"), 5, QualityProfile::Copy, true);
        let pos = |flag: &str| inv.args.iter().position(|a| a == flag).expect(flag);
        assert!(pos("-reconnect") < pos("-user_agent"));
        assert!(pos("-user_agent") < pos("-i"));
        assert!(pos("-i") < pos("-t"));
        assert!(pos("-t") < pos("-c"));
        assert!(pos("-c") < pos("-movflags"));
        assert_eq!(inv.args.last().map(String::as_str), Some("o.mp4"));
    }

    #[test]
    fn build_is_deterministic() {
        for quality in [
            QualityProfile::Copy,
            QualityProfile::TranscodeMedium,
            QualityProfile::TranscodeLow,
        ] {
            for crash_safe in [false, true] {
                let a = build(&engine(), "u", Path::new("o.mp4"), 10, quality, crash_safe);
                let b = build(&engine(), "u", Path::new("o.mp4"), 10, quality, crash_safe);
                assert_eq!(a, b);
                assert_eq!(a.command_line(), b.command_line());
            }
        }
    }

    #[test]
    fn command_line_quotes_paths_with_spaces_and_metacharacters() {
        let inv = build(
            Path::new("C:/Program Files/ffmpeg.exe"),
            "http://host/get.php?user=a&pass=b",
            Path::new("D:/DVR Recordings/News 100%.mp4"),
            60,
            QualityProfile::Copy,
            false,
        );
        let line = inv.command_line();
        assert!(line.starts_with("\"C:/Program Files/ffmpeg.exe\" -hide_banner"));
        assert!(line.contains("-i \"http://host/get.php?user=a&pass=b\" -t 60"));
        assert!(line.ends_with("\"D:/DVR Recordings/News 100%.mp4\""));

        let script = inv.wrapper_script();
        assert!(script.starts_with("@echo off\r\n"));
        assert!(script.contains("News 100%%.mp4"));
        assert!(script.ends_with("\r\n"));
    }

    #[test]
    fn recover_reads_back_generated_command_lines() {
        let inv = build(
            Path::new("C:/Program Files/ffmpeg.exe"),
            "http://host/live stream.ts",
            Path::new("D:/DVR Recordings/show.mp4"),
            3900,
            QualityProfile::TranscodeLow,
            true,
        );
        let recovered = recover(&inv.command_line()).expect("recover");
        assert_eq!(recovered.program, "C:/Program Files/ffmpeg.exe");
        assert_eq!(recovered.source_url, "http://host/live stream.ts");
        assert_eq!(recovered.duration_seconds, 3900);
        assert_eq!(recovered.output_path, "D:/DVR Recordings/show.mp4");
        assert_eq!(recovered.quality_profile, Some(QualityProfile::TranscodeLow));
        assert!(recovered.crash_safe);
    }

    #[test]
    fn recover_rejects_foreign_command_lines() {
        for line in [
            "",
            "\"C:/Windows/notepad.exe\" readme.txt",
            "ffmpeg -i in.ts out.mp4",
            "ffmpeg -i in.ts -t soon out.mp4",
            "ffmpeg -t 60 -i in.ts",
        ] {
            assert!(
                matches!(recover(line), Err(DvrError::InvocationUnrecoverable { .. })),
                "{line}"
            );
        }
    }

    #[test]
    fn split_command_line_handles_quotes_and_empty_args() {
        assert_eq!(
            split_command_line(r#""a b" c  "" "d""e""#),
            vec!["a b", "c", "", "de"]
        );
    }

    #[test]
    fn auto_filename_sanitizes_channel_names() {
        let start =
            NaiveDateTime::parse_from_str("2025-03-01 19:55", "%Y-%m-%d %H:%M").expect("dt");
        assert_eq!(
            auto_filename("US: CNN HD", start),
            "US_CNN_HD_2025-03-01_19-55.mp4"
        );
        let long = "x".repeat(80);
        assert_eq!(auto_filename(&long, start).len(), 60 + "_2025-03-01_19-55.mp4".len());
        assert_eq!(ensure_mp4_extension("show"), "show.mp4");
        assert_eq!(ensure_mp4_extension("show.MP4"), "show.MP4");
        assert_eq!(ensure_mp4_extension("show."), "show.mp4");
        assert_eq!(auto_filename("Ch. 5.", start), "Ch._5_2025-03-01_19-55.mp4");
    }

    #[test]
    fn quality_labels() {
        assert_eq!(QualityProfile::from_label("High"), Some(QualityProfile::Copy));
        assert_eq!(QualityProfile::from_label("low"), Some(QualityProfile::TranscodeLow));
        assert_eq!(QualityProfile::from_label("ultra"), None);
    }
}
