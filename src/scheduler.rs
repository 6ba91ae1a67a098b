//! Gateway over the Windows task scheduler (`schtasks`). Every call is a
//! bounded subprocess; results are parsed back into typed values.

use crate::cmd::{self, CommandRunError};
use crate::invocation::{self, CaptureJob, QualityProfile, RecoveredInvocation};
use crate::logs::{self, EventLog, Level};
use crate::paths::AppPaths;
use crate::{DvrError, Result};
use chrono::{Datelike, NaiveDateTime, Weekday};
use csv::ReaderBuilder;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::OnceLock;
use std::time::Duration;

pub const TASK_PREFIX: &str = "IPTV_DVR_";
pub const SERIES_PREFIX: &str = "IPTV_DVR_SERIES_";

const CREATE_TIMEOUT: Duration = Duration::from_secs(20);
const QUERY_ONE_TIMEOUT: Duration = Duration::from_secs(20);
const QUERY_ALL_TIMEOUT: Duration = Duration::from_secs(25);
const DELETE_TIMEOUT: Duration = Duration::from_secs(20);
const RAW_EXCERPT_CHARS: usize = 2000;

/// Runs one `schtasks` invocation. Swapped out in tests.
pub trait TaskCommandRunner: Send + Sync {
    fn run(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<Output, CommandRunError>;
}

#[derive(Debug, Clone)]
pub struct SchtasksRunner {
    program: PathBuf,
}

impl SchtasksRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SchtasksRunner {
    fn default() -> Self {
        Self::new("schtasks")
    }
}

impl TaskCommandRunner for SchtasksRunner {
    fn run(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<Output, CommandRunError> {
        let mut command = cmd::command(&self.program);
        command.args(args);
        cmd::run_with_timeout(&mut command, timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Once,
    Weekly(Weekday),
}

impl Recurrence {
    pub fn weekly_from(start_at: NaiveDateTime) -> Self {
        Recurrence::Weekly(start_at.weekday())
    }

    pub fn label(&self) -> String {
        match self {
            Recurrence::Once => "once".to_string(),
            Recurrence::Weekly(day) => format!("weekly:{}", weekday_code(*day)),
        }
    }
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRef {
    pub name: String,
    pub wrapper_path: PathBuf,
    /// `MM/DD/YYYY`, as handed to the scheduler.
    pub trigger_date: String,
    /// `HH:MM`.
    pub trigger_time: String,
}

/// One row of the scheduler listing. Fields other than `name` are the
/// scheduler's own (localized) text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    pub name: String,
    pub next_run: String,
    pub schedule: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDetail {
    pub name: String,
    pub command_line: String,
    pub invocation: RecoveredInvocation,
}

impl TaskDetail {
    /// An immediate capture of what this task would have recorded.
    pub fn start_now_job(&self, now: NaiveDateTime) -> CaptureJob {
        CaptureJob {
            source_url: self.invocation.source_url.clone(),
            output_path: PathBuf::from(&self.invocation.output_path),
            start_at: now,
            duration_seconds: self.invocation.duration_seconds,
            quality_profile: self
                .invocation
                .quality_profile
                .unwrap_or(QualityProfile::Copy),
            crash_safe: self.invocation.crash_safe,
        }
    }

    pub fn engine_path(&self) -> PathBuf {
        PathBuf::from(&self.invocation.program)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub successes: Vec<String>,
    pub failures: Vec<TaskFailure>,
}

impl DeleteReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut msg = format!("Deleted {} task(s).", self.successes.len());
        if !self.failures.is_empty() {
            msg.push_str(&format!(" {} failed.", self.failures.len()));
        }
        msg
    }
}

fn unsafe_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap())
}

/// `News_2025-03-01_19-55.mp4` → `IPTV_DVR_News_2025-03-01_19-55_mp4`.
pub fn one_time_task_name(file_name: &str) -> String {
    format!(
        "{TASK_PREFIX}{}",
        unsafe_name_chars().replace_all(file_name.trim(), "_")
    )
}

/// `IPTV_DVR_SERIES_<show>_<YYYYMMDD>_<HHMM>`.
pub fn series_task_name(show: &str, start_at: NaiveDateTime) -> String {
    let tag = unsafe_name_chars().replace_all(show.trim(), "_");
    let tag = tag.trim_matches('_');
    let tag = if tag.is_empty() { "show" } else { tag };
    format!("{SERIES_PREFIX}{tag}_{}", start_at.format("%Y%m%d_%H%M"))
}

pub struct SchedulerGateway<R: TaskCommandRunner = SchtasksRunner> {
    runner: R,
    paths: AppPaths,
    log: Option<EventLog>,
}

impl SchedulerGateway<SchtasksRunner> {
    pub fn system(paths: AppPaths) -> Self {
        let log = EventLog::for_scheduler(&paths);
        Self::new(SchtasksRunner::default(), paths).with_log(log)
    }
}

impl<R: TaskCommandRunner> SchedulerGateway<R> {
    pub fn new(runner: R, paths: AppPaths) -> Self {
        Self {
            runner,
            paths,
            log: None,
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Writes the wrapper script for `job` and registers it under
    /// `task_name`, overwriting any task of the same name.
    pub fn create(
        &self,
        job: &CaptureJob,
        recurrence: Recurrence,
        task_name: &str,
        engine_path: &Path,
    ) -> Result<TaskRef> {
        let invocation = invocation::build_for_job(engine_path, job);
        let wrapper_path = self.paths.task_wrapper_path(task_name);
        if let Some(parent) = wrapper_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&wrapper_path, invocation.wrapper_script())?;

        let trigger_date = job.start_at.format("%m/%d/%Y").to_string();
        let trigger_time = job.start_at.format("%H:%M").to_string();

        let mut args: Vec<String> = vec!["/Create".into(), "/SC".into()];
        match recurrence {
            Recurrence::Once => args.push("ONCE".into()),
            Recurrence::Weekly(day) => {
                args.push("WEEKLY".into());
                args.push("/D".into());
                args.push(weekday_code(day).into());
            }
        }
        args.extend([
            "/TN".to_string(),
            task_name.to_string(),
            "/TR".to_string(),
            task_run_target(&wrapper_path),
            "/ST".to_string(),
            trigger_time.clone(),
            "/SD".to_string(),
            trigger_date.clone(),
            "/F".to_string(),
        ]);

        match self.run(&args, CREATE_TIMEOUT) {
            Ok(_) => {
                logs::emit(
                    self.log.as_ref(),
                    Level::Info,
                    "task_created",
                    serde_json::json!({
                        "name": task_name,
                        "recurrence": recurrence.label(),
                        "date": trigger_date,
                        "time": trigger_time,
                        "duration_seconds": job.duration_seconds,
                        "output_path": job.output_path.to_string_lossy(),
                    }),
                );
                Ok(TaskRef {
                    name: task_name.to_string(),
                    wrapper_path,
                    trigger_date,
                    trigger_time,
                })
            }
            Err(err) => {
                let _ = std::fs::remove_file(&wrapper_path);
                logs::emit(
                    self.log.as_ref(),
                    Level::Error,
                    "task_create_failed",
                    serde_json::json!({ "name": task_name, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Registers a one-time task named after the job's output file.
    pub fn create_one_time(&self, job: &CaptureJob, engine_path: &Path) -> Result<TaskRef> {
        let file_name = job
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = one_time_task_name(&file_name);
        self.create(job, Recurrence::Once, &name, engine_path)
    }

    /// Tasks carrying the system prefix, sorted by name. `name_filter`
    /// narrows further by case-insensitive substring.
    pub fn query_all(&self, name_filter: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let args: Vec<String> = ["/Query", "/FO", "CSV", "/V"]
            .into_iter()
            .map(String::from)
            .collect();
        let output = self.run(&args, QUERY_ALL_TIMEOUT).map_err(|err| {
            logs::emit(
                self.log.as_ref(),
                Level::Warn,
                "task_query_failed",
                serde_json::json!({ "error": err.to_string() }),
            );
            err
        })?;

        let text = decode_output(&output.stdout);
        let filter = name_filter
            .map(|f| f.trim().to_ascii_lowercase())
            .filter(|f| !f.is_empty());

        let mut tasks: Vec<ScheduledTask> = parse_task_csv(&text)?
            .into_iter()
            .filter(|t| t.name.starts_with(TASK_PREFIX))
            .filter(|t| match &filter {
                Some(f) => t.name.to_ascii_lowercase().contains(f.as_str()),
                None => true,
            })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks.dedup_by(|a, b| a.name == b.name);
        Ok(tasks)
    }

    pub fn query_one(&self, name: &str) -> Result<TaskDetail> {
        let args: Vec<String> = vec!["/Query".into(), "/TN".into(), name.into(), "/XML".into()];
        let output = self.run(&args, QUERY_ONE_TIMEOUT)?;
        let xml = decode_output(&output.stdout);
        let (command, arguments) = parse_task_xml(&xml)?;

        let command_line = match read_wrapper_command_line(Path::new(&command)) {
            Some(line) => line,
            None if arguments.is_empty() => format!("\"{command}\""),
            None => format!("\"{command}\" {arguments}"),
        };
        let invocation = invocation::recover(&command_line)?;
        Ok(TaskDetail {
            name: name.to_string(),
            command_line,
            invocation,
        })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let args: Vec<String> = vec!["/Delete".into(), "/TN".into(), name.into(), "/F".into()];
        match self.run(&args, DELETE_TIMEOUT) {
            Ok(_) => {
                let _ = std::fs::remove_file(self.paths.task_wrapper_path(name));
                logs::emit(
                    self.log.as_ref(),
                    Level::Info,
                    "task_deleted",
                    serde_json::json!({ "name": name }),
                );
                Ok(())
            }
            Err(err) => {
                logs::emit(
                    self.log.as_ref(),
                    Level::Warn,
                    "task_delete_failed",
                    serde_json::json!({ "name": name, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Deletes each name in turn; one failure does not stop the rest.
    pub fn delete_batch(&self, names: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for name in names {
            match self.delete(name) {
                Ok(()) => report.successes.push(name.clone()),
                Err(err) => report.failures.push(TaskFailure {
                    name: name.clone(),
                    error: err.to_string(),
                }),
            }
        }
        report
    }

    fn run(&self, args: &[String], timeout: Duration) -> Result<Output> {
        match self.runner.run(args, timeout) {
            Ok(output) if output.status.success() => Ok(output),
            Ok(output) => Err(DvrError::SchedulerNonZeroExit {
                code: output.status.code(),
                stdout: decode_output(&output.stdout).trim().to_string(),
                stderr: decode_output(&output.stderr).trim().to_string(),
            }),
            Err(CommandRunError::TimedOut(secs)) => Err(DvrError::SchedulerTimeout {
                command: format!("schtasks {}", args.join(" ")),
                timeout_secs: secs,
            }),
            Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DvrError::ExternalToolMissing {
                    tool: "schtasks".to_string(),
                })
            }
            Err(CommandRunError::Spawn(e)) | Err(CommandRunError::Wait(e)) => Err(DvrError::Io(e)),
        }
    }
}

fn task_run_target(wrapper_path: &Path) -> String {
    let path = wrapper_path.to_string_lossy().to_string();
    if path.chars().any(char::is_whitespace) {
        format!("\"{path}\"")
    } else {
        path
    }
}

/// schtasks writes UTF-16LE when redirected on some hosts and the console
/// code page elsewhere.
pub fn decode_output(bytes: &[u8]) -> String {
    let text = if looks_utf16le(bytes) {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).to_string()
    };
    text.trim_start_matches('\u{feff}').to_string()
}

fn looks_utf16le(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return true;
    }
    if bytes.len() < 2 {
        return false;
    }
    let sample: Vec<u8> = bytes.iter().skip(1).step_by(2).take(64).copied().collect();
    let zeros = sample.iter().filter(|b| **b == 0).count();
    zeros * 2 > sample.len()
}

/// Parses verbose CSV listing output. The first record is the header;
/// `/V` output repeats it between folders, and rows whose width does not
/// match it are skipped.
pub fn parse_task_csv(text: &str) -> Result<Vec<ScheduledTask>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with("INFO:") {
        return Ok(Vec::new());
    }

    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(trimmed.as_bytes());

    let mut headers: Option<Vec<String>> = None;
    let mut tasks = Vec::new();
    for record in rdr.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => continue,
        };
        let fields: Vec<String> = record.iter().map(|f| f.trim().to_string()).collect();
        let Some(header) = headers.as_ref() else {
            if !fields.iter().any(|f| f == "TaskName") {
                return Err(DvrError::SchedulerUnparseable {
                    reason: "listing has no TaskName column".to_string(),
                    raw: excerpt(text),
                });
            }
            headers = Some(fields);
            continue;
        };
        if fields.len() != header.len() || fields == *header {
            continue;
        }

        let column = |names: &[&str]| -> String {
            names
                .iter()
                .find_map(|n| header.iter().position(|h| h == n))
                .and_then(|i| fields.get(i))
                .cloned()
                .unwrap_or_default()
        };
        let name = column(&["TaskName"]).trim_start_matches('\\').to_string();
        if name.is_empty() {
            continue;
        }
        tasks.push(ScheduledTask {
            name,
            next_run: column(&["Next Run Time"]),
            schedule: column(&["Schedule", "Schedule Type"]),
            status: column(&["Status"]),
        });
    }
    Ok(tasks)
}

/// Pulls `Command` and `Arguments` out of the task XML. A missing
/// `Arguments` node reads as empty.
pub fn parse_task_xml(xml: &str) -> Result<(String, String)> {
    static COMMAND_RE: OnceLock<Regex> = OnceLock::new();
    static ARGUMENTS_RE: OnceLock<Regex> = OnceLock::new();
    let command_re =
        COMMAND_RE.get_or_init(|| Regex::new(r"(?s)<Command>(.*?)</Command>").unwrap());
    let arguments_re =
        ARGUMENTS_RE.get_or_init(|| Regex::new(r"(?s)<Arguments>(.*?)</Arguments>").unwrap());

    let command = command_re
        .captures(xml)
        .map(|c| unescape_xml(c[1].trim()))
        .filter(|c| !c.is_empty())
        .ok_or_else(|| DvrError::SchedulerUnparseable {
            reason: "task XML has no Command node".to_string(),
            raw: excerpt(xml),
        })?;
    let arguments = arguments_re
        .captures(xml)
        .map(|c| unescape_xml(c[1].trim()))
        .unwrap_or_default();

    Ok((command.trim_matches('"').to_string(), arguments))
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// The engine command line inside a generated `.cmd` wrapper, with `%%`
/// un-doubled. `None` when `path` is not a readable wrapper.
fn read_wrapper_command_line(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    if ext != "cmd" && ext != "bat" {
        return None;
    }
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.eq_ignore_ascii_case("@echo off"))
        .map(|l| l.replace("%%", "%"))
}

fn excerpt(raw: &str) -> String {
    raw.chars().take(RAW_EXCERPT_CHARS).collect()
}
