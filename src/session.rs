//! Supervises one capture attempt: waits for the start instant, runs the
//! engine, folds its output into progress, and carries out exactly one
//! terminal operation.

use crate::cmd;
use crate::invocation::{self, CaptureJob, Invocation};
use crate::logs::{EventLog, Level};
use crate::paths::{path_with_suffix, AppPaths};
use crate::progress::{RecordingSession, SessionState};
use crate::{worker, DvrError};
use chrono::Local;
use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const REQUEST_NONE: u8 = 0;
const REQUEST_STOP: u8 = 1;
const REQUEST_ABORT: u8 = 2;

const OUTPUT_DRAIN_MS: u64 = 2000;
const FINALIZED_SUFFIX: &str = ".fixed.mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    StopAndFinalize,
    AbortAndDelete,
}

/// Cloneable handle for ending a session from another thread. An abort
/// request overrides an earlier stop request, never the other way round.
#[derive(Debug, Clone)]
pub struct SessionControl {
    request: Arc<AtomicU8>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self {
            request: Arc::new(AtomicU8::new(REQUEST_NONE)),
        }
    }
}

impl SessionControl {
    pub fn stop_and_finalize(&self) {
        self.request.fetch_max(REQUEST_STOP, Ordering::SeqCst);
    }

    pub fn abort_and_delete(&self) {
        self.request.fetch_max(REQUEST_ABORT, Ordering::SeqCst);
    }

    pub fn requested(&self) -> Option<ControlRequest> {
        match self.request.load(Ordering::SeqCst) {
            REQUEST_STOP => Some(ControlRequest::StopAndFinalize),
            REQUEST_ABORT => Some(ControlRequest::AbortAndDelete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub wait_poll: Duration,
    pub tick: Duration,
    pub stop_grace: Duration,
    pub finalize_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            wait_poll: Duration::from_millis(500),
            tick: Duration::from_millis(200),
            stop_grace: Duration::from_secs(10),
            finalize_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Waiting { remaining_seconds: u64 },
    Started { pid: u32, command_line: String },
    Output(String),
    Progress(RecordingSession),
    Stopping(ControlRequest),
    Finalizing,
}

/// Non-fatal cleanup problems reported alongside the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    FinalizeFailed { reason: String },
    OutputDeleteFailed { path: String, reason: String },
    EngineExitedNonZero { code: Option<i32> },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::FinalizeFailed { reason } => {
                write!(f, "finalize skipped; file kept as recorded ({reason})")
            }
            Advisory::OutputDeleteFailed { path, reason } => {
                write!(f, "could not delete {path}: {reason}")
            }
            Advisory::EngineExitedNonZero { code } => match code {
                Some(c) => write!(f, "engine exited with code {c}"),
                None => write!(f, "engine was terminated by a signal"),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub state: SessionState,
    pub output_path: PathBuf,
    pub output_bytes: Option<u64>,
    pub exit_code: Option<i32>,
    pub progress: RecordingSession,
    pub advisories: Vec<Advisory>,
    pub error: Option<String>,
}

enum EngineExit {
    Natural(Option<i32>),
    Requested(ControlRequest),
    WaitFailed(std::io::Error),
}

/// Engine output lines arriving from the reader threads.
struct LinePump {
    rx: Receiver<String>,
    open: bool,
}

impl LinePump {
    /// Waits up to `tick` for the next line.
    fn next(&mut self, tick: Duration) -> Option<String> {
        if !self.open {
            thread::sleep(tick);
            return None;
        }
        match self.rx.recv_timeout(tick) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.open = false;
                None
            }
        }
    }

    /// Lines still buffered after the engine exited. Bounded: a grandchild
    /// may keep the pipes open.
    fn drain(&mut self, limit: Duration) -> Vec<String> {
        let deadline = Instant::now() + limit;
        let mut out = Vec::new();
        while self.open {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(line) => out.push(line),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => self.open = false,
            }
        }
        out
    }
}

/// Splits a byte stream on both `\r` and `\n`; ffmpeg rewrites its stats
/// line in place with bare carriage returns.
fn spawn_line_reader<R: Read + Send + 'static>(stream: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let (consumed, found) = {
                let chunk = match reader.fill_buf() {
                    Ok(c) => c,
                    Err(_) => break,
                };
                if chunk.is_empty() {
                    break;
                }
                match chunk.iter().position(|b| *b == b'\n' || *b == b'\r') {
                    Some(i) => {
                        buf.extend_from_slice(&chunk[..i]);
                        (i + 1, true)
                    }
                    None => {
                        buf.extend_from_slice(chunk);
                        (chunk.len(), false)
                    }
                }
            };
            reader.consume(consumed);
            if found {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                buf.clear();
                if !line.is_empty() && tx.send(line).is_err() {
                    return;
                }
            }
        }
        let rest = String::from_utf8_lossy(&buf).trim_end().to_string();
        if !rest.is_empty() {
            let _ = tx.send(rest);
        }
    })
}

pub struct SessionSupervisor {
    id: String,
    job: CaptureJob,
    invocation: Invocation,
    control: SessionControl,
    options: SupervisorOptions,
    log: Option<EventLog>,
}

impl SessionSupervisor {
    pub fn new(engine_path: &Path, job: CaptureJob) -> Self {
        let invocation = invocation::build_for_job(engine_path, &job);
        Self::from_invocation(job, invocation)
    }

    /// The finalize remux reuses `invocation.program`.
    pub fn from_invocation(job: CaptureJob, invocation: Invocation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job,
            invocation,
            control: SessionControl::default(),
            options: SupervisorOptions::default(),
            log: None,
        }
    }

    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_session_log(self, paths: &AppPaths) -> Self {
        let log = EventLog::for_session(paths, &self.id);
        self.with_log(log)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job(&self) -> &CaptureJob {
        &self.job
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Runs the session on a worker thread; `done` is called there with the
    /// outcome.
    pub fn spawn<E, D>(self, on_event: E, done: D) -> std::io::Result<JoinHandle<()>>
    where
        E: FnMut(&SessionEvent) + Send + 'static,
        D: FnOnce(SessionOutcome) + Send + 'static,
    {
        let name = format!("dvr-session-{}", &self.id[..8]);
        worker::spawn(&name, move || self.run(on_event), done)
    }

    pub fn run(self, mut on_event: impl FnMut(&SessionEvent)) -> SessionOutcome {
        let mut progress = RecordingSession::new(self.job.duration_seconds);
        self.log(
            Level::Info,
            "session_created",
            serde_json::json!({
                "source_url": self.job.source_url,
                "output_path": self.job.output_path.to_string_lossy(),
                "start_at": self.job.start_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                "duration_seconds": self.job.duration_seconds,
                "quality": self.job.quality_profile.label(),
                "crash_safe": self.job.crash_safe,
            }),
        );

        progress.state = SessionState::Waiting;
        if let Some(request) = self.wait_for_start(&mut on_event) {
            self.log(
                Level::Info,
                "canceled_before_start",
                serde_json::json!({ "request": request }),
            );
            progress.state = SessionState::Aborted;
            return self.finish(progress, None, Vec::new(), None);
        }

        if let Some(parent) = self.job.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    progress.state = SessionState::Failed;
                    let message = format!("cannot create {}: {err}", parent.display());
                    self.log(
                        Level::Error,
                        "output_dir_failed",
                        serde_json::json!({ "error": message }),
                    );
                    return self.finish(progress, None, Vec::new(), Some(message));
                }
            }
        }

        let mut command = self.invocation.to_command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = DvrError::EngineLaunchFailure {
                    program: self.invocation.program.to_string_lossy().to_string(),
                    source,
                };
                self.log(
                    Level::Error,
                    "engine_launch_failed",
                    serde_json::json!({ "error": err.to_string() }),
                );
                progress.state = SessionState::Failed;
                return self.finish(progress, None, Vec::new(), Some(err.to_string()));
            }
        };

        progress.state = SessionState::Running;
        let command_line = self.invocation.command_line();
        self.log(
            Level::Info,
            "engine_started",
            serde_json::json!({ "pid": child.id(), "command_line": command_line }),
        );
        on_event(&SessionEvent::Started {
            pid: child.id(),
            command_line,
        });

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);
        let mut pump = LinePump { rx, open: true };
        let mut stdin = child.stdin.take();

        let exit = loop {
            if let Some(line) = pump.next(self.options.tick) {
                self.handle_line(&line, &mut progress, &mut on_event);
            }
            if let Some(request) = self.control.requested() {
                break EngineExit::Requested(request);
            }
            match child.try_wait() {
                Ok(Some(status)) => break EngineExit::Natural(status.code()),
                Ok(None) => {}
                Err(err) => {
                    cmd::kill_process_tree(&mut child);
                    break EngineExit::WaitFailed(err);
                }
            }
        };

        match exit {
            EngineExit::Natural(code) => {
                for line in pump.drain(Duration::from_millis(OUTPUT_DRAIN_MS)) {
                    self.handle_line(&line, &mut progress, &mut on_event);
                }
                self.log(Level::Info, "engine_exited", serde_json::json!({ "code": code }));
                let mut advisories = Vec::new();
                if code != Some(0) {
                    let advisory = Advisory::EngineExitedNonZero { code };
                    self.log(
                        Level::Warn,
                        "engine_exit_nonzero",
                        serde_json::json!({ "code": code, "advisory": advisory.to_string() }),
                    );
                    advisories.push(advisory);
                }
                progress.state = SessionState::Completed;
                self.finish(progress, code, advisories, None)
            }
            EngineExit::WaitFailed(err) => {
                self.log(
                    Level::Error,
                    "engine_wait_failed",
                    serde_json::json!({ "error": err.to_string() }),
                );
                progress.state = SessionState::Failed;
                self.finish(progress, None, Vec::new(), Some(err.to_string()))
            }
            EngineExit::Requested(ControlRequest::StopAndFinalize) => {
                on_event(&SessionEvent::Stopping(ControlRequest::StopAndFinalize));
                self.log(Level::Info, "stop_requested", serde_json::json!({}));
                request_graceful_exit(stdin.take());
                let code = self.wait_or_kill(&mut child, &mut pump, &mut progress, &mut on_event);
                for line in pump.drain(Duration::from_millis(OUTPUT_DRAIN_MS)) {
                    self.handle_line(&line, &mut progress, &mut on_event);
                }

                on_event(&SessionEvent::Finalizing);
                let mut advisories = Vec::new();
                match self.finalize() {
                    Ok(()) => self.log(
                        Level::Info,
                        "finalized",
                        serde_json::json!({ "output_path": self.job.output_path.to_string_lossy() }),
                    ),
                    Err(reason) => {
                        let advisory = Advisory::FinalizeFailed { reason };
                        self.log(
                            Level::Warn,
                            "finalize_failed",
                            serde_json::json!({ "advisory": advisory.to_string() }),
                        );
                        advisories.push(advisory);
                    }
                }
                progress.state = SessionState::StoppedFinalized;
                self.finish(progress, code, advisories, None)
            }
            EngineExit::Requested(ControlRequest::AbortAndDelete) => {
                on_event(&SessionEvent::Stopping(ControlRequest::AbortAndDelete));
                self.log(Level::Info, "abort_requested", serde_json::json!({}));
                drop(stdin);
                cmd::kill_process_tree(&mut child);

                let mut advisories = Vec::new();
                if let Some(advisory) = self.delete_output() {
                    advisories.push(advisory);
                }
                progress.state = SessionState::Aborted;
                self.finish(progress, None, advisories, None)
            }
        }
    }

    /// Sleeps in short polls until `start_at`, reporting whole seconds
    /// remaining. Returns the request if the session was ended first.
    fn wait_for_start(&self, on_event: &mut impl FnMut(&SessionEvent)) -> Option<ControlRequest> {
        let mut last_reported: Option<u64> = None;
        let mut logged = false;
        loop {
            if let Some(request) = self.control.requested() {
                return Some(request);
            }
            let now = Local::now().naive_local();
            if now >= self.job.start_at {
                return None;
            }
            let remaining = (self.job.start_at - now).num_seconds().max(0) as u64;
            if !logged {
                self.log(
                    Level::Info,
                    "waiting_for_start",
                    serde_json::json!({ "remaining_seconds": remaining }),
                );
                logged = true;
            }
            if last_reported != Some(remaining) {
                on_event(&SessionEvent::Waiting {
                    remaining_seconds: remaining,
                });
                last_reported = Some(remaining);
            }
            thread::sleep(self.options.wait_poll);
        }
    }

    fn handle_line(
        &self,
        line: &str,
        progress: &mut RecordingSession,
        on_event: &mut impl FnMut(&SessionEvent),
    ) {
        on_event(&SessionEvent::Output(line.to_string()));
        if progress.apply_line(line) {
            on_event(&SessionEvent::Progress(progress.clone()));
        }
    }

    fn wait_or_kill(
        &self,
        child: &mut Child,
        pump: &mut LinePump,
        progress: &mut RecordingSession,
        on_event: &mut impl FnMut(&SessionEvent),
    ) -> Option<i32> {
        let deadline = Instant::now() + self.options.stop_grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) if Instant::now() < deadline => {
                    if let Some(line) = pump.next(self.options.tick) {
                        self.handle_line(&line, progress, on_event);
                    }
                }
                _ => {
                    self.log(
                        Level::Warn,
                        "engine_killed",
                        serde_json::json!({ "grace_ms": self.options.stop_grace.as_millis() as u64 }),
                    );
                    cmd::kill_process_tree(child);
                    return None;
                }
            }
        }
    }

    /// Remuxes the output with its index at the front and swaps it in.
    /// The original stays untouched on any failure.
    fn finalize(&self) -> std::result::Result<(), String> {
        let output = &self.job.output_path;
        match std::fs::metadata(output) {
            Ok(m) if m.len() > 0 => {}
            Ok(_) => return Err("output file is empty".to_string()),
            Err(err) => return Err(format!("output file unavailable: {err}")),
        }

        let fixed = path_with_suffix(output, FINALIZED_SUFFIX);
        let remux = invocation::build_finalize(&self.invocation.program, output, &fixed);
        let result = cmd::run_with_timeout(&mut remux.to_command(), self.options.finalize_timeout);

        let failure = match result {
            Ok(out) if out.status.success() && fixed.exists() => {
                return std::fs::rename(&fixed, output).map_err(|err| {
                    let _ = std::fs::remove_file(&fixed);
                    format!("replace failed: {err}")
                });
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let last = stderr.lines().last().unwrap_or("").trim().to_string();
                format!("remux exited with code {:?}: {last}", out.status.code())
            }
            Err(err) => format!("remux {err}"),
        };
        let _ = std::fs::remove_file(&fixed);
        Err(failure)
    }

    fn delete_output(&self) -> Option<Advisory> {
        let path = &self.job.output_path;
        match std::fs::remove_file(path) {
            Ok(()) => {
                self.log(
                    Level::Info,
                    "output_deleted",
                    serde_json::json!({ "output_path": path.to_string_lossy() }),
                );
                None
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                let advisory = Advisory::OutputDeleteFailed {
                    path: path.to_string_lossy().to_string(),
                    reason: err.to_string(),
                };
                self.log(
                    Level::Warn,
                    "output_delete_failed",
                    serde_json::json!({ "advisory": advisory.to_string() }),
                );
                Some(advisory)
            }
        }
    }

    fn finish(
        &self,
        progress: RecordingSession,
        exit_code: Option<i32>,
        advisories: Vec<Advisory>,
        error: Option<String>,
    ) -> SessionOutcome {
        let output_bytes = std::fs::metadata(&self.job.output_path)
            .ok()
            .map(|m| m.len());
        self.log(
            if error.is_some() {
                Level::Error
            } else {
                Level::Info
            },
            "session_finished",
            serde_json::json!({
                "state": progress.state.as_str(),
                "exit_code": exit_code,
                "elapsed_seconds": progress.elapsed_seconds,
                "output_bytes": output_bytes,
                "advisories": advisories,
                "error": error,
            }),
        );
        SessionOutcome {
            session_id: self.id.clone(),
            state: progress.state,
            output_path: self.job.output_path.clone(),
            output_bytes,
            exit_code,
            progress,
            advisories,
            error,
        }
    }

    fn log(&self, level: Level, event: &str, data: serde_json::Value) {
        if let Some(log) = &self.log {
            log.emit(level, event, data);
        }
    }
}

/// ffmpeg treats `q` on stdin as a request to close the output cleanly.
fn request_graceful_exit(stdin: Option<ChildStdin>) {
    if let Some(mut stdin) = stdin {
        let _ = stdin.write_all(b"q\n");
        let _ = stdin.flush();
    }
}
