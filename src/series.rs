//! Series membership is encoded in task names; groups are recomputed from
//! every listing rather than stored.

use crate::config::RecorderSettings;
use crate::epg::Airing;
use crate::invocation::{self, CaptureJob};
use crate::scheduler::{
    self, Recurrence, ScheduledTask, SchedulerGateway, TaskCommandRunner, TaskFailure, TaskRef,
    SERIES_PREFIX,
};
use crate::window;
use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn series_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(IPTV_DVR_SERIES_.+?)_\d{8}_\d{4,6}$").unwrap())
}

pub fn group_key(task_name: &str) -> Option<String> {
    series_re()
        .captures(task_name)
        .map(|caps| caps[1].to_string())
}

/// Every task named `key_<suffix>`, sorted by name.
pub fn members<'a>(key: &str, tasks: &'a [ScheduledTask]) -> Vec<&'a ScheduledTask> {
    let mut out: Vec<&ScheduledTask> = tasks
        .iter()
        .filter(|t| {
            t.name
                .strip_prefix(key)
                .is_some_and(|rest| rest.starts_with('_'))
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesGroup {
    pub key: String,
    pub members: Vec<ScheduledTask>,
}

impl SeriesGroup {
    /// The show tag with the system prefix removed.
    pub fn show(&self) -> &str {
        self.key.strip_prefix(SERIES_PREFIX).unwrap_or(&self.key)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|t| t.name.clone()).collect()
    }
}

/// The `YYYYMMDD_HHMM[SS]` part of a member name.
pub fn occurrence_suffix<'a>(key: &str, task_name: &'a str) -> Option<&'a str> {
    task_name.strip_prefix(key)?.strip_prefix('_')
}

pub fn group_of(task_name: &str, tasks: &[ScheduledTask]) -> Option<SeriesGroup> {
    let key = group_key(task_name)?;
    let members: Vec<ScheduledTask> = members(&key, tasks).into_iter().cloned().collect();
    Some(SeriesGroup { key, members })
}

pub fn groups(tasks: &[ScheduledTask]) -> Vec<SeriesGroup> {
    let mut by_key: BTreeMap<String, Vec<ScheduledTask>> = BTreeMap::new();
    for task in tasks {
        if let Some(key) = group_key(&task.name) {
            by_key.entry(key).or_default().push(task.clone());
        }
    }
    by_key
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| a.name.cmp(&b.name));
            SeriesGroup { key, members }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub show: String,
    pub channel_url: String,
    pub out_dir: PathBuf,
    pub settings: RecorderSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRecording {
    pub task_name: String,
    pub job: CaptureJob,
}

/// One buffered job per future airing inside the lookahead window.
/// Airings sharing a start minute collapse into one.
pub fn plan(request: &SeriesRequest, airings: &[Airing], now: NaiveDateTime) -> Vec<PlannedRecording> {
    let horizon = now + Duration::days(i64::from(request.settings.series_days()));
    let start_buffer = request.settings.start_buffer.minutes_if_enabled();
    let end_buffer = request.settings.end_buffer.minutes_if_enabled();

    let mut planned: BTreeMap<String, PlannedRecording> = BTreeMap::new();
    for airing in airings {
        if airing.start <= now || airing.start > horizon {
            continue;
        }
        let task_name = scheduler::series_task_name(&request.show, airing.start);
        if planned.contains_key(&task_name) {
            continue;
        }
        let (start_at, duration_seconds) = window::apply_buffers(
            airing.start,
            airing.duration_seconds().max(60),
            start_buffer,
            end_buffer,
        );
        let (start_at, duration_seconds, _) =
            window::clamp_to_future(start_at, duration_seconds, now);
        let file_name = invocation::auto_filename(&request.show, airing.start);
        let job = CaptureJob {
            source_url: request.channel_url.clone(),
            output_path: request.out_dir.join(file_name),
            start_at,
            duration_seconds,
            quality_profile: request.settings.quality,
            crash_safe: request.settings.crash_safe,
        };
        planned.insert(task_name.clone(), PlannedRecording { task_name, job });
    }
    planned.into_values().collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscribeReport {
    pub scheduled: Vec<TaskRef>,
    pub failures: Vec<TaskFailure>,
}

impl SubscribeReport {
    pub fn summary(&self) -> String {
        let mut msg = format!("Scheduled {} recording(s).", self.scheduled.len());
        if !self.failures.is_empty() {
            msg.push_str(&format!(" {} failed.", self.failures.len()));
        }
        msg
    }
}

/// Registers every planned airing as a one-time task; each failure is
/// reported and the rest still go ahead.
pub fn subscribe<R: TaskCommandRunner>(
    gateway: &SchedulerGateway<R>,
    engine_path: &Path,
    request: &SeriesRequest,
    airings: &[Airing],
    now: NaiveDateTime,
) -> SubscribeReport {
    let mut report = SubscribeReport::default();
    for item in plan(request, airings, now) {
        match gateway.create(&item.job, Recurrence::Once, &item.task_name, engine_path) {
            Ok(task) => report.scheduled.push(task),
            Err(err) => report.failures.push(TaskFailure {
                name: item.task_name,
                error: err.to_string(),
            }),
        }
    }
    report
}
