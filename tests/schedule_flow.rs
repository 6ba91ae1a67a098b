use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;

use dvr_engine::cmd::CommandRunError;
use dvr_engine::config::RecorderSettings;
use dvr_engine::epg;
use dvr_engine::invocation::{CaptureJob, QualityProfile};
use dvr_engine::paths::AppPaths;
use dvr_engine::scheduler::{self, SchedulerGateway, TaskCommandRunner};
use dvr_engine::series::{self, SeriesRequest};
use dvr_engine::window;

const ENGINE: &str = "C:/FFmpeg/bin/ffmpeg.exe";
const STREAM: &str = "http://iptv.example/live/user/pass/7.ts";

#[cfg(unix)]
fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code as u32)
}

fn output(code: i32, stdout: &str, stderr: &str) -> Output {
    Output {
        status: exit_status(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// In-memory task store speaking the scheduler's command-line dialect.
/// Deleting a name in `locked` fails the way an access-denied task does.
#[derive(Default)]
struct MemoryScheduler {
    tasks: Mutex<BTreeMap<String, String>>,
    locked: Vec<String>,
}

impl MemoryScheduler {
    fn value_after(args: &[String], flag: &str) -> String {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
            .unwrap_or_default()
    }

    fn listing(&self) -> String {
        let tasks = self.tasks.lock().expect("tasks lock");
        let mut csv = String::from(
            "\"HostName\",\"TaskName\",\"Next Run Time\",\"Status\",\"Schedule Type\"\r\n",
        );
        csv.push_str("\"PC\",\"\\Microsoft\\Windows\\Defrag\",\"N/A\",\"Ready\",\"Weekly\"\r\n");
        for name in tasks.keys() {
            csv.push_str(&format!(
                "\"PC\",\"\\{name}\",\"1/1/2030 8:00:00 PM\",\"Ready\",\"One Time Only\"\r\n"
            ));
        }
        csv
    }
}

impl TaskCommandRunner for MemoryScheduler {
    fn run(&self, args: &[String], _timeout: Duration) -> Result<Output, CommandRunError> {
        let verb = args.first().map(String::as_str).unwrap_or_default();
        let name = Self::value_after(args, "/TN");
        let out = match verb {
            "/Create" => {
                let action = Self::value_after(args, "/TR").trim_matches('"').to_string();
                self.tasks
                    .lock()
                    .expect("tasks lock")
                    .insert(name, action);
                output(0, "SUCCESS: The scheduled task has been created.", "")
            }
            "/Query" if args.iter().any(|a| a == "/XML") => {
                match self.tasks.lock().expect("tasks lock").get(&name) {
                    Some(action) => output(
                        0,
                        &format!("<Task><Actions><Exec><Command>{action}</Command></Exec></Actions></Task>"),
                        "",
                    ),
                    None => output(1, "", "ERROR: The system cannot find the file specified."),
                }
            }
            "/Query" => output(0, &self.listing(), ""),
            "/Delete" if self.locked.contains(&name) => {
                output(1, "", "ERROR: Access is denied.")
            }
            "/Delete" => match self.tasks.lock().expect("tasks lock").remove(&name) {
                Some(_) => output(0, "SUCCESS", ""),
                None => output(1, "", "ERROR: The system cannot find the file specified."),
            },
            _ => output(2, "", "ERROR: Invalid argument/option"),
        };
        Ok(out)
    }
}

const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="news.example"><display-name>Example News</display-name></channel>
  <programme start="20300101200000 +0000" stop="20300101203000 +0000" channel="news.example">
    <title>Evening Roundup</title>
  </programme>
  <programme start="20300102200000 +0000" stop="20300102203000 +0000" channel="news.example">
    <title>Evening Roundup</title>
    <desc>Late edition &amp; weather</desc>
  </programme>
  <programme start="20300102210000 +0000" stop="20300102220000 +0000" channel="news.example">
    <title>Film Night</title>
  </programme>
</tv>"#;

fn stamp(raw: &str) -> chrono::NaiveDateTime {
    epg::parse_xmltv_time(raw).expect("xmltv time")
}

#[test]
fn schedule_list_group_and_cancel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let runner = MemoryScheduler {
        locked: Vec::new(),
        ..Default::default()
    };
    let gateway = SchedulerGateway::new(runner, paths.clone());
    let engine = Path::new(ENGINE);
    let out_dir = PathBuf::from("D:/DVR");

    // One-off recording.
    let now = stamp("20300101120000 +0000");
    let resolved =
        window::resolve_at(now, "", "23:30", "45m", Some(5), Some(2)).expect("resolve");
    let job = CaptureJob::from_window(
        STREAM,
        out_dir.join("Late_Movie.mp4"),
        &resolved,
        QualityProfile::TranscodeMedium,
        true,
    );
    let one_off = gateway.create_one_time(&job, engine).expect("create one-time");
    assert_eq!(one_off.name, "IPTV_DVR_Late_Movie_mp4");
    assert!(one_off.wrapper_path.is_file());

    // Series from the guide.
    let (channels, programmes) = epg::parse_xmltv(GUIDE);
    assert_eq!(channels[0].display_name(), "Example News");
    let airings = epg::search_airings(&programmes, "evening roundup", now, None);
    assert_eq!(airings.len(), 2);

    let request = SeriesRequest {
        show: "Evening Roundup".to_string(),
        channel_url: STREAM.to_string(),
        out_dir: out_dir.clone(),
        settings: RecorderSettings::default(),
    };
    let report = series::subscribe(&gateway, engine, &request, &airings, now);
    assert_eq!(report.scheduled.len(), 2);
    assert!(report.failures.is_empty());
    assert_eq!(report.summary(), "Scheduled 2 recording(s).");

    let expected_first = scheduler::series_task_name("Evening Roundup", airings[0].start);
    let expected_second = scheduler::series_task_name("Evening Roundup", airings[1].start);

    // Listing shows only our tasks, sorted.
    let tasks = gateway.query_all(None).expect("query all");
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "IPTV_DVR_Late_Movie_mp4",
            expected_first.as_str(),
            expected_second.as_str()
        ]
    );
    let filtered = gateway.query_all(Some("late_movie")).expect("filtered");
    assert_eq!(filtered.len(), 1);

    // Details come back out of the wrapper script.
    let detail = gateway.query_one(&one_off.name).expect("query one");
    assert_eq!(detail.invocation.source_url, STREAM);
    assert_eq!(detail.invocation.duration_seconds, job.duration_seconds);
    assert_eq!(
        detail.invocation.quality_profile,
        Some(QualityProfile::TranscodeMedium)
    );
    assert!(detail.invocation.crash_safe);
    assert_eq!(detail.engine_path(), PathBuf::from(ENGINE));

    // Grouping.
    let groups = series::groups(&tasks);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].show(), "Evening_Roundup");
    let group = series::group_of(&expected_second, &tasks).expect("group");
    assert_eq!(
        group.member_names(),
        vec![expected_first.clone(), expected_second.clone()]
    );
    assert!(series::group_of(&one_off.name, &tasks).is_none());

    // Cancel the whole group.
    let report = gateway.delete_batch(&group.member_names());
    assert!(report.all_succeeded());
    let remaining = gateway.query_all(None).expect("query after delete");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, one_off.name);
    assert!(!paths.task_wrapper_path(&expected_first).exists());
}

#[test]
fn batch_cancel_reports_partial_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let runner = MemoryScheduler {
        locked: vec!["IPTV_DVR_b_mp4".to_string()],
        ..Default::default()
    };
    let gateway = SchedulerGateway::new(runner, paths);
    let now = stamp("20300101120000 +0000");
    let resolved = window::resolve_at(now, "", "22:00", "1h", None, None).expect("resolve");
    for file in ["a.mp4", "b.mp4", "c.mp4"] {
        let job = CaptureJob::from_window(
            STREAM,
            PathBuf::from("D:/DVR").join(file),
            &resolved,
            QualityProfile::Copy,
            false,
        );
        gateway
            .create_one_time(&job, Path::new(ENGINE))
            .expect("create");
    }

    let names: Vec<String> = gateway
        .query_all(None)
        .expect("query all")
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names.len(), 3);

    let report = gateway.delete_batch(&names);
    assert!(!report.all_succeeded());
    assert_eq!(report.successes.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "IPTV_DVR_b_mp4");
    assert!(report.failures[0].error.contains("Access is denied"));
    assert_eq!(report.summary(), "Deleted 2 task(s). 1 failed.");

    let left = gateway.query_all(None).expect("query after delete");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].name, "IPTV_DVR_b_mp4");
}
