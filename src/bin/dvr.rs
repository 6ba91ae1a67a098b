use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use chrono::{Duration, Local, NaiveDateTime};
use dvr_engine::config::{self, RecorderSettings};
use dvr_engine::invocation::{self, CaptureJob, QualityProfile};
use dvr_engine::paths::AppPaths;
use dvr_engine::progress::{fmt_bytes, fmt_hms, SessionState};
use dvr_engine::scheduler::{self, Recurrence, SchedulerGateway};
use dvr_engine::session::{SessionEvent, SessionOutcome, SessionSupervisor};
use dvr_engine::{epg, logs, playlist, series, window};

#[derive(Debug, Default)]
struct Flags {
    base_dir: Option<PathBuf>,
    engine: Option<PathBuf>,
    url: Option<String>,
    m3u: Option<String>,
    channel: Option<String>,
    day: Option<String>,
    time: Option<String>,
    duration: Option<String>,
    out_dir: Option<PathBuf>,
    file: Option<String>,
    quality: Option<QualityProfile>,
    crash_safe: bool,
    no_start_buffer: bool,
    no_end_buffer: bool,
    weekly: bool,
    start_now: bool,
    group: bool,
    filter: Option<String>,
    show: Option<String>,
    epg: Option<String>,
    epg_file: Option<PathBuf>,
    epg_channel: Option<String>,
    positional: Vec<String>,
}

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let command = args[1].as_str();
    let flags = parse_flags(&args[2..])?;

    let base_dir = flags
        .base_dir
        .clone()
        .or_else(AppPaths::default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    let settings = config::load_settings(&paths).map_err(|e| e.to_string())?;

    match command {
        "record" => cmd_record(&paths, &settings, &flags),
        "schedule" => cmd_schedule(&paths, &settings, &flags),
        "series" => cmd_series(&paths, &settings, &flags),
        "list" => cmd_list(&paths, &flags),
        "show" => cmd_show(&paths, &settings, &flags),
        "group" => cmd_group(&paths, &flags),
        "cancel" => cmd_cancel(&paths, &flags),
        "channels" => cmd_channels(&settings, &flags),
        "prune-logs" => {
            let removed = logs::prune_logs(&paths).map_err(|e| e.to_string())?;
            println!("Removed {removed} stale session log(s).");
            Ok(())
        }
        other => Err(format!("unknown command: {other} (try --help)")),
    }
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut value = || -> Result<String, String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{arg} requires a value"))
        };
        match arg {
            "--base-dir" => flags.base_dir = Some(PathBuf::from(value()?)),
            "--engine" => flags.engine = Some(PathBuf::from(value()?)),
            "--url" => flags.url = Some(value()?),
            "--m3u" => flags.m3u = Some(value()?),
            "--channel" => flags.channel = Some(value()?),
            "--day" => flags.day = Some(value()?),
            "--time" => flags.time = Some(value()?),
            "--duration" => flags.duration = Some(value()?),
            "--out-dir" => flags.out_dir = Some(PathBuf::from(value()?)),
            "--file" => flags.file = Some(value()?),
            "--quality" => {
                let v = value()?;
                flags.quality = Some(
                    QualityProfile::from_label(&v)
                        .ok_or_else(|| format!("unknown quality: {v} (high, medium, low)"))?,
                );
            }
            "--filter" => flags.filter = Some(value()?),
            "--show" => flags.show = Some(value()?),
            "--epg" => flags.epg = Some(value()?),
            "--epg-file" => flags.epg_file = Some(PathBuf::from(value()?)),
            "--epg-channel" => flags.epg_channel = Some(value()?),
            "--crash-safe" => flags.crash_safe = true,
            "--no-start-buffer" => flags.no_start_buffer = true,
            "--no-end-buffer" => flags.no_end_buffer = true,
            "--weekly" => flags.weekly = true,
            "--start-now" => flags.start_now = true,
            "--group" => flags.group = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown arg: {other} (try --help)"));
            }
            other => flags.positional.push(other.to_string()),
        }
        i += 1;
    }
    Ok(flags)
}

fn engine_path(paths: &AppPaths, settings: &RecorderSettings, flags: &Flags) -> PathBuf {
    let override_path = flags.engine.as_deref().or(settings.engine_path.as_deref());
    paths.resolve_engine(override_path)
}

/// Stream URL and display name: `--url` directly, otherwise `--channel`
/// looked up in the playlist.
fn resolve_channel(settings: &RecorderSettings, flags: &Flags) -> Result<(String, String), String> {
    if let Some(url) = &flags.url {
        let name = flags.channel.clone().unwrap_or_else(|| "recording".to_string());
        return Ok((url.clone(), name));
    }
    let wanted = flags
        .channel
        .as_deref()
        .ok_or_else(|| "pass --url or --channel".to_string())?;
    let m3u_url = flags
        .m3u
        .clone()
        .or_else(|| Some(settings.m3u_url.clone()).filter(|u| !u.trim().is_empty()))
        .ok_or_else(|| "no playlist configured; pass --m3u".to_string())?;
    let text = playlist::fetch_text(&m3u_url).map_err(|e| e.to_string())?;
    let channels = playlist::parse_m3u(&text);
    let channel = playlist::best_channel(&channels, wanted)
        .ok_or_else(|| format!("no playlist channel matches {wanted:?}"))?;
    Ok((channel.url.clone(), channel.name.clone()))
}

fn buffers(settings: &RecorderSettings, flags: &Flags) -> (Option<u32>, Option<u32>) {
    let start = if flags.no_start_buffer {
        None
    } else {
        settings.start_buffer.minutes_if_enabled()
    };
    let end = if flags.no_end_buffer {
        None
    } else {
        settings.end_buffer.minutes_if_enabled()
    };
    (start, end)
}

fn build_job(
    paths: &AppPaths,
    settings: &RecorderSettings,
    flags: &Flags,
    source_url: String,
    channel_name: &str,
    window: &window::ResolvedWindow,
) -> CaptureJob {
    let out_dir = flags
        .out_dir
        .clone()
        .unwrap_or_else(|| settings.effective_out_dir(paths));
    let file_name = match &flags.file {
        Some(name) if !name.trim().is_empty() => invocation::ensure_mp4_extension(name),
        _ => invocation::auto_filename(channel_name, window.start_at),
    };
    CaptureJob::from_window(
        source_url,
        out_dir.join(file_name),
        window,
        flags.quality.unwrap_or(settings.quality),
        flags.crash_safe || settings.crash_safe,
    )
}

fn cmd_record(paths: &AppPaths, settings: &RecorderSettings, flags: &Flags) -> Result<(), String> {
    let (url, name) = resolve_channel(settings, flags)?;
    let now = Local::now().naive_local();
    let window = match &flags.time {
        Some(time) => {
            let (start_buf, end_buf) = buffers(settings, flags);
            let window = window::resolve(
                flags.day.as_deref().unwrap_or(""),
                time,
                flags.duration.as_deref().unwrap_or(""),
                start_buf,
                end_buf,
            )
            .map_err(|e| e.to_string())?;
            report_adjustment(&window);
            window
        }
        None => {
            let duration = window::parse_duration(flags.duration.as_deref().unwrap_or(""))
                .map_err(|e| e.to_string())?;
            window::ResolvedWindow {
                start_at: now,
                duration_seconds: duration,
                nominal_start: now,
                adjustment: None,
                buffer_trim: None,
            }
        }
    };
    let job = build_job(paths, settings, flags, url, &name, &window);
    run_interactive(paths, &engine_path(paths, settings, flags), job)
}

fn cmd_schedule(paths: &AppPaths, settings: &RecorderSettings, flags: &Flags) -> Result<(), String> {
    let (url, name) = resolve_channel(settings, flags)?;
    let time = flags
        .time
        .as_deref()
        .ok_or_else(|| "schedule requires --time".to_string())?;
    let (start_buf, end_buf) = buffers(settings, flags);
    let window = window::resolve(
        flags.day.as_deref().unwrap_or(""),
        time,
        flags.duration.as_deref().unwrap_or(""),
        start_buf,
        end_buf,
    )
    .map_err(|e| e.to_string())?;
    report_adjustment(&window);

    let job = build_job(paths, settings, flags, url, &name, &window);
    let engine = engine_path(paths, settings, flags);
    let gateway = SchedulerGateway::system(paths.clone());
    let file_name = job
        .output_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let task_name = scheduler::one_time_task_name(&file_name);
    let recurrence = if flags.weekly {
        Recurrence::weekly_from(job.start_at)
    } else {
        Recurrence::Once
    };
    let task = gateway
        .create(&job, recurrence, &task_name, &engine)
        .map_err(|e| e.to_string())?;

    println!(
        "{}.",
        if flags.weekly {
            "Scheduled weekly"
        } else {
            "Scheduled one-time"
        }
    );
    println!("Task: {}", task.name);
    println!("Time: {}  Date: {}", task.trigger_time, task.trigger_date);
    println!("Length: {}", fmt_hms(job.duration_seconds));
    println!("Output: {}", job.output_path.to_string_lossy());
    Ok(())
}

fn cmd_series(paths: &AppPaths, settings: &RecorderSettings, flags: &Flags) -> Result<(), String> {
    let show = flags
        .show
        .clone()
        .ok_or_else(|| "series requires --show".to_string())?;
    let (url, _) = resolve_channel(settings, flags)?;

    let xml = match (&flags.epg_file, &flags.epg) {
        (Some(file), _) => std::fs::read_to_string(file).map_err(|e| e.to_string())?,
        (None, Some(epg_url)) => playlist::fetch_text(epg_url).map_err(|e| e.to_string())?,
        (None, None) => return Err("series requires --epg or --epg-file".to_string()),
    };
    let (_, programmes) = epg::parse_xmltv(&xml);

    let now = Local::now().naive_local();
    let cutoff = now + Duration::days(i64::from(settings.series_days()));
    let airings: Vec<epg::Airing> = epg::search_airings(&programmes, &show, now, Some(cutoff))
        .into_iter()
        .filter(|a| match &flags.epg_channel {
            Some(id) => a.channel.eq_ignore_ascii_case(id),
            None => true,
        })
        .collect();
    if airings.is_empty() {
        return Err(format!("no upcoming airings match {show:?}"));
    }

    let mut series_settings = settings.clone();
    if let Some(quality) = flags.quality {
        series_settings.quality = quality;
    }
    series_settings.crash_safe |= flags.crash_safe;
    if flags.no_start_buffer {
        series_settings.start_buffer.enabled = false;
    }
    if flags.no_end_buffer {
        series_settings.end_buffer.enabled = false;
    }
    let request = series::SeriesRequest {
        show,
        channel_url: url,
        out_dir: flags
            .out_dir
            .clone()
            .unwrap_or_else(|| settings.effective_out_dir(paths)),
        settings: series_settings,
    };

    let gateway = SchedulerGateway::system(paths.clone());
    let report = series::subscribe(
        &gateway,
        &engine_path(paths, settings, flags),
        &request,
        &airings,
        now,
    );
    println!("{}", report.summary());
    for task in &report.scheduled {
        println!("  {}  {} {}", task.name, task.trigger_date, task.trigger_time);
    }
    for failure in &report.failures {
        println!("  FAILED {}: {}", failure.name, failure.error);
    }
    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(format!("{} task(s) could not be scheduled", report.failures.len()))
    }
}

fn cmd_list(paths: &AppPaths, flags: &Flags) -> Result<(), String> {
    let gateway = SchedulerGateway::system(paths.clone());
    let tasks = gateway
        .query_all(flags.filter.as_deref())
        .map_err(|e| e.to_string())?;
    if tasks.is_empty() {
        println!("No scheduled recordings.");
    }
    for task in tasks {
        println!(
            "{}    |    Next: {}    |    {}    |    {}",
            task.name, task.next_run, task.schedule, task.status
        );
    }
    Ok(())
}

fn single_name(flags: &Flags) -> Result<&str, String> {
    match flags.positional.as_slice() {
        [name] => Ok(name.as_str()),
        _ => Err("pass exactly one task name".to_string()),
    }
}

fn cmd_show(paths: &AppPaths, settings: &RecorderSettings, flags: &Flags) -> Result<(), String> {
    let name = single_name(flags)?;
    let gateway = SchedulerGateway::system(paths.clone());
    let detail = gateway.query_one(name).map_err(|e| e.to_string())?;
    println!("Task: {}", detail.name);
    println!("Stream: {}", playlist::redact_url_for_log(&detail.invocation.source_url));
    println!("Length: {}", fmt_hms(detail.invocation.duration_seconds));
    println!("Output: {}", detail.invocation.output_path);
    if let Some(quality) = detail.invocation.quality_profile {
        println!("Quality: {}", quality.label());
    }

    if !flags.start_now {
        return Ok(());
    }
    let job = detail.start_now_job(Local::now().naive_local());
    let engine = match &flags.engine {
        Some(_) => engine_path(paths, settings, flags),
        None => detail.engine_path(),
    };
    run_interactive(paths, &engine, job)
}

fn cmd_group(paths: &AppPaths, flags: &Flags) -> Result<(), String> {
    let name = single_name(flags)?;
    let gateway = SchedulerGateway::system(paths.clone());
    let tasks = gateway.query_all(None).map_err(|e| e.to_string())?;
    let group = series::group_of(name, &tasks).ok_or_else(|| format!("{name} is not part of a series"))?;
    println!("Series group: {}", group.show());
    println!("{}", "-".repeat(40));
    for task in &group.members {
        let suffix = series::occurrence_suffix(&group.key, &task.name).unwrap_or(&task.name);
        println!(
            "{suffix}    | Next: {} | {} | {}",
            task.next_run, task.schedule, task.status
        );
    }
    Ok(())
}

fn cmd_cancel(paths: &AppPaths, flags: &Flags) -> Result<(), String> {
    if flags.positional.is_empty() {
        return Err("pass one or more task names".to_string());
    }
    let gateway = SchedulerGateway::system(paths.clone());

    let mut names: Vec<String> = Vec::new();
    if flags.group {
        let tasks = gateway.query_all(None).map_err(|e| e.to_string())?;
        for name in &flags.positional {
            match series::group_of(name, &tasks) {
                Some(group) => names.extend(group.member_names()),
                None => names.push(name.clone()),
            }
        }
    } else {
        names.extend(flags.positional.iter().cloned());
    }
    names.sort();
    names.dedup();

    let report = gateway.delete_batch(&names);
    println!("{}", report.summary());
    if report.all_succeeded() {
        return Ok(());
    }
    for failure in report.failures.iter().take(8) {
        println!("- {} {}", failure.name, failure.error);
    }
    Err(format!("{} deletion(s) failed", report.failures.len()))
}

fn cmd_channels(settings: &RecorderSettings, flags: &Flags) -> Result<(), String> {
    let m3u_url = flags
        .m3u
        .clone()
        .or_else(|| Some(settings.m3u_url.clone()).filter(|u| !u.trim().is_empty()))
        .ok_or_else(|| "no playlist configured; pass --m3u".to_string())?;
    let text = playlist::fetch_text(&m3u_url).map_err(|e| e.to_string())?;
    let channels = playlist::parse_m3u(&text);
    let query = flags.positional.join(" ");
    for channel in playlist::search_channels(&channels, &query) {
        println!("{}    [{}]", channel.name, channel.group);
    }
    Ok(())
}

fn report_adjustment(window: &window::ResolvedWindow) {
    if let Some(adj) = &window.adjustment {
        println!(
            "The selected time was in the past. Moved to {}.",
            adj.moved_to.format("%Y-%m-%d %H:%M")
        );
    }
    if let Some(trim) = &window.buffer_trim {
        println!(
            "Start buffer would begin in the past; recording starts at {} instead.",
            trim.moved_to.format("%H:%M")
        );
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Waiting { remaining_seconds } => {
            println!("Armed. Starts in {}", fmt_hms(*remaining_seconds));
        }
        SessionEvent::Started { command_line, .. } => println!("> {command_line}"),
        SessionEvent::Progress(p) => {
            let kbps = p
                .bitrate_kbps
                .map(|v| format!("{v:.1}"))
                .unwrap_or_else(|| "-".to_string());
            let fps = p
                .fps
                .map(|v| format!("{v}"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "Recording… elapsed {}  |  remaining {}  |  {:.0}%  |  kbps: {kbps}  fps: {fps}",
                fmt_hms(p.elapsed_seconds),
                fmt_hms(p.remaining_seconds()),
                p.progress_percent()
            );
        }
        SessionEvent::Stopping(request) => println!("Stopping ({request:?})…"),
        SessionEvent::Finalizing => println!("Finalizing file…"),
        SessionEvent::Output(_) => {}
    }
}

/// Runs the session on a worker thread. Type `s` + Enter to stop and keep
/// the file, `a` + Enter to abort and delete it.
fn run_interactive(paths: &AppPaths, engine: &Path, job: CaptureJob) -> Result<(), String> {
    println!(
        "Recording {} at {} for {}",
        job.output_path.to_string_lossy(),
        job.start_at.format("%Y-%m-%d %H:%M"),
        fmt_hms(job.duration_seconds)
    );
    println!("Controls: s = stop & keep, a = abort & delete");

    let supervisor = SessionSupervisor::new(engine, job).with_session_log(paths);
    let control = supervisor.control();
    let (done_tx, done_rx) = mpsc::channel::<SessionOutcome>();
    let handle = supervisor
        .spawn(print_event, move |outcome| {
            let _ = done_tx.send(outcome);
        })
        .map_err(|e| e.to_string())?;

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "s" | "stop" => control.stop_and_finalize(),
                "a" | "abort" => control.abort_and_delete(),
                _ => {}
            }
        }
    });

    let outcome = done_rx
        .recv()
        .map_err(|_| "session worker ended without an outcome".to_string())?;
    let _ = handle.join();
    print_outcome(&outcome, Local::now().naive_local());

    match outcome.state {
        SessionState::Failed => Err(outcome.error.unwrap_or_else(|| "recording failed".to_string())),
        _ => Ok(()),
    }
}

fn print_outcome(outcome: &SessionOutcome, finished_at: NaiveDateTime) {
    println!(
        "Session {} finished at {}: {}",
        outcome.session_id,
        finished_at.format("%H:%M:%S"),
        outcome.state.as_str()
    );
    if let Some(bytes) = outcome.output_bytes {
        println!(
            "Saved: {}  ({})",
            outcome.output_path.to_string_lossy(),
            fmt_bytes(bytes)
        );
    }
    for advisory in &outcome.advisories {
        println!("warning: {advisory}");
    }
}

fn print_help() {
    println!(
        r#"dvr

Schedules and supervises IPTV recordings. Capture runs through ffmpeg; deferred
jobs are registered with the Windows task scheduler.

Usage:
  dvr record   --url <stream> [--day today|tomorrow|YYYY-MM-DD --time 20:00] [--duration 2h5m]
  dvr schedule (--url <stream> | --channel <name>) --time 8:00pm [--day ...] [--weekly]
  dvr series   --show <title> (--epg <url> | --epg-file <path>) (--url <stream> | --channel <name>)
  dvr list     [--filter <text>]
  dvr show     <task> [--start-now]
  dvr group    <task>
  dvr cancel   <task>... [--group]
  dvr channels [query] [--m3u <url>]
  dvr prune-logs

Options:
  --base-dir <path>     Override base dir (default: %LOCALAPPDATA%\DvrEngine on Windows)
  --engine <path>       ffmpeg binary (default: bundled tools\ffmpeg, then PATH)
  --m3u <url>           Playlist used to look up --channel
  --out-dir <path>      Recording directory
  --file <name>         Output file name (.mp4 added when missing)
  --quality <q>         high (copy), medium, low
  --crash-safe          Fragmented MP4 that stays playable if interrupted
  --no-start-buffer     Skip the configured start buffer
  --no-end-buffer       Skip the configured end buffer
  --epg-channel <id>    Only airings on this guide channel id
"#
    );
}
