//! XMLTV programme guide: timestamp handling and airing search.

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const MAX_SEARCH_RESULTS: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpgChannel {
    pub id: String,
    pub names: Vec<String>,
}

impl EpgChannel {
    pub fn display_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.id)
    }
}

/// A guide entry as published; `start`/`stop` keep the raw XMLTV stamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Programme {
    pub channel: String,
    pub start: String,
    pub stop: String,
    pub title: String,
    pub desc: String,
}

/// A programme resolved to local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Airing {
    pub channel: String,
    pub title: String,
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
}

impl Airing {
    pub fn duration_seconds(&self) -> u64 {
        (self.stop - self.start).num_seconds().max(0) as u64
    }
}

/// `20240101200000 +0100` → the UTC instant, without zone.
pub fn parse_xmltv_time_utc(raw: &str) -> Option<NaiveDateTime> {
    static TS_RE: OnceLock<Regex> = OnceLock::new();
    let re = TS_RE.get_or_init(|| {
        Regex::new(r"^(\d{4})(\d{2})(\d{2})(\d{2})(\d{2})(\d{2})([+\-]\d{4}|Z)?").unwrap()
    });

    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let caps = re.captures(&compact)?;
    let field = |i: usize| caps[i].parse::<u32>().ok();
    let year = caps[1].parse::<i32>().ok()?;
    let base = NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)?
        .and_hms_opt(field(4)?, field(5)?, field(6)?)?;

    match caps.get(7).map(|m| m.as_str()) {
        Some(tz) if !tz.eq_ignore_ascii_case("z") => {
            let sign = if tz.starts_with('-') { -1 } else { 1 };
            let hours: i64 = tz[1..3].parse().ok()?;
            let minutes: i64 = tz[3..5].parse().ok()?;
            Some(base - Duration::minutes(sign * (hours * 60 + minutes)))
        }
        _ => Some(base),
    }
}

/// XMLTV stamp in this machine's local wall-clock time.
pub fn parse_xmltv_time(raw: &str) -> Option<NaiveDateTime> {
    let utc = parse_xmltv_time_utc(raw)?;
    Some(Local.from_utc_datetime(&utc).naive_local())
}

/// Reads `<channel>` and `<programme>` elements out of an XMLTV document.
/// Anything else is ignored.
pub fn parse_xmltv(xml: &str) -> (Vec<EpgChannel>, Vec<Programme>) {
    static CHANNEL_RE: OnceLock<Regex> = OnceLock::new();
    static DISPLAY_RE: OnceLock<Regex> = OnceLock::new();
    static PROGRAMME_RE: OnceLock<Regex> = OnceLock::new();
    let channel_re = CHANNEL_RE
        .get_or_init(|| Regex::new(r"(?s)<channel\b([^>]*)>(.*?)</channel>").unwrap());
    let display_re = DISPLAY_RE
        .get_or_init(|| Regex::new(r"(?s)<display-name\b[^>]*>(.*?)</display-name>").unwrap());
    let programme_re = PROGRAMME_RE
        .get_or_init(|| Regex::new(r"(?s)<programme\b([^>]*)>(.*?)</programme>").unwrap());

    let channels = channel_re
        .captures_iter(xml)
        .map(|caps| EpgChannel {
            id: attributes(&caps[1]).remove("id").unwrap_or_default(),
            names: display_re
                .captures_iter(&caps[2])
                .map(|c| unescape(c[1].trim()))
                .filter(|n| !n.is_empty())
                .collect(),
        })
        .collect();

    let programmes = programme_re
        .captures_iter(xml)
        .map(|caps| {
            let mut attrs = attributes(&caps[1]);
            let mut take = |name: &str| attrs.remove(name).unwrap_or_default();
            Programme {
                channel: take("channel"),
                start: take("start"),
                stop: take("stop"),
                title: child_text(title_re(), &caps[2]),
                desc: child_text(desc_re(), &caps[2]),
            }
        })
        .collect();

    (channels, programmes)
}

/// `name="value"` (or single-quoted) pairs of one start tag, unescaped.
fn attributes(attrs: &str) -> HashMap<String, String> {
    static ATTR_RE: OnceLock<Regex> = OnceLock::new();
    let re = ATTR_RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w.\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
    });
    re.captures_iter(attrs)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_string(), unescape(value))
        })
        .collect()
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<title\b[^>]*>(.*?)</title>").unwrap())
}

fn desc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<desc\b[^>]*>(.*?)</desc>").unwrap())
}

fn child_text(re: &Regex, body: &str) -> String {
    re.captures(body)
        .map(|c| unescape(c[1].trim()))
        .unwrap_or_default()
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Airings whose title plus description contains every query token,
/// that have not ended by `now`, and that start no later than `cutoff`.
pub fn search_airings(
    programmes: &[Programme],
    query: &str,
    now: NaiveDateTime,
    cutoff: Option<NaiveDateTime>,
) -> Vec<Airing> {
    let tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();

    let mut out = Vec::new();
    for p in programmes {
        let hay = format!("{} {}", p.title, p.desc).to_lowercase();
        if !tokens.iter().all(|t| hay.contains(t.as_str())) {
            continue;
        }
        let (Some(start), Some(stop)) = (parse_xmltv_time(&p.start), parse_xmltv_time(&p.stop))
        else {
            continue;
        };
        if stop <= now {
            continue;
        }
        if cutoff.is_some_and(|c| start > c) {
            continue;
        }
        out.push(Airing {
            channel: p.channel.clone(),
            title: p.title.clone(),
            start,
            stop,
        });
        if out.len() >= MAX_SEARCH_RESULTS {
            break;
        }
    }
    out.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.channel.cmp(&b.channel))
            .then_with(|| a.title.cmp(&b.title))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("datetime")
    }

    fn programme(title: &str, start: &str, stop: &str) -> Programme {
        Programme {
            channel: "cnn.us".to_string(),
            start: start.to_string(),
            stop: stop.to_string(),
            title: title.to_string(),
            desc: "Nightly roundup".to_string(),
        }
    }

    #[test]
    fn xmltv_offsets_normalize_to_utc() {
        assert_eq!(
            parse_xmltv_time_utc("20240101200000 +0100"),
            Some(dt("2024-01-01 19:00:00"))
        );
        assert_eq!(
            parse_xmltv_time_utc("20240101200000 -0530"),
            Some(dt("2024-01-02 01:30:00"))
        );
        assert_eq!(
            parse_xmltv_time_utc("20240101200000Z"),
            Some(dt("2024-01-01 20:00:00"))
        );
        assert_eq!(
            parse_xmltv_time_utc("20240101200000"),
            Some(dt("2024-01-01 20:00:00"))
        );
        assert_eq!(parse_xmltv_time_utc("2024-01-01"), None);
        assert_eq!(parse_xmltv_time_utc("20241301200000"), None);
    }

    #[test]
    fn local_conversion_follows_the_machine_zone() {
        let utc = dt("2024-06-01 12:00:00");
        assert_eq!(
            parse_xmltv_time("20240601120000 +0000"),
            Some(Local.from_utc_datetime(&utc).naive_local())
        );
    }

    #[test]
    fn search_requires_every_token_and_skips_ended_airings() {
        let progs = vec![
            programme("Evening News", "20240102200000 +0000", "20240102210000 +0000"),
            programme("Evening News", "20240101200000 +0000", "20240101210000 +0000"),
            programme("Morning Show", "20240102080000 +0000", "20240102090000 +0000"),
            programme("Evening News", "20240110200000 +0000", "20240110210000 +0000"),
        ];
        let now = parse_xmltv_time("20240101213000 +0000").expect("now");
        let cutoff = parse_xmltv_time("20240105000000 +0000");

        let hits = search_airings(&progs, "evening NEWS", now, cutoff);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, parse_xmltv_time("20240102200000 +0000").expect("start"));
        assert_eq!(hits[0].duration_seconds(), 3600);

        // The description counts toward the match.
        let all = search_airings(&progs, "roundup", now, None);
        let titles: Vec<&str> = all.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Morning Show", "Evening News", "Evening News"]);
        assert!(all[1].start < all[2].start);
        assert!(search_airings(&progs, "evening weather", now, None).is_empty());
    }

    #[test]
    fn search_caps_result_count() {
        let progs: Vec<Programme> = (0..500)
            .map(|_| programme("Loop", "20300101000000 +0000", "20300101010000 +0000"))
            .collect();
        let now = dt("2024-01-01 00:00:00");
        assert_eq!(search_airings(&progs, "loop", now, None).len(), MAX_SEARCH_RESULTS);
    }

    #[test]
    fn parses_channels_and_programmes() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="cnn.us"><display-name>CNN</display-name><display-name>CNN HD</display-name></channel>
  <programme start="20240101200000 +0000" stop="20240101210000 +0000" channel="cnn.us">
    <title lang="en">News &amp; Views</title>
    <desc lang="en">Daily roundup</desc>
  </programme>
  <programme start="20240101210000 +0000" stop="20240101220000 +0000" channel="cnn.us">
    <title>Late Show</title>
  </programme>
</tv>"#;
        let (channels, programmes) = parse_xmltv(xml);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "cnn.us");
        assert_eq!(channels[0].display_name(), "CNN");
        assert_eq!(programmes.len(), 2);
        assert_eq!(programmes[0].title, "News & Views");
        assert_eq!(programmes[0].desc, "Daily roundup");
        assert_eq!(programmes[0].start, "20240101200000 +0000");
        assert_eq!(programmes[1].desc, "");
    }

    #[test]
    fn large_guides_parse_quickly() {
        let mut xml = String::from("<tv>\n<channel id='bulk.tv'><display-name>Bulk</display-name></channel>\n");
        for i in 0..5_000u32 {
            xml.push_str(&format!(
                "<programme start=\"20300101{:02}0000 +0000\" stop='20300101{:02}3000 +0000' channel=\"bulk.tv\">\
<title>Show {i}</title><desc>Episode {i}</desc></programme>\n",
                i % 24,
                i % 24
            ));
        }
        xml.push_str("</tv>");

        let started = std::time::Instant::now();
        let (channels, programmes) = parse_xmltv(&xml);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "parse took {:?}",
            started.elapsed()
        );
        assert_eq!(channels[0].id, "bulk.tv");
        assert_eq!(programmes.len(), 5_000);
        assert_eq!(programmes[4_999].title, "Show 4999");
        assert_eq!(programmes[4_999].desc, "Episode 4999");
        assert_eq!(programmes[25].start, "20300101010000 +0000");
        assert_eq!(programmes[25].stop, "20300101013000 +0000");
        assert_eq!(programmes[25].channel, "bulk.tv");
    }
}
