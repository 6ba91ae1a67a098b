//! M3U playlists, fuzzy channel lookup, and the HTTP fetch both the
//! playlist and the guide go through.

use crate::invocation::CLIENT_USER_AGENT;
use crate::{DvrError, Result};
use regex::Regex;
use serde::Serialize;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

const FETCH_TIMEOUT_SECS: u64 = 60;
const MAX_FETCH_BYTES: u64 = 256 * 1024 * 1024;
pub const MAX_CHANNEL_RESULTS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub name: String,
    pub tvg_id: String,
    pub group: String,
    pub url: String,
    /// The raw `#EXTINF` line.
    pub ext: String,
}

pub fn parse_m3u(text: &str) -> Vec<Channel> {
    static TVG_ID_RE: OnceLock<Regex> = OnceLock::new();
    static GROUP_RE: OnceLock<Regex> = OnceLock::new();
    let tvg_id_re = TVG_ID_RE.get_or_init(|| Regex::new(r#"tvg-id="([^"]+)""#).unwrap());
    let group_re = GROUP_RE.get_or_init(|| Regex::new(r#"group-title="([^"]+)""#).unwrap());

    let mut out = Vec::new();
    let mut pending: Option<&str> = None;
    for line in text.lines().map(str::trim) {
        if line.starts_with("#EXTINF") {
            pending = Some(line);
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(ext) = pending.take() else {
            continue;
        };
        let name = match ext.split_once(',') {
            Some((_, name)) => name.trim(),
            None => ext,
        };
        let capture = |re: &Regex| {
            re.captures(ext)
                .map(|c| c[1].to_string())
                .unwrap_or_default()
        };
        out.push(Channel {
            name: name.to_string(),
            tvg_id: capture(tvg_id_re),
            group: capture(group_re),
            url: line.to_string(),
            ext: ext.to_string(),
        });
    }
    out
}

/// +40 when the whole query occurs, +10 per query token that occurs.
pub fn token_score(haystack: &str, query: &str) -> u32 {
    let hay = haystack.to_lowercase();
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return 0;
    }
    let mut score = 0;
    if hay.contains(&query) {
        score += 40;
    }
    for token in query.split_whitespace() {
        if hay.contains(token) {
            score += 10;
        }
    }
    score
}

fn normalize(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Channels matching `query` anywhere in their metadata, best first.
pub fn search_channels<'a>(channels: &'a [Channel], query: &str) -> Vec<&'a Channel> {
    if query.trim().is_empty() {
        return channels.iter().take(MAX_CHANNEL_RESULTS).collect();
    }
    let mut scored: Vec<(u32, &Channel)> = channels
        .iter()
        .map(|c| {
            let hay = format!("{} {} {} {}", c.name, c.tvg_id, c.group, c.ext);
            (token_score(&hay, query), c)
        })
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(MAX_CHANNEL_RESULTS)
        .map(|(_, c)| c)
        .collect()
}

/// The playlist entry for a guide channel name. Exact name beats
/// normalized name beats normalized tvg-id; ties keep playlist order.
pub fn best_channel<'a>(channels: &'a [Channel], name: &str) -> Option<&'a Channel> {
    let wanted = normalize(name);
    let mut best: Option<(u32, &Channel)> = None;
    for channel in channels {
        let mut score = token_score(&channel.name, name);
        if channel.name == name {
            score += 100;
        } else if normalize(&channel.name) == wanted {
            score += 70;
        } else if !channel.tvg_id.is_empty() && normalize(&channel.tvg_id) == wanted {
            score += 50;
        }
        if score > 0 && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, channel));
        }
    }
    best.map(|(_, c)| c)
}

/// `scheme://host/...`; provider URLs carry credentials in path and query.
pub fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(url) => format!("{}://{}/...", url.scheme(), url.host_str().unwrap_or("unknown-host")),
        Err(_) => "[invalid-url]".to_string(),
    }
}

/// GETs `url` as text, presenting the player user agent. The response
/// charset is honored for Latin-1; everything else decodes as UTF-8.
pub fn fetch_text(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim())
        .map_err(|_| DvrError::Http(format!("invalid URL: {}", redact_url_for_log(url))))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DvrError::Http(format!(
            "unsupported URL scheme for {}; only http/https are allowed",
            redact_url_for_log(url)
        )));
    }

    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(FETCH_TIMEOUT_SECS)))
        .user_agent(CLIENT_USER_AGENT);
    let agent: ureq::Agent = config.build().into();

    let mut response = agent.get(parsed.as_str()).call().map_err(|err| {
        DvrError::Http(format!("request failed for {}: {err}", redact_url_for_log(url)))
    })?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(DvrError::Http(format!(
            "http {status} for {}",
            redact_url_for_log(url)
        )));
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mut bytes = Vec::new();
    response
        .body_mut()
        .as_reader()
        .take(MAX_FETCH_BYTES)
        .read_to_end(&mut bytes)?;
    Ok(decode_body(&bytes, &content_type))
}

fn decode_body(bytes: &[u8], content_type: &str) -> String {
    static CHARSET_RE: OnceLock<Regex> = OnceLock::new();
    let re = CHARSET_RE.get_or_init(|| Regex::new(r"(?i)charset=([\w\-]+)").unwrap());
    let charset = re
        .captures(content_type)
        .map(|c| c[1].to_ascii_lowercase())
        .unwrap_or_default();
    match charset.as_str() {
        "iso-8859-1" | "latin1" | "latin-1" => bytes.iter().map(|b| char::from(*b)).collect(),
        _ => String::from_utf8_lossy(bytes)
            .trim_start_matches('\u{feff}')
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = "#EXTM3U\n\
#EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",US: CNN HD\n\
http://iptv.example/live/u/p/1.ts\n\
#EXTINF:-1 tvg-id=\"bbc1.uk\" group-title=\"UK\",BBC One\n\
\n\
#EXTVLCOPT:http-user-agent=VLC\n\
http://iptv.example/live/u/p/2.ts\n\
http://iptv.example/orphan.ts\n\
#EXTINF:-1,Plain Channel\n\
http://iptv.example/live/u/p/3.ts\n";

    #[test]
    fn parses_entries_and_attributes() {
        let channels = parse_m3u(PLAYLIST);
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].name, "US: CNN HD");
        assert_eq!(channels[0].tvg_id, "cnn.us");
        assert_eq!(channels[0].group, "News");
        assert_eq!(channels[0].url, "http://iptv.example/live/u/p/1.ts");
        assert_eq!(channels[1].name, "BBC One");
        assert_eq!(channels[1].url, "http://iptv.example/live/u/p/2.ts");
        assert_eq!(channels[2].name, "Plain Channel");
        assert_eq!(channels[2].tvg_id, "");
    }

    #[test]
    fn token_scoring() {
        assert_eq!(token_score("US: CNN HD", "cnn hd"), 40 + 10 + 10);
        assert_eq!(token_score("US: CNN HD", "hd cnn"), 20);
        assert_eq!(token_score("BBC One", "cnn"), 0);
        assert_eq!(token_score("anything", "  "), 0);
    }

    #[test]
    fn best_channel_prefers_exact_then_normalized_then_tvg_id() {
        let channels = parse_m3u(PLAYLIST);
        assert_eq!(
            best_channel(&channels, "BBC One").map(|c| c.url.as_str()),
            Some("http://iptv.example/live/u/p/2.ts")
        );
        assert_eq!(
            best_channel(&channels, "us cnn hd").map(|c| c.name.as_str()),
            Some("US: CNN HD")
        );
        assert_eq!(
            best_channel(&channels, "CNN.US").map(|c| c.name.as_str()),
            Some("US: CNN HD")
        );
        assert!(best_channel(&channels, "Weather Nation").is_none());
    }

    #[test]
    fn search_ranks_by_score() {
        let channels = parse_m3u(PLAYLIST);
        let hits = search_channels(&channels, "news cnn");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "US: CNN HD");
        assert_eq!(search_channels(&channels, "").len(), 3);
    }

    #[test]
    fn redacts_credentials_from_urls() {
        assert_eq!(
            redact_url_for_log("http://iptv.example:8080/get.php?username=u&password=p"),
            "http://iptv.example/..."
        );
        assert_eq!(redact_url_for_log("not a url"), "[invalid-url]");
    }

    #[test]
    fn fetch_rejects_non_http_schemes() {
        assert!(matches!(
            fetch_text("file:///etc/passwd"),
            Err(DvrError::Http(_))
        ));
    }

    #[test]
    fn decodes_latin1_when_declared() {
        assert_eq!(decode_body(b"Caf\xe9", "text/plain; charset=ISO-8859-1"), "Café");
        assert_eq!(decode_body("Café".as_bytes(), "application/x-mpegurl"), "Café");
    }
}
