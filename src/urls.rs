#![forbid(unsafe_code)]

//! Canonicalizes and allow-lists incoming video URLs.
//!
//! This is the primary abuse boundary: anything returned from
//! [`normalize_url`] may end up verbatim in a yt-dlp argument list, so
//! rejection happens here, before a job record or subprocess exists.

use crate::error::FetchError;
use url::Url;

/// Source platforms the backend accepts, by exact hostname.
const ALLOWED_HOSTS: &[&str] = &[
    "www.youtube.com",
    "youtube.com",
    "m.youtube.com",
    "youtu.be",
    "www.instagram.com",
    "instagram.com",
    "www.facebook.com",
    "facebook.com",
    "fb.watch",
];

/// Query parameters that only carry tracking state and destabilize the
/// downstream tooling's view of the same video.
const TRACKING_PARAMS: &[&str] = &["si", "feature", "fbclid", "igsh"];

/// Parses, allow-lists, and canonicalizes a raw URL string.
///
/// Short-link shapes are rewritten to their canonical watch form so every
/// downstream component sees a stable input:
/// `youtu.be/<id>` and `youtube.com/shorts/<id>` both become
/// `https://www.youtube.com/watch?v=<id>`.
pub fn normalize_url(raw: &str) -> Result<String, FetchError> {
    let trimmed = raw.trim();
    let mut parsed =
        Url::parse(trimmed).map_err(|err| FetchError::InvalidUrl(format!("{trimmed}: {err}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .ok_or_else(|| FetchError::InvalidUrl(format!("{trimmed}: missing host")))?;

    if !ALLOWED_HOSTS.contains(&host.as_str()) {
        return Err(FetchError::InvalidUrl(format!("host not allowed: {host}")));
    }

    if host == "youtu.be" {
        let id = first_path_segment(&parsed)
            .ok_or_else(|| FetchError::InvalidUrl("youtu.be link without a video id".into()))?;
        return Ok(format!("https://www.youtube.com/watch?v={id}"));
    }

    if host.ends_with("youtube.com")
        && let Some(id) = shorts_video_id(&parsed)
    {
        return Ok(format!("https://www.youtube.com/watch?v={id}"));
    }

    strip_tracking_params(&mut parsed);
    Ok(parsed.into())
}

/// Human-readable platform label for an already-normalized URL. Used when
/// the metadata probe fails and the resolver degrades to a fallback answer.
pub fn platform_label(normalized: &str) -> &'static str {
    let host = Url::parse(normalized)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_ascii_lowercase()));
    match host.as_deref() {
        Some(host) if host.ends_with("youtube.com") || host == "youtu.be" => "Youtube",
        Some(host) if host.ends_with("instagram.com") => "Instagram",
        Some(host) if host.ends_with("facebook.com") || host == "fb.watch" => "Facebook",
        _ => "Unknown",
    }
}

fn first_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

fn shorts_video_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
    if segments.next()? != "shorts" {
        return None;
    }
    segments.next().map(|id| id.to_string())
}

fn strip_tracking_params(url: &mut Url) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

fn is_tracking_param(name: &str) -> bool {
    TRACKING_PARAMS.contains(&name) || name.starts_with("utm_")
}
