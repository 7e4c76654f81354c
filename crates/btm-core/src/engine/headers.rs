//! HTTP response header capture and parsing.
//!
//! Headers arrive line by line from libcurl's header callback, including one
//! block per redirect hop; a new status line resets the collected state so
//! only the final hop's headers are kept.

use std::collections::HashMap;

/// Expected number of body bytes, as an explicit type rather than a `-1`
/// sentinel. The sentinel appears only at the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLength {
    Known(u64),
    Unknown,
}

impl ContentLength {
    /// Wire encoding: `-1` for unknown.
    pub fn as_wire(self) -> i64 {
        match self {
            ContentLength::Known(n) => n as i64,
            ContentLength::Unknown => -1,
        }
    }
}

/// Parsed `Content-Range: bytes a-b/N` (total absent for `*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// The response metadata the engine acts on.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub accept_ranges: bool,
    /// Raw ETag value, `W/` prefix and quotes preserved for comparison.
    pub etag: Option<String>,
    pub content_disposition: Option<String>,
    /// Custom `Known-Content-Length` response header.
    pub known_content_length: Option<u64>,
}

impl ResponseInfo {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True when the server signalled range support for this exchange:
    /// `Accept-Ranges: bytes` or an actual 206.
    pub fn supports_ranges(&self) -> bool {
        self.accept_ranges || self.status == 206
    }

    /// Expected body length: `Content-Length`, else the span of a present
    /// `Content-Range`, else the custom `Known-Content-Length` header (from
    /// the response, else from the task's own headers), else unknown.
    pub fn expected_length(&self, task_headers: &HashMap<String, String>) -> ContentLength {
        if let Some(n) = self.content_length {
            return ContentLength::Known(n);
        }
        if let Some(r) = self.content_range {
            return ContentLength::Known(r.end - r.start + 1);
        }
        if let Some(n) = self.known_content_length {
            return ContentLength::Known(n);
        }
        let from_task = task_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Known-Content-Length"))
            .and_then(|(_, v)| v.trim().parse::<u64>().ok());
        match from_task {
            Some(n) => ContentLength::Known(n),
            None => ContentLength::Unknown,
        }
    }
}

/// Collects raw header lines; a status line resets collection so redirects
/// leave only the final response.
#[derive(Debug, Default)]
pub struct HeaderCollector {
    lines: Vec<String>,
}

impl HeaderCollector {
    /// Feed one header callback invocation.
    pub fn push(&mut self, data: &[u8]) {
        if let Ok(s) = std::str::from_utf8(data) {
            let s = s.trim_end();
            if s.to_ascii_uppercase().starts_with("HTTP/") {
                self.lines.clear();
            }
            if !s.is_empty() {
                self.lines.push(s.to_string());
            }
        }
    }

    /// Parse whatever has been collected so far.
    pub fn parse(&self) -> ResponseInfo {
        parse_response_lines(&self.lines)
    }
}

fn parse_response_lines(lines: &[String]) -> ResponseInfo {
    let mut info = ResponseInfo::default();
    for line in lines {
        if line.to_ascii_uppercase().starts_with("HTTP/") {
            // "HTTP/1.1 206 Partial Content"
            if let Some(code) = line.split_whitespace().nth(1) {
                info.status = code.parse().unwrap_or(0);
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            info.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            info.accept_ranges = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("content-range") {
            info.content_range = parse_content_range(value);
        } else if name.eq_ignore_ascii_case("etag") {
            info.etag = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            info.content_disposition = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("known-content-length") {
            info.known_content_length = value.parse().ok();
        }
    }
    info
}

/// Parse a `Content-Range` value: `bytes a-b/N` or `bytes a-b/*`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        },
    })
}

/// Start (and optional end) of a `Range: bytes=a-b` header the caller put on
/// the task itself. Returns `(0, None)` when absent or unparseable.
pub fn task_range(task_headers: &HashMap<String, String>) -> (u64, Option<u64>) {
    let value = task_headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Range"))
        .map(|(_, v)| v.trim());
    let Some(value) = value else {
        return (0, None);
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return (0, None);
    };
    let Some((start, end)) = spec.split_once('-') else {
        return (0, None);
    };
    let start = start.trim().parse().unwrap_or(0);
    let end = end.trim().parse().ok();
    (start, end)
}

/// Entity-tag comparison for resume validation. Strong equality is required
/// unless weak acceptance is enabled, in which case two weak (`W/`-prefixed)
/// tags match on their opaque part.
pub fn etag_matches(stored: &str, current: &str, allow_weak: bool) -> bool {
    match (stored.strip_prefix("W/"), current.strip_prefix("W/")) {
        (None, None) => stored == current,
        (Some(s), Some(c)) => allow_weak && s == c,
        _ => false,
    }
}
