//! Filename derivation for downloads whose task asked the server to suggest
//! one (`filename == "?"`): Content-Disposition `filename*` (RFC 5987), then
//! quoted/plain `filename`, then the last non-empty URL path segment.

use std::path::{Path, PathBuf};

/// Picks the filename for a download from the response and URL, in
/// preference order. Whatever is chosen is stripped of path separators so it
/// can never escape the target directory.
pub fn suggest_filename(content_disposition: Option<&str>, url: &str) -> Option<String> {
    let candidate = content_disposition
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url(url))?;
    let cleaned: String = candidate
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Extracts a filename from a `Content-Disposition` header value.
/// `filename*=UTF-8''<pct-encoded>` wins over `filename="..."` / `filename=`.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain: Option<String> = None;
    for param in value.split(';').map(str::trim) {
        let Some((name, raw)) = param.split_once('=') else {
            continue;
        };
        let name = name.trim();
        let raw = raw.trim();
        if name.eq_ignore_ascii_case("filename*") {
            // Only the UTF-8 form of RFC 5987 is recognized; other charsets
            // fall through to the plain filename parameter.
            if let Some(encoded) = raw
                .strip_prefix("UTF-8''")
                .or_else(|| raw.strip_prefix("utf-8''"))
            {
                let decoded = percent_decode(encoded);
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if name.eq_ignore_ascii_case("filename") {
            let unquoted = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"'));
            let value = unquoted.unwrap_or(raw);
            if !value.is_empty() {
                plain = Some(value.to_string());
            }
        }
    }
    plain
}

/// Last non-empty path segment of the URL, if any.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.to_string())
}

/// Makes `path` unique by appending ` (n)` before the extension, starting at
/// 1 and incrementing until the name is free.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or(Path::new(""));
    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).and_then(|p| {
                let s = std::str::from_utf8(p).ok()?;
                u8::from_str_radix(s, 16).ok()
            });
            if let Some(b) = hex {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
