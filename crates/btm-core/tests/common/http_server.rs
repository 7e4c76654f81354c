//! Minimal HTTP/1.1 server for integration tests: Range GET, scripted
//! status sequences, upload capture, optional ETag / Content-Disposition.
//!
//! Serves a single static body from a background thread per connection. The
//! options cover the scenarios the engine needs: resumable downloads (206 +
//! Accept-Ranges), throttled bodies slow enough to pause or cancel
//! mid-stream, flaky status sequences (503, 503, 200), and upload capture.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Clone)]
pub struct ServerOptions {
    /// Body served on a successful GET.
    pub body: Vec<u8>,
    /// Status per request, in order; the last entry repeats. Empty means
    /// always 200 (or 206 for ranged requests).
    pub statuses: Vec<u16>,
    /// Honor Range requests with a 206.
    pub support_ranges: bool,
    /// Send `Accept-Ranges: bytes`.
    pub advertise_ranges: bool,
    pub etag: Option<String>,
    pub content_disposition: Option<String>,
    /// Bytes per write when streaming the body.
    pub chunk_size: usize,
    /// Sleep between body writes, to keep transfers alive long enough for
    /// pause/cancel tests.
    pub chunk_delay: Duration,
    /// Status for captured POST/PUT requests.
    pub upload_status: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            body: Vec::new(),
            statuses: Vec::new(),
            support_ranges: true,
            advertise_ranges: true,
            etag: None,
            content_disposition: None,
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
            upload_status: 200,
        }
    }
}

/// One captured request.
#[derive(Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct ServerHandle {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ServerHandle {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Starts the server on an ephemeral port; runs until the process exits.
pub fn start(opts: ServerOptions) -> ServerHandle {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));

    let requests_bg = Arc::clone(&requests);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let opts = opts.clone();
            let requests = Arc::clone(&requests_bg);
            let counter = Arc::clone(&counter);
            thread::spawn(move || handle(stream, &opts, &requests, &counter));
        }
    });

    ServerHandle {
        url: format!("http://127.0.0.1:{}/data.bin", port),
        requests,
    }
}

fn handle(
    mut stream: std::net::TcpStream,
    opts: &ServerOptions,
    requests: &Arc<Mutex<Vec<RecordedRequest>>>,
    counter: &Arc<AtomicUsize>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let Some(request) = read_request(&mut stream) else {
        return;
    };
    let seq = counter.fetch_add(1, Ordering::SeqCst);
    let range = request
        .header("Range")
        .and_then(|v| parse_range(v, opts.body.len() as u64));
    requests.lock().unwrap().push(request.clone());

    let scripted = scripted_status(&opts.statuses, seq);
    if request.method == "POST" || request.method == "PUT" || request.method == "PATCH" {
        let status = scripted.unwrap_or(opts.upload_status);
        let body = b"uploaded";
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
            status,
            reason(status),
            body.len()
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(body);
        return;
    }

    if let Some(status) = scripted {
        if !(200..300).contains(&status) {
            let body = format!("status {}", status);
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
                status,
                reason(status),
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.write_all(body.as_bytes());
            return;
        }
    }

    let total = opts.body.len() as u64;
    let mut extra = String::new();
    if opts.advertise_ranges && opts.support_ranges {
        extra.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(etag) = &opts.etag {
        extra.push_str(&format!("ETag: {}\r\n", etag));
    }
    if let Some(cd) = &opts.content_disposition {
        extra.push_str(&format!("Content-Disposition: {}\r\n", cd));
    }

    if request.method == "HEAD" {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
            total, extra
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let (status_line, slice_start, slice_end) = match range {
        Some((start, end)) if opts.support_ranges => {
            extra.push_str(&format!(
                "Content-Range: bytes {}-{}/{}\r\n",
                start, end, total
            ));
            ("206 Partial Content", start, end + 1)
        }
        _ => ("200 OK", 0, total),
    };
    let slice = &opts.body[slice_start as usize..slice_end as usize];
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}\r\n",
        status_line,
        slice.len(),
        extra
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }
    for chunk in slice.chunks(opts.chunk_size.max(1)) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        let _ = stream.flush();
        if !opts.chunk_delay.is_zero() {
            thread::sleep(opts.chunk_delay);
        }
    }
}

fn read_request(stream: &mut std::net::TcpStream) -> Option<RecordedRequest> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    let header_end = loop {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > 1024 * 1024 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn scripted_status(statuses: &[u16], seq: usize) -> Option<u16> {
    if statuses.is_empty() {
        return None;
    }
    Some(*statuses.get(seq).unwrap_or(statuses.last().unwrap()))
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = match end.trim() {
        "" => total.saturating_sub(1),
        e => e.parse::<u64>().ok()?.min(total.saturating_sub(1)),
    };
    if start > end {
        return None;
    }
    Some((start, end))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
