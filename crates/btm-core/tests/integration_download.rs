//! End-to-end download scenarios: plain completion with progress, cancel,
//! pause/resume with byte-exact continuation, server-suggested filenames,
//! parallel chunked downloads and data requests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::tempdir;

use btm_core::config::EngineConfig;
use btm_core::registry::CallbackRegistry;
use btm_core::scheduler::Scheduler;
use btm_core::store::{collection, DurableStore};
use btm_core::task::{ResumeData, TaskKind, TaskStatus};

use common::http_server::{self, ServerOptions};
use common::{download_task, open_store, pattern_body, TestChannel, TestPlatform};

const WAIT: Duration = Duration::from_secs(30);

async fn setup(
) -> (
    tempfile::TempDir,
    Arc<TestChannel>,
    Arc<TestPlatform>,
    DurableStore,
    Scheduler,
) {
    let dir = tempdir().unwrap();
    let channel = TestChannel::new();
    let platform = TestPlatform::new(dir.path());
    let store = open_store(dir.path()).await;
    let scheduler = Scheduler::with_store(
        EngineConfig::default(),
        channel.clone(),
        platform.clone(),
        Arc::new(CallbackRegistry::new()),
        store.clone(),
    )
    .await
    .unwrap();
    (dir, channel, platform, store, scheduler)
}

fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[tokio::test(flavor = "multi_thread")]
async fn download_completes_with_status_path_and_final_progress() {
    let body = pattern_body(5_242_880);
    let server = http_server::start(ServerOptions {
        body: body.clone(),
        ..ServerOptions::default()
    });
    let (_dir, channel, platform, _store, scheduler) = setup().await;

    let task = download_task("s1", &server.url);
    scheduler.enqueue(task).await.unwrap();
    channel.wait_for_status("s1", TaskStatus::Complete, WAIT).await;

    assert_eq!(
        channel.statuses_for("s1"),
        vec![TaskStatus::Enqueued, TaskStatus::Running, TaskStatus::Complete]
    );
    let progresses = channel.progresses_for("s1");
    assert!(progresses.len() >= 2, "expected >=2 progress updates, got {:?}", progresses);
    assert_eq!(progresses.first(), Some(&0.0));
    assert_eq!(progresses.last(), Some(&1.0));

    let dest = platform.documents_dir().join("s1.bin");
    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len(), 5_242_880);
    assert_eq!(sha256(&written), sha256(&body));
    assert!(platform.temp_files().is_empty(), "temp file must be gone");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_download_leaves_no_files() {
    let server = http_server::start(ServerOptions {
        body: pattern_body(2 * 1024 * 1024),
        chunk_size: 32 * 1024,
        chunk_delay: Duration::from_millis(20),
        ..ServerOptions::default()
    });
    let (_dir, channel, platform, _store, scheduler) = setup().await;

    scheduler.enqueue(download_task("s2", &server.url)).await.unwrap();
    channel.wait_for_progress_count("s2", 1, WAIT).await;
    scheduler.cancel_tasks_with_ids(&["s2".to_string()]).await;
    channel.wait_for_status("s2", TaskStatus::Canceled, WAIT).await;

    assert_eq!(channel.statuses_for("s2").last(), Some(&TaskStatus::Canceled));
    assert_eq!(channel.progresses_for("s2").last(), Some(&-2.0));
    assert!(!platform.documents_dir().join("s2.bin").exists());
    // Give the worker a moment to unwind its temp file.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(platform.temp_files().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_persists_resume_data_and_resume_completes_byte_exact() {
    let body = pattern_body(2 * 1024 * 1024);
    let server = http_server::start(ServerOptions {
        body: body.clone(),
        etag: Some("\"entity-1\"".to_string()),
        chunk_size: 32 * 1024,
        chunk_delay: Duration::from_millis(20),
        ..ServerOptions::default()
    });
    let (_dir, channel, platform, store, scheduler) = setup().await;

    let mut task = download_task("s3", &server.url);
    task.allow_pause = true;
    scheduler.enqueue(task).await.unwrap();

    // Wait for a mid-transfer progress sample, then pause.
    channel.wait_for_progress_count("s3", 2, WAIT).await;
    assert!(scheduler.pause("s3"), "running download must accept pause");
    channel.wait_for_status("s3", TaskStatus::Paused, WAIT).await;
    assert_eq!(channel.progresses_for("s3").last(), Some(&-5.0));

    let resume: ResumeData = store
        .retrieve(collection::RESUME_DATA, "s3")
        .await
        .unwrap()
        .expect("resume data persisted on pause");
    assert!(resume.required_start_byte > 0);
    assert!(resume.required_start_byte < body.len() as u64);
    let temp_len = std::fs::metadata(&resume.data).unwrap().len();
    assert_eq!(temp_len, resume.required_start_byte);
    assert_eq!(resume.e_tag.as_deref(), Some("\"entity-1\""));
    assert!(channel
        .can_resume
        .lock()
        .unwrap()
        .contains(&("s3".to_string(), true)));

    assert!(scheduler.resume("s3").await);
    channel.wait_for_status("s3", TaskStatus::Complete, WAIT).await;

    let dest = platform.documents_dir().join("s3.bin");
    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len(), body.len(), "all bytes across both attempts");
    assert_eq!(sha256(&written), sha256(&body));
    // The server saw a ranged request on the second attempt.
    let ranged = server
        .requests()
        .iter()
        .any(|r| r.header("Range").is_some());
    assert!(ranged, "resume must send a Range header");
    // Resume state is consumed by completion.
    let gone: Option<ResumeData> = store.retrieve(collection::RESUME_DATA, "s3").await.unwrap();
    assert!(gone.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn suggested_filename_from_content_disposition_is_unique() {
    let server = http_server::start(ServerOptions {
        body: pattern_body(1024),
        content_disposition: Some("attachment; filename=\"suggested.bin\"".to_string()),
        ..ServerOptions::default()
    });
    let (_dir, channel, platform, _store, scheduler) = setup().await;

    let mut first = download_task("name1", &server.url);
    first.filename = "?".to_string();
    scheduler.enqueue(first).await.unwrap();
    channel.wait_for_status("name1", TaskStatus::Complete, WAIT).await;
    let final_task = channel.last_status("name1").unwrap().task;
    assert_eq!(final_task.filename, "suggested.bin");
    assert!(platform.documents_dir().join("suggested.bin").exists());

    let mut second = download_task("name2", &server.url);
    second.filename = "?".to_string();
    scheduler.enqueue(second).await.unwrap();
    channel.wait_for_status("name2", TaskStatus::Complete, WAIT).await;
    assert_eq!(
        channel.last_status("name2").unwrap().task.filename,
        "suggested (1).bin"
    );
    assert!(platform.documents_dir().join("suggested (1).bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_download_completes_and_file_matches() {
    let body = pattern_body(1_048_576);
    let server = http_server::start(ServerOptions {
        body: body.clone(),
        ..ServerOptions::default()
    });
    let (_dir, channel, platform, _store, scheduler) = setup().await;

    let mut task = download_task("par1", &server.url);
    task.kind = TaskKind::ParallelDownload;
    scheduler.enqueue(task).await.unwrap();
    channel.wait_for_status("par1", TaskStatus::Complete, WAIT).await;

    let written = std::fs::read(platform.documents_dir().join("par1.bin")).unwrap();
    assert_eq!(written.len(), body.len());
    assert_eq!(sha256(&written), sha256(&body));
    // Four ranged chunk requests (plus the probe).
    let ranged = server
        .requests()
        .iter()
        .filter(|r| r.method == "GET" && r.header("Range").is_some())
        .count();
    assert!(ranged >= 4, "expected chunked range requests, saw {}", ranged);
}

#[tokio::test(flavor = "multi_thread")]
async fn data_request_surfaces_response_body() {
    let body = b"{\"answer\": 42}".to_vec();
    let server = http_server::start(ServerOptions {
        body: body.clone(),
        ..ServerOptions::default()
    });
    let (_dir, channel, _platform, _store, scheduler) = setup().await;

    let mut task = download_task("data1", &server.url);
    task.kind = TaskKind::DataRequest;
    task.filename = String::new();
    scheduler.enqueue(task).await.unwrap();
    channel.wait_for_status("data1", TaskStatus::Complete, WAIT).await;

    let last = channel.last_status("data1").unwrap();
    assert_eq!(last.status, TaskStatus::Complete);
    assert_eq!(last.response_body.as_deref(), Some("{\"answer\": 42}"));
}
