//! Logging setup for embedders that want the engine to own it.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Default filter: info everywhere, debug for this crate. `RUST_LOG`
/// overrides it.
fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,btm_core=debug"))
}

/// Path of the engine log file under the XDG state directory, with parents
/// created: `~/.local/state/btm/btm.log`.
pub fn log_file_path() -> Result<PathBuf> {
    let state_dir = xdg::BaseDirectories::with_prefix("btm")?.get_state_home();
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("create {}", state_dir.display()))?;
    Ok(state_dir.join("btm.log"))
}

/// Route `tracing` output to the engine log file, appending across runs.
/// Returns Err when the file cannot be opened (read-only state dir, etc.)
/// so the embedder can fall back to [`init_logging_stderr`].
pub fn init_logging() -> Result<()> {
    let path = log_file_path()?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    tracing::info!("logging to {}", path.display());
    Ok(())
}

/// Route `tracing` output to stderr. The fallback when no log file can be
/// opened, and the sensible default during development.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
