//! Temp-file lifecycle for downloads.
//!
//! Plain downloads append sequentially to a `PartFile` and atomically move
//! it into place on completion. Parallel downloads preallocate a
//! `SparseFile` and write chunks at their offsets concurrently.

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Prefix of every temp file the engine creates.
pub const TEMP_PREFIX: &str = "com.btm.background_transfer";

/// Fresh temp path inside `dir`.
pub fn new_temp_path(dir: &Path) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    dir.join(format!("{}{}", TEMP_PREFIX, suffix))
}

/// Sequential append writer over a temp file.
pub struct PartFile {
    file: File,
    path: PathBuf,
    written: u64,
}

impl PartFile {
    /// Create a new empty temp file inside `dir`.
    pub fn create_in(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let path = new_temp_path(dir);
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create temp file {}", path.display()))?;
        Ok(PartFile {
            file,
            path,
            written: 0,
        })
    }

    /// Open an existing temp file for resume, appending after its current
    /// contents.
    pub fn open_append(path: &Path) -> Result<Self> {
        let file = File::options()
            .append(true)
            .open(path)
            .with_context(|| format!("open temp file {}", path.display()))?;
        let written = file.metadata()?.len();
        Ok(PartFile {
            file,
            path: path.to_path_buf(),
            written,
        })
    }

    /// Truncate to `len` bytes (resume preflight re-aligning with the
    /// server's range start), then continue appending from there.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).context("truncate temp file")?;
        // Reopen in append mode so the cursor follows the new length.
        self.file = File::options()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopen temp file {}", self.path.display()))?;
        self.written = len;
        Ok(())
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("sync temp file")?;
        Ok(())
    }

    /// Delete the temp file (cancel, or fresh restart after a failure).
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(&path)
            .with_context(|| format!("remove temp file {}", path.display()))?;
        Ok(())
    }
}

/// Preallocated temp file supporting concurrent positional writes. Cloneable
/// into parallel chunk workers; each `write_at` is independent.
#[derive(Clone)]
pub struct SparseFile {
    file: Arc<File>,
    path: PathBuf,
}

impl SparseFile {
    /// Create (or overwrite) a temp file of `size` bytes inside `dir`.
    pub fn create_in(dir: &Path, size: u64) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let path = new_temp_path(dir);
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create temp file {}", path.display()))?;
        file.set_len(size).context("preallocate temp file")?;
        Ok(SparseFile {
            file: Arc::new(file),
            path,
        })
    }

    /// Reopen an existing preallocated temp file for resume.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open temp file {}", path.display()))?;
        Ok(SparseFile {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)
    }

    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("sync temp file")?;
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(&path)
            .with_context(|| format!("remove temp file {}", path.display()))?;
        Ok(())
    }
}
