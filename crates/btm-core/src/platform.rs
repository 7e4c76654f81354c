//! Platform abstraction: base directories, network metering, free space and
//! file moves. The one seam the engine needs from the host OS.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::task::BaseDirectory;

/// Host-OS services the transfer engine depends on.
pub trait Platform: Send + Sync {
    /// Root path a task's `base_directory` resolves to. `Root` resolves to
    /// the empty prefix.
    fn base_path(&self, base: BaseDirectory) -> Result<PathBuf>;

    /// Directory for temp files when the cache heuristic picks the cache.
    fn cache_path(&self) -> Result<PathBuf>;

    /// Directory for temp files when the cache heuristic picks support.
    fn support_path(&self) -> Result<PathBuf>;

    /// True when the current network is metered (not WiFi/ethernet).
    fn is_metered_network(&self) -> bool;

    /// Available bytes on the volume holding `path`.
    fn space_available(&self, path: &Path) -> Result<u64>;

    /// Move `src` to `dst`: rename on the same volume, copy-then-delete
    /// across volumes. When `dst` already exists its permission mode is
    /// preserved (where the platform exposes it).
    fn move_file(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Platform implementation backed by XDG directories and std/libc calls.
/// Network metering has no portable probe here, so the host reports it via
/// `set_metered` (connectivity events feed the scheduler the same way).
pub struct NativePlatform {
    dirs: xdg::BaseDirectories,
    metered: AtomicBool,
}

impl NativePlatform {
    pub fn new() -> Result<Self> {
        Ok(NativePlatform {
            dirs: xdg::BaseDirectories::with_prefix("btm")?,
            metered: AtomicBool::new(false),
        })
    }

    /// Record the host-reported metered state of the current network.
    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::Relaxed);
    }
}

impl Platform for NativePlatform {
    fn base_path(&self, base: BaseDirectory) -> Result<PathBuf> {
        let path = match base {
            BaseDirectory::ApplicationDocuments => self.dirs.get_data_home().join("documents"),
            BaseDirectory::Temporary => std::env::temp_dir(),
            BaseDirectory::ApplicationSupport => self.dirs.get_data_home().join("support"),
            BaseDirectory::ApplicationLibrary => self.dirs.get_state_home().join("library"),
            BaseDirectory::Root => PathBuf::new(),
        };
        Ok(path)
    }

    fn cache_path(&self) -> Result<PathBuf> {
        let p = self.dirs.get_cache_home();
        std::fs::create_dir_all(&p).with_context(|| format!("create {}", p.display()))?;
        Ok(p)
    }

    fn support_path(&self) -> Result<PathBuf> {
        let p = self.dirs.get_data_home().join("support");
        std::fs::create_dir_all(&p).with_context(|| format!("create {}", p.display()))?;
        Ok(p)
    }

    fn is_metered_network(&self) -> bool {
        self.metered.load(Ordering::Relaxed)
    }

    #[cfg(unix)]
    fn space_available(&self, path: &Path) -> Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        // statvfs wants an existing path; walk up until one exists.
        let mut probe = path.to_path_buf();
        while !probe.exists() {
            match probe.parent() {
                Some(p) => probe = p.to_path_buf(),
                None => break,
            }
        }
        let c_path = CString::new(probe.as_os_str().as_bytes()).context("path contains NUL")?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
        if rc != 0 {
            anyhow::bail!(
                "statvfs({}) failed: {}",
                probe.display(),
                std::io::Error::last_os_error()
            );
        }
        Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn space_available(&self, _path: &Path) -> Result<u64> {
        Ok(u64::MAX)
    }

    fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        #[cfg(unix)]
        let existing_mode = std::fs::metadata(dst)
            .ok()
            .map(|m| std::os::unix::fs::PermissionsExt::mode(&m.permissions()));

        match std::fs::rename(src, dst) {
            Ok(()) => {}
            Err(_) => {
                // Different volume: copy then delete.
                std::fs::copy(src, dst)
                    .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
                std::fs::remove_file(src)
                    .with_context(|| format!("remove {}", src.display()))?;
            }
        }

        #[cfg(unix)]
        if let Some(mode) = existing_mode {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_base_is_empty_prefix() {
        let p = NativePlatform::new().unwrap();
        assert_eq!(p.base_path(BaseDirectory::Root).unwrap(), PathBuf::new());
    }

    #[test]
    fn space_available_reports_nonzero_for_tmp() {
        let p = NativePlatform::new().unwrap();
        let free = p.space_available(&std::env::temp_dir()).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn move_file_creates_parents_and_moves() {
        let p = NativePlatform::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"abc").unwrap();
        let dst = dir.path().join("nested/deeper/dst.bin");
        p.move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"abc");
    }

    #[test]
    fn metered_flag_round_trips() {
        let p = NativePlatform::new().unwrap();
        assert!(!p.is_metered_network());
        p.set_metered(true);
        assert!(p.is_metered_network());
    }
}
