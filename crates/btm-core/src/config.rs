//! Engine configuration loaded from `~/.config/btm/config.toml` and mirrored
//! into the durable store's `metadata` collection at startup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::queue::{QueueCaps, UNLIMITED};

/// Where download temp files live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UseCacheDir {
    Always,
    Never,
    /// Cache for reasonably-sized files, support dir for the rest.
    #[default]
    WhenAble,
}

/// How the per-task `requires_wifi` flag combines with a global override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequireWiFi {
    /// Each task's own flag decides.
    #[default]
    PerTask,
    /// Every task requires an unmetered network.
    All,
    /// No task requires an unmetered network.
    None,
}

/// Global engine configuration: the host-facing options plus task tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fail a download when starting it would leave less than this many MiB
    /// free on the target volume. 0 disables the preflight.
    pub check_available_space_mib: u64,
    pub use_cache_dir: UseCacheDir,
    /// Platform-dependent; carried for hosts that route downloads to shared
    /// external storage.
    pub use_external_storage: bool,
    pub request_timeout_seconds: u64,
    pub resource_timeout_seconds: u64,
    pub proxy_address: Option<String>,
    pub proxy_port: Option<u16>,
    pub holding_queue_max_concurrent: usize,
    pub holding_queue_max_concurrent_by_host: usize,
    pub holding_queue_max_concurrent_by_group: usize,
    /// Accept `W/` weak entity tags when validating a resume.
    pub allow_weak_etag: bool,
    /// Complete immediately when the destination already exists with at
    /// least this size in MiB. -1 disables.
    pub skip_existing_files_larger_than_mib: i64,
    pub require_wifi: RequireWiFi,
    /// Retain task records for host queries.
    pub track_tasks: bool,
    /// UI strings passed through to external notification collaborators.
    pub localize: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            check_available_space_mib: 0,
            use_cache_dir: UseCacheDir::default(),
            use_external_storage: false,
            request_timeout_seconds: 60,
            resource_timeout_seconds: 4 * 60 * 60,
            proxy_address: None,
            proxy_port: None,
            holding_queue_max_concurrent: UNLIMITED,
            holding_queue_max_concurrent_by_host: UNLIMITED,
            holding_queue_max_concurrent_by_group: UNLIMITED,
            allow_weak_etag: false,
            skip_existing_files_larger_than_mib: -1,
            require_wifi: RequireWiFi::default(),
            track_tasks: true,
            localize: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Queue caps derived from the holding-queue options.
    pub fn queue_caps(&self) -> QueueCaps {
        QueueCaps {
            max_concurrent: self.holding_queue_max_concurrent,
            max_concurrent_by_host: self.holding_queue_max_concurrent_by_host,
            max_concurrent_by_group: self.holding_queue_max_concurrent_by_group,
        }
    }

    /// Whether a task effectively requires an unmetered network under the
    /// current global mode.
    pub fn effective_requires_wifi(&self, task_requires_wifi: bool) -> bool {
        match self.require_wifi {
            RequireWiFi::PerTask => task_requires_wifi,
            RequireWiFi::All => true,
            RequireWiFi::None => false,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("btm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}
