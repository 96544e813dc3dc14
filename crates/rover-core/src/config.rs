use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration loaded from `~/.config/rover/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoverConfig {
    /// Worker pool capacity: max concurrent `download` child processes.
    pub download_workers: usize,
    /// Per-request HTTP timeout, in seconds, for both availability and dataselect.
    pub http_timeout_secs: u64,
    /// Max HTTP-level attempts (timeouts, 5xx, throttling) per chunk request.
    pub http_retries: u32,
    /// Max times a source will retry its final confirmation read before
    /// being marked inconsistent.
    pub download_retries: u32,
    /// Timespans separated by no more than this many seconds are merged
    /// into one when building coverage.
    pub timespan_tol: f64,
    /// Padding applied to a degenerate (zero-length) timespan before it's
    /// turned into a request.
    pub timespan_inc: f64,
    /// Scratch directory for in-flight chunk downloads before they're filed
    /// into the archive.
    pub temp_dir: PathBuf,
    /// Path (or bare name, resolved via `$PATH`) to the `rover` binary
    /// itself, used by the worker pool to spawn `download` children.
    pub rover_cmd: PathBuf,
    /// Percent chance (0-100) of injecting a synthetic chunk-download
    /// failure; used to exercise the retry/inconsistency paths in tests.
    pub force_failure_percent: u8,
    /// Delete archived files immediately after filing (used by
    /// validate-only runs that don't want to keep the data).
    pub delete_files: bool,
    /// External ingester invoked per downloaded chunk, against a
    /// per-process-unique SQLite database, to file the chunk into the
    /// on-disk store. `None` (the default: no ingester installed in this
    /// environment) falls back to this crate's own rename-or-copy filing.
    #[serde(default)]
    pub ingest_cmd: Option<PathBuf>,
    /// External indexer invoked after a successful ingest, to add the
    /// chunk's rows to the same per-process database. `None` skips
    /// indexing; a later out-of-scope merge step is what rolls per-process
    /// rows into the shared `tsindex`.
    #[serde(default)]
    pub index_cmd: Option<PathBuf>,
    /// Path to the local SQLite index database (`tsindex` + download stats).
    pub index_db_path: PathBuf,
    /// Base URL of the FDSN availability (extent) service.
    pub availability_url: String,
    /// Base URL of the FDSN dataselect service.
    pub dataselect_url: String,
    /// Root of the on-disk miniSEED archive.
    pub archive_root: PathBuf,
}

impl RoverConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for RoverConfig {
    fn default() -> Self {
        let state_dir = xdg::BaseDirectories::with_prefix("rover")
            .map(|d| d.get_state_home())
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            download_workers: 5,
            http_timeout_secs: 60,
            http_retries: 3,
            download_retries: 3,
            timespan_tol: 1.5,
            timespan_inc: 0.5,
            temp_dir: std::env::temp_dir().join("rover"),
            rover_cmd: PathBuf::from("rover"),
            force_failure_percent: 0,
            delete_files: false,
            ingest_cmd: None,
            index_cmd: None,
            index_db_path: state_dir.join("index.db"),
            availability_url: "http://service.iris.edu/fdsnws/availability/1/query".to_string(),
            dataselect_url: "http://service.iris.edu/fdsnws/dataselect/1/query".to_string(),
            archive_root: state_dir.join("archive"),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("rover")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<RoverConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = RoverConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: RoverConfig = toml::from_str(&data)?;
    Ok(cfg)
}

/// Loads configuration from an explicit path (`-f <path>`), creating a
/// default file there if none exists yet. Used both by the top-level CLI
/// invocation and by every `download` child it spawns, since the manager
/// always re-invokes workers with `-f <absolute-config-path>` so a worker's
/// view of configuration is identical to its parent's, however it was
/// originally launched.
pub fn load_from_path(path: &std::path::Path) -> Result<RoverConfig> {
    if !path.exists() {
        let default_cfg = RoverConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    let data = fs::read_to_string(path)?;
    let cfg: RoverConfig = toml::from_str(&data)?;
    Ok(cfg)
}
