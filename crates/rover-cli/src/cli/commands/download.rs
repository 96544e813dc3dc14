//! `rover download <url>` – the per-chunk worker invocation the manager
//! spawns for each day-chunk (`{rover_cmd} -f {config_path} download {url}`).

use anyhow::Result;
use rover_core::chunk_downloader;
use rover_core::config::RoverConfig;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn run_download(cfg: &RoverConfig, url: &str) -> Result<()> {
    if cfg.force_failure_percent > 0 && roll_failure(cfg.force_failure_percent) {
        tracing::warn!(url, percent = cfg.force_failure_percent, "injected synthetic download failure");
        std::process::exit(1);
    }
    chunk_downloader::download_chunk(cfg, url)?;
    Ok(())
}

/// Rolls a `0..100` die against `percent` using wall-clock jitter. Good
/// enough for fault injection in test scenarios; this binary never needs a
/// seeded or reproducible RNG for it.
fn roll_failure(percent: u8) -> bool {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 100) < percent as u32
}
