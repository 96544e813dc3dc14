//! `rover retrieve <request-file>` – download everything missing, to completion.

use anyhow::Result;
use rover_core::config::RoverConfig;
use rover_core::index_db::IndexDb;
use rover_core::manager::{DownloadManager, ManagerSettings};
use std::path::Path;

use crate::cli::request_file;

pub async fn run_retrieve(
    cfg: &RoverConfig,
    config_path: &Path,
    request_file_path: &Path,
    availability_url: Option<String>,
    dataselect_url: Option<String>,
) -> Result<()> {
    let (request_lines, name) = request_file::read(request_file_path)?;
    let index_db = IndexDb::open(&cfg.index_db_path).await?;
    let settings = ManagerSettings {
        rover_cmd: cfg.rover_cmd.clone(),
        config_path: config_path.to_path_buf(),
    };
    let mut manager = DownloadManager::new(cfg.download_workers, settings, cfg.clone(), Some(index_db));
    manager
        .add(
            name,
            availability_url.unwrap_or_else(|| cfg.availability_url.clone()),
            dataselect_url.unwrap_or_else(|| cfg.dataselect_url.clone()),
            request_lines,
            cfg.timespan_tol,
            cfg.timespan_inc,
            cfg.download_retries,
        )
        .await?;

    let n = manager.download().await?;
    if n == 0 {
        println!("nothing to download");
    } else {
        println!("downloaded {n} chunk(s)");
    }
    Ok(())
}
