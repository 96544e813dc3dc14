//! `rover list-retrieve <request-file>` – show what would be downloaded.

use anyhow::Result;
use rover_core::config::RoverConfig;
use rover_core::index_db::IndexDb;
use rover_core::manager::{DownloadManager, ManagerSettings};
use std::path::{Path, PathBuf};

use crate::cli::request_file;

pub async fn run_list_retrieve(
    cfg: &RoverConfig,
    request_file_path: &Path,
    availability_url: Option<String>,
    dataselect_url: Option<String>,
) -> Result<()> {
    let (request_lines, name) = request_file::read(request_file_path)?;
    let index_db = IndexDb::open(&cfg.index_db_path).await?;
    // list-retrieve only runs the availability diff, never dispatches a
    // worker, so there's no child to hand a config path to.
    let settings = ManagerSettings {
        rover_cmd: cfg.rover_cmd.clone(),
        config_path: PathBuf::new(),
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

    println!("{}", manager.display());
    Ok(())
}
