//! CLI for the rover seismic download manager.

mod commands;
mod request_file;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rover_core::config::{self, RoverConfig};
use std::path::PathBuf;

use commands::{
    run_daemon, run_download, run_init_repository, run_list_retrieve, run_list_subscribe,
    run_retrieve, run_subscribe, run_web,
};

/// Top-level CLI for the rover seismic download manager.
#[derive(Debug, Parser)]
#[command(name = "rover")]
#[command(about = "rover: availability-driven FDSN seismic data download manager", long_about = None)]
pub struct Cli {
    /// Path to an explicit config file. Every worker this invocation spawns
    /// is re-launched with `-f` pointing at this same path, so it re-reads
    /// identical configuration. Defaults to the XDG config location.
    #[arg(short = 'f', long = "config-file", global = true, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download everything a request file's streams are missing, to completion.
    Retrieve {
        /// Path to a request file: one `NET STA LOC CHA BEGIN END` line per
        /// span, dashes for empty codes.
        request_file: PathBuf,
        /// Override the configured availability service URL.
        #[arg(long)]
        availability_url: Option<String>,
        /// Override the configured dataselect service URL.
        #[arg(long)]
        dataselect_url: Option<String>,
    },

    /// Show what a request file would download, without downloading it.
    ListRetrieve {
        request_file: PathBuf,
        #[arg(long)]
        availability_url: Option<String>,
        #[arg(long)]
        dataselect_url: Option<String>,
    },

    /// Fetch one dataselect URL and file it into the archive. This is the
    /// per-chunk worker invocation the manager spawns for every day-chunk;
    /// it is not meant to be typed by hand, but nothing stops a user from
    /// downloading one URL directly this way.
    #[command(hide = true)]
    Download { url: String },

    /// Persist a named subscription to be re-checked on every daemon poll.
    /// Out of scope for this build: the subscription store is an external
    /// collaborator that the daemon feeds into the download manager.
    Subscribe { name: String, request_file: PathBuf },

    /// List persisted subscriptions. Out of scope, see `subscribe`.
    ListSubscribe,

    /// Run the long-lived daemon that re-feeds subscriptions into the
    /// manager on a schedule. Out of scope: process supervision, PID files,
    /// and the subscription store all live outside the download manager
    /// this crate implements.
    Daemon,

    /// Serve the status HTTP page. Out of scope: the status server is an
    /// external collaborator that only reads `rover_download_stats`.
    Web,

    /// Initialize a new archive + index database at `path`. Out of scope:
    /// archive bootstrapping lives outside the download manager core.
    InitRepository { path: PathBuf },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let (cfg, config_path) = load_config(cli.config_file.as_deref())?;
        tracing::debug!(?config_path, "loaded config");

        match cli.command {
            CliCommand::Retrieve {
                request_file,
                availability_url,
                dataselect_url,
            } => {
                run_retrieve(
                    &cfg,
                    &config_path,
                    &request_file,
                    availability_url,
                    dataselect_url,
                )
                .await?
            }
            CliCommand::ListRetrieve {
                request_file,
                availability_url,
                dataselect_url,
            } => run_list_retrieve(&cfg, &request_file, availability_url, dataselect_url).await?,
            CliCommand::Download { url } => run_download(&cfg, &url)?,
            CliCommand::Subscribe { name, request_file } => run_subscribe(&name, &request_file)?,
            CliCommand::ListSubscribe => run_list_subscribe()?,
            CliCommand::Daemon => run_daemon()?,
            CliCommand::Web => run_web()?,
            CliCommand::InitRepository { path } => run_init_repository(&path)?,
        }

        Ok(())
    }
}

/// Resolves the config used for this invocation, plus the absolute path it
/// came from: workers the manager spawns are handed this exact path via
/// `-f` so they re-read identically configured state, whether the parent
/// was launched with `-f` itself or fell back to the XDG default.
fn load_config(explicit: Option<&std::path::Path>) -> Result<(RoverConfig, PathBuf)> {
    match explicit {
        Some(path) => {
            let cfg = config::load_from_path(path)?;
            let absolute = path.canonicalize().or_else(|_| {
                std::env::current_dir().map(|dir| dir.join(path))
            })?;
            Ok((cfg, absolute))
        }
        None => {
            let cfg = config::load_or_init()?;
            let path = config::config_path()?;
            Ok((cfg, path))
        }
    }
}
