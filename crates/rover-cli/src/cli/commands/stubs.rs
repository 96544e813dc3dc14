//! Out-of-scope subcommands: kept as a visible CLI surface (so `rover --help`
//! reads like the real tool) but backed by nothing, since their collaborators
//! — the subscription store, the daemon's process supervision, the status
//! HTTP server, and archive bootstrapping — live outside the download
//! manager this crate implements.

use anyhow::{bail, Result};
use std::path::Path;

pub fn run_subscribe(_name: &str, _request_file: &Path) -> Result<()> {
    bail!(
        "subscribe is out of scope for this build: the subscription store is an \
         external collaborator the daemon feeds into the download manager"
    )
}

pub fn run_list_subscribe() -> Result<()> {
    bail!(
        "list-subscribe is out of scope for this build: the subscription store is \
         an external collaborator"
    )
}

pub fn run_daemon() -> Result<()> {
    bail!(
        "daemon is out of scope for this build: process supervision and PID files \
         live outside the download manager core"
    )
}

pub fn run_web() -> Result<()> {
    bail!(
        "web is out of scope for this build: the status HTTP server is an external \
         collaborator that only reads rover_download_stats"
    )
}

pub fn run_init_repository(_path: &Path) -> Result<()> {
    bail!(
        "init-repository is out of scope for this build: archive bootstrapping \
         lives outside the download manager core"
    )
}
