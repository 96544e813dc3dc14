//! CLI command handlers. Each command is in its own file for clarity.

mod download;
mod list_retrieve;
mod retrieve;
mod stubs;

pub use download::run_download;
pub use list_retrieve::run_list_retrieve;
pub use retrieve::run_retrieve;
pub use stubs::{run_daemon, run_init_repository, run_list_subscribe, run_subscribe, run_web};
