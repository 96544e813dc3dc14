use rover_core::logging;

mod cli;

use crate::cli::CliCommand;

#[tokio::main]
async fn main() {
    // Initialize logging as early as possible; fall back to stderr-only if
    // the state directory isn't writable (e.g. inside a restricted
    // container a `download` child might run in).
    if logging::init_logging().is_err() {
        logging::init_logging_stderr();
    }

    // Parse CLI and dispatch.
    if let Err(err) = CliCommand::run_from_args().await {
        eprintln!("rover error: {:#}", err);
        std::process::exit(1);
    }
}
