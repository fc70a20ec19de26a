//! Tileforge command line interface.
//!
//! `start` runs the daemon (generators, warper farm, control socket);
//! `ctrl` talks to a running daemon over its control socket; the hidden
//! `warp-worker` subcommand is the entry point of farm worker
//! subprocesses and is never invoked by hand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "tileforge",
    version = tileforge::VERSION,
    about = "On-the-fly 3D geospatial tile server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tile server daemon.
    Start(commands::start::StartArgs),

    /// Send a command to a running daemon's control socket.
    Ctrl(commands::ctrl::CtrlArgs),

    /// Warper farm worker entry point (internal).
    #[command(hide = true, name = "warp-worker")]
    WarpWorker,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::WarpWorker => {
            // workers log to stderr; stdout carries the wire protocol
            init_logging(true);
            std::process::exit(tileforge::warper::serve_worker());
        }
        Command::Start(args) => {
            init_logging(false);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(args.core_threads())
                .enable_all()
                .build()
                .expect("build tokio runtime");
            let code = runtime.block_on(commands::start::run(args));
            std::process::exit(code);
        }
        Command::Ctrl(args) => {
            init_logging(false);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build tokio runtime");
            let code = runtime.block_on(commands::ctrl::run(args));
            std::process::exit(code);
        }
    }
}

fn init_logging(to_stderr: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

/// Default control socket path next to the store.
pub fn default_ctrl_socket(store: &std::path::Path) -> PathBuf {
    store.join("tileforge.ctrl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_ctrl_socket() {
        assert_eq!(
            default_ctrl_socket(std::path::Path::new("/var/lib/tileforge")),
            PathBuf::from("/var/lib/tileforge/tileforge.ctrl")
        );
    }
}
