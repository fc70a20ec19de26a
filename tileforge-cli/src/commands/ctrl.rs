//! The `ctrl` subcommand: one-shot client of the control socket.

use std::path::PathBuf;

use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::error;

#[derive(Args)]
pub struct CtrlArgs {
    /// Control socket of the running daemon.
    #[arg(long, default_value = "store/tileforge.ctrl")]
    socket: PathBuf,

    /// Command and its arguments, e.g. `has-resource rf group id`.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

pub async fn run(args: CtrlArgs) -> i32 {
    let stream = match UnixStream::connect(&args.socket).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(socket = %args.socket.display(), error = %e, "Cannot connect");
            return 1;
        }
    };
    let (read, mut write) = stream.into_split();

    let line = format!("{}\n", args.command.join(" "));
    if let Err(e) = write.write_all(line.as_bytes()).await {
        error!(error = %e, "Cannot send command");
        return 1;
    }
    // half-close so the server sees EOF after the single command
    drop(write);

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        println!("{line}");
    }
    0
}
