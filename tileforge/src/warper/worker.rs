//! Worker subprocess entry point.
//!
//! A worker is single-threaded for GDAL work: one request at a time,
//! frames on stdin, responses on stdout. A small reader thread feeds the
//! main loop through a channel so a `Cancel` frame can be observed while
//! an operation is still running; the operation's cancel probe drains
//! that channel between chunks.

use std::io::Write;
use std::sync::mpsc::{Receiver, TryRecvError};

use tracing::{debug, info, warn};

use super::cache::{DatasetCache, DEFAULT_CAPACITY};
use super::ops;
use super::protocol::{read_frame, write_frame, FromWorker, ToWorker};

/// Runs the worker loop until stdin closes or `Shutdown` arrives.
///
/// Exit code is 0 on a clean shutdown, non-zero when the channel broke.
pub fn serve_worker() -> i32 {
    let (frame_tx, frame_rx) = std::sync::mpsc::channel::<ToWorker>();

    // reader thread: blocking stdin -> channel
    let reader = std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        loop {
            match read_frame::<ToWorker>(&mut stdin) {
                Ok(Some(frame)) => {
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Worker stdin broke");
                    break;
                }
            }
        }
    });

    let mut cache = DatasetCache::new(DEFAULT_CAPACITY);
    let mut stdout = std::io::stdout().lock();
    let mut served = 0u64;
    let code = loop {
        let frame = match frame_rx.recv() {
            Ok(frame) => frame,
            // parent went away
            Err(_) => break 0,
        };

        match frame {
            ToWorker::Shutdown => {
                info!(served, "Worker shutting down");
                break 0;
            }
            ToWorker::Cancel { id } => {
                // cancel for a request that already finished; ignore
                debug!(id, "Stale cancel");
            }
            ToWorker::Request { id, request } => {
                debug!(id, dataset = request.dataset(), "Worker request");
                let response = ops::execute(&mut cache, &request, &|| {
                    cancelled_in_channel(&frame_rx, id)
                });
                served += 1;
                if write_frame(&mut stdout, &FromWorker::Response { id, response }).is_err() {
                    warn!("Worker stdout broke");
                    break 1;
                }
                let _ = stdout.flush();
            }
        }
    };

    drop(frame_rx);
    let _ = reader.join();
    code
}

/// Non-blocking probe for a `Cancel` frame matching the current request.
fn cancelled_in_channel(frame_rx: &Receiver<ToWorker>, current: u64) -> bool {
    loop {
        match frame_rx.try_recv() {
            Ok(ToWorker::Cancel { id }) if id == current => return true,
            Ok(ToWorker::Cancel { id }) => {
                debug!(id, current, "Cancel for a different request");
            }
            Ok(other) => {
                // the parent checks a worker out exclusively, so nothing
                // else should arrive mid-request
                warn!(?other, "Unexpected frame during request");
            }
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}
