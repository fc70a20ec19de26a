//! Parent side of the warper farm.
//!
//! Workers are checked out exclusively for one request at a time; the
//! bounded free queue plus a semaphore serialises concurrent callers
//! onto the available processes. A housekeeping task enforces the
//! aggregate RSS budget by recycling the largest idle worker.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GenerateError;
use crate::sink::Sink;

use super::protocol::{read_frame_async, write_frame_async, FromWorker, ToWorker};
use super::rss::rss_bytes;
use super::{WarpRequest, WarpResponse, WarperConfig, WORKER_SUBCOMMAND};

#[derive(Debug, thiserror::Error)]
pub enum WarperError {
    #[error("request cancelled")]
    Cancelled,

    #[error("worker lost")]
    WorkerLost,

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("cannot spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<WarperError> for GenerateError {
    fn from(value: WarperError) -> Self {
        match value {
            WarperError::Cancelled => GenerateError::Cancelled,
            WarperError::WorkerLost => GenerateError::WorkerLost,
            WarperError::Worker(message) => GenerateError::Internal(message),
            WarperError::Spawn(e) => GenerateError::io("spawning warper worker", e),
        }
    }
}

/// How long to wait for a worker to acknowledge a cancel before giving
/// it up as lost.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    next_id: u64,
    served: u32,
}

impl WorkerHandle {
    async fn spawn(config: &WarperConfig) -> Result<Self, WarperError> {
        let program = match &config.worker_program {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };

        let mut command = Command::new(&program);
        command
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(tmp) = &config.tmp_root {
            command.env("GDAL_TMPDIR", tmp);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));
        let pid = child.id().unwrap_or(0);

        debug!(pid, program = %program.display(), "Spawned warper worker");
        Ok(Self {
            child,
            stdin,
            stdout,
            pid,
            next_id: 1,
            served: 0,
        })
    }

    /// Ships one request and awaits its correlated response.
    async fn request(
        &mut self,
        request: WarpRequest,
        token: &CancellationToken,
    ) -> Result<WarpResponse, WarperError> {
        let id = self.next_id;
        self.next_id += 1;
        self.served += 1;

        write_frame_async(&mut self.stdin, &ToWorker::Request { id, request })
            .await
            .map_err(|_| WarperError::WorkerLost)?;

        // phase 1: wait for the response or the caller's cancellation
        loop {
            tokio::select! {
                frame = read_frame_async::<FromWorker, _>(&mut self.stdout) => {
                    return match frame {
                        Ok(Some(FromWorker::Response { id: rid, response })) if rid == id => {
                            Ok(response)
                        }
                        Ok(Some(_)) => continue,
                        Ok(None) => Err(WarperError::WorkerLost),
                        Err(_) => Err(WarperError::WorkerLost),
                    };
                }
                _ = token.cancelled() => {
                    break;
                }
            }
        }

        // phase 2: cancel was requested; tell the worker and give it a
        // bounded grace period to wind down
        write_frame_async(&mut self.stdin, &ToWorker::Cancel { id })
            .await
            .map_err(|_| WarperError::WorkerLost)?;

        let wait = async {
            loop {
                match read_frame_async::<FromWorker, _>(&mut self.stdout).await {
                    Ok(Some(FromWorker::Response { id: rid, response })) if rid == id => {
                        return Ok(response)
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => return Err(WarperError::WorkerLost),
                    Err(_) => return Err(WarperError::WorkerLost),
                }
            }
        };
        match tokio::time::timeout(CANCEL_GRACE, wait).await {
            Ok(Ok(_)) => Err(WarperError::Cancelled),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(pid = self.pid, "Worker ignored cancel; giving it up");
                Err(WarperError::WorkerLost)
            }
        }
    }

    async fn shutdown(mut self) {
        let _ = write_frame_async(&mut self.stdin, &ToWorker::Shutdown).await;
        drop(self.stdin);
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.start_kill();
            }
        }
    }

    fn kill(mut self) {
        let _ = self.child.start_kill();
    }
}

struct Inner {
    config: WarperConfig,
    free: Mutex<VecDeque<WorkerHandle>>,
    slots: Semaphore,
    /// Pids of every live worker, busy ones included.
    pids: SyncMutex<Vec<u32>>,
    shutdown: CancellationToken,
}

/// Handle to the warper farm. Cheap to clone; thread-safe.
#[derive(Clone)]
pub struct Warper {
    inner: Arc<Inner>,
}

impl Warper {
    /// Spawns the worker pool and starts RSS housekeeping.
    pub async fn start(config: WarperConfig) -> Result<Self, WarperError> {
        let mut workers = VecDeque::with_capacity(config.process_count);
        let mut pids = Vec::new();
        for _ in 0..config.process_count {
            let worker = WorkerHandle::spawn(&config).await?;
            pids.push(worker.pid);
            workers.push_back(worker);
        }
        info!(
            processes = config.process_count,
            rss_limit = ?config.rss_limit,
            "Warper farm started"
        );

        let inner = Arc::new(Inner {
            slots: Semaphore::new(workers.len()),
            free: Mutex::new(workers),
            pids: SyncMutex::new(pids),
            shutdown: CancellationToken::new(),
            config,
        });

        if inner.config.rss_limit.is_some() {
            let housekeeper = Arc::clone(&inner);
            tokio::spawn(async move { housekeeping(housekeeper).await });
        }

        Ok(Self { inner })
    }

    /// Executes one request on a free worker.
    ///
    /// Suspends until a worker is available and the work finishes, the
    /// sink is cancelled, or the worker dies (one retry on a
    /// replacement).
    pub async fn warp(
        &self,
        request: WarpRequest,
        sink: &Sink,
    ) -> Result<WarpResponse, WarperError> {
        if sink.aborted() {
            return Err(WarperError::Cancelled);
        }

        let _permit = self
            .inner
            .slots
            .acquire()
            .await
            .map_err(|_| WarperError::WorkerLost)?;
        let mut worker = self.checkout().await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match worker.request(request.clone(), sink.token()).await {
                Ok(WarpResponse::Error(message)) => {
                    self.checkin(worker).await;
                    return Err(WarperError::Worker(message));
                }
                Ok(response) => {
                    self.checkin(worker).await;
                    return Ok(response);
                }
                Err(WarperError::WorkerLost) if attempts == 1 => {
                    warn!(
                        pid = worker.pid,
                        dataset = request.dataset(),
                        "Worker lost mid-request; retrying once on a replacement"
                    );
                    self.forget(worker);
                    worker = WorkerHandle::spawn(&self.inner.config).await?;
                    self.inner.pids.lock().push(worker.pid);
                }
                Err(e) => {
                    match e {
                        WarperError::Cancelled => self.checkin(worker).await,
                        _ => self.forget(worker),
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Stops every worker and the housekeeping task.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let mut free = self.inner.free.lock().await;
        while let Some(worker) = free.pop_front() {
            worker.shutdown().await;
        }
        self.inner.pids.lock().clear();
    }

    /// (live worker count, aggregate RSS bytes) for monitoring.
    pub fn stat(&self) -> (usize, u64) {
        let pids = self.inner.pids.lock();
        let rss = pids.iter().filter_map(|&pid| rss_bytes(pid)).sum();
        (pids.len(), rss)
    }

    async fn checkout(&self) -> Result<WorkerHandle, WarperError> {
        let mut free = self.inner.free.lock().await;
        match free.pop_front() {
            Some(worker) => Ok(worker),
            // a failed respawn left the slot empty; build a new worker
            None => WorkerHandle::spawn(&self.inner.config).await,
        }
    }

    async fn checkin(&self, worker: WorkerHandle) {
        if worker.served >= self.inner.config.max_requests_per_worker {
            info!(
                pid = worker.pid,
                served = worker.served,
                "Recycling worker after request budget"
            );
            self.forget(worker);
            match WorkerHandle::spawn(&self.inner.config).await {
                Ok(fresh) => {
                    self.inner.pids.lock().push(fresh.pid);
                    self.inner.free.lock().await.push_back(fresh);
                }
                Err(e) => error!(error = %e, "Cannot respawn recycled worker"),
            }
            return;
        }
        self.inner.free.lock().await.push_back(worker);
    }

    fn forget(&self, worker: WorkerHandle) {
        self.inner.pids.lock().retain(|&pid| pid != worker.pid);
        worker.kill();
    }
}

/// Periodic RSS-budget enforcement.
///
/// When the sum of worker RSS exceeds the budget, the largest idle
/// worker is shut down and replaced with a fresh one.
async fn housekeeping(inner: Arc<Inner>) {
    let Some(limit) = inner.config.rss_limit else {
        return;
    };
    let mut interval = tokio::time::interval(inner.config.rss_check_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = inner.shutdown.cancelled() => break,
        }

        let total: u64 = {
            let pids = inner.pids.lock();
            pids.iter().filter_map(|&pid| rss_bytes(pid)).sum()
        };
        if total <= limit {
            debug!(total, limit, "Warper RSS within budget");
            continue;
        }

        warn!(total, limit, "Warper RSS over budget; recycling largest idle worker");
        let mut free = inner.free.lock().await;
        let largest = free
            .iter()
            .enumerate()
            .filter_map(|(i, w)| rss_bytes(w.pid).map(|rss| (i, rss)))
            .max_by_key(|&(_, rss)| rss)
            .map(|(i, _)| i);
        let Some(index) = largest else {
            continue;
        };
        let worker = free.remove(index).expect("index from enumerate");
        inner.pids.lock().retain(|&pid| pid != worker.pid);
        worker.shutdown().await;

        match WorkerHandle::spawn(&inner.config).await {
            Ok(fresh) => {
                inner.pids.lock().push(fresh.pid);
                free.push_back(fresh);
            }
            Err(e) => error!(error = %e, "Cannot respawn worker after RSS recycle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warper_error_maps_to_generate_error() {
        assert!(matches!(
            GenerateError::from(WarperError::Cancelled),
            GenerateError::Cancelled
        ));
        assert!(matches!(
            GenerateError::from(WarperError::WorkerLost),
            GenerateError::WorkerLost
        ));
        assert!(matches!(
            GenerateError::from(WarperError::Worker("x".into())),
            GenerateError::Internal(_)
        ));
    }
}
