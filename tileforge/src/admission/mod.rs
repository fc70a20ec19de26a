//! Per-tile admission: at-most-one in-flight build per fingerprint.
//!
//! When several requests arrive for the same tile artifact, only one
//! build runs; every other caller piggy-backs on the in-flight result.
//! Uses `DashMap` for lock-free registration and a broadcast channel to
//! fan the finished bytes out to the waiters. There is no on-disk cache
//! at this layer; outputs are cheap to regenerate from prepared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::coord::TileId;
use crate::error::{GenerateError, GenerateResult};
use crate::resource::ResourceId;
use crate::sink::TileResponse;

/// The admission key: everything that selects one tile artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub resource: ResourceId,
    pub interface: String,
    pub tile: TileId,
    /// Artifact type (`image`, `mask`, `meta`, `mesh`, ...).
    pub artifact: String,
    pub format: String,
    pub flavor: String,
}

/// Outcome of registering a fingerprint.
pub enum Admission {
    /// First caller; build the tile and call [`TileAdmission::complete`].
    Build(BuildTicket),
    /// Another build is in flight; await its result.
    Join(broadcast::Receiver<BuildOutcome>),
}

/// Token held by the building caller.
pub struct BuildTicket {
    fingerprint: RequestFingerprint,
}

/// Shared result of a finished build.
#[derive(Clone, Debug)]
pub enum BuildOutcome {
    Ok(Arc<TileResponse>),
    /// Error text plus status; waiters surface it as an internal error
    /// of the piggy-backed build.
    Err(Arc<str>),
}

/// Statistics for monitoring admission effectiveness.
#[derive(Clone, Debug, Default)]
pub struct AdmissionStats {
    pub total: u64,
    pub joined: u64,
    pub built: u64,
}

/// The per-tile admission map.
pub struct TileAdmission {
    in_flight: DashMap<RequestFingerprint, broadcast::Sender<BuildOutcome>>,
    total: AtomicU64,
    joined: AtomicU64,
    built: AtomicU64,
}

impl TileAdmission {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            total: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            built: AtomicU64::new(0),
        }
    }

    /// Registers a request; exactly one concurrent caller per
    /// fingerprint receives [`Admission::Build`].
    pub fn register(&self, fingerprint: RequestFingerprint) -> Admission {
        self.total.fetch_add(1, Ordering::Relaxed);

        match self.in_flight.entry(fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!(tile = %fingerprint.tile, "Joining in-flight tile build");
                Admission::Join(entry.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(4);
                entry.insert(tx);
                self.built.fetch_add(1, Ordering::Relaxed);
                Admission::Build(BuildTicket { fingerprint })
            }
        }
    }

    /// Publishes a finished build to every waiter and clears the slot.
    pub fn complete(&self, ticket: BuildTicket, outcome: GenerateResult<TileResponse>) {
        if let Some((_, tx)) = self.in_flight.remove(&ticket.fingerprint) {
            let shared = match outcome {
                Ok(response) => BuildOutcome::Ok(Arc::new(response)),
                Err(e) => BuildOutcome::Err(Arc::from(e.to_string().as_str())),
            };
            let waiters = tx.receiver_count();
            let _ = tx.send(shared);
            if waiters > 0 {
                debug!(waiters, "Broadcast tile build to piggy-backed waiters");
            }
        }
    }

    /// Drops an in-flight slot without a result; waiters get an error.
    pub fn cancel(&self, ticket: BuildTicket) {
        self.in_flight.remove(&ticket.fingerprint);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            total: self.total.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            built: self.built.load(Ordering::Relaxed),
        }
    }
}

impl Default for TileAdmission {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits a piggy-backed build result.
pub async fn await_joined(
    mut rx: broadcast::Receiver<BuildOutcome>,
) -> GenerateResult<Arc<TileResponse>> {
    match rx.recv().await {
        Ok(BuildOutcome::Ok(response)) => Ok(response),
        Ok(BuildOutcome::Err(message)) => Err(GenerateError::Internal(message.to_string())),
        Err(_) => Err(GenerateError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::FileClass;

    fn fingerprint(x: u32) -> RequestFingerprint {
        RequestFingerprint {
            resource: ResourceId::new("webmercator", "g", "a"),
            interface: "tms".to_string(),
            tile: TileId::new(10, x, 7),
            artifact: "image".to_string(),
            format: "jpg".to_string(),
            flavor: "regular".to_string(),
        }
    }

    fn response(byte: u8) -> TileResponse {
        TileResponse::new(vec![byte; 4], "image/jpeg", FileClass::Data)
    }

    #[tokio::test]
    async fn test_first_caller_builds() {
        let admission = TileAdmission::new();
        match admission.register(fingerprint(1)) {
            Admission::Build(_) => {}
            Admission::Join(_) => panic!("first caller must build"),
        }
        assert_eq!(admission.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_second_caller_joins_and_receives() {
        let admission = Arc::new(TileAdmission::new());

        let ticket = match admission.register(fingerprint(1)) {
            Admission::Build(ticket) => ticket,
            _ => panic!("first caller must build"),
        };
        let waiter = match admission.register(fingerprint(1)) {
            Admission::Join(rx) => rx,
            _ => panic!("second caller must join"),
        };

        admission.complete(ticket, Ok(response(0xAB)));

        let result = await_joined(waiter).await.unwrap();
        assert_eq!(result.body, vec![0xAB; 4]);
        assert_eq!(admission.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_build_independently() {
        let admission = TileAdmission::new();
        assert!(matches!(admission.register(fingerprint(1)), Admission::Build(_)));
        assert!(matches!(admission.register(fingerprint(2)), Admission::Build(_)));
        assert_eq!(admission.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn test_error_propagates_to_waiters() {
        let admission = TileAdmission::new();
        let ticket = match admission.register(fingerprint(1)) {
            Admission::Build(ticket) => ticket,
            _ => unreachable!(),
        };
        let waiter = match admission.register(fingerprint(1)) {
            Admission::Join(rx) => rx,
            _ => unreachable!(),
        };

        admission.complete(ticket, Err(GenerateError::Internal("boom".to_string())));
        assert!(await_joined(waiter).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_builder() {
        let admission = Arc::new(TileAdmission::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let admission = Arc::clone(&admission);
            handles.push(tokio::spawn(async move {
                matches!(admission.register(fingerprint(5)), Admission::Build(_))
            }));
        }
        let results = futures::future::join_all(handles).await;
        let builders = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(builders, 1);

        let stats = admission.stats();
        assert_eq!(stats.total, 16);
        assert_eq!(stats.built, 1);
        assert_eq!(stats.joined, 15);
    }

    #[tokio::test]
    async fn test_cancel_drops_waiters() {
        let admission = TileAdmission::new();
        let ticket = match admission.register(fingerprint(1)) {
            Admission::Build(ticket) => ticket,
            _ => unreachable!(),
        };
        let waiter = match admission.register(fingerprint(1)) {
            Admission::Join(rx) => rx,
            _ => unreachable!(),
        };
        admission.cancel(ticket);
        assert!(matches!(
            await_joined(waiter).await,
            Err(GenerateError::Cancelled)
        ));
    }
}
