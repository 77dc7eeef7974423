//! Worker registry.
//!
//! Tracks every worker the master knows about, owns their status
//! transitions, and hands out atomic claims for dispatch. Each worker sits
//! behind its own lock so claims against distinct workers do not serialize;
//! the outer map lock is only ever held to look slots up.

use chrono::{DateTime, Utc};
use kiln_core::capability::CapabilityRequirement;
use kiln_core::ports::WorkerLink;
use kiln_core::worker::{DisconnectReason, Worker, WorkerRegistration, WorkerStatus};
use kiln_core::{Error, RequestId, Result, WorkerId};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

struct WorkerSlot {
    worker: Worker,
    link: Option<Arc<dyn WorkerLink>>,
}

/// A successful claim: the worker is now busy and owned by the request.
pub struct ClaimedWorker {
    pub id: WorkerId,
    pub name: String,
    pub link: Arc<dyn WorkerLink>,
}

/// Outcome of marking a worker disconnected.
pub struct DisconnectedWorker {
    pub in_flight: Option<RequestId>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<Mutex<WorkerSlot>>>>,
    expected_digest: [u8; 32],
}

impl WorkerRegistry {
    /// `credential` is the shared secret every worker must present.
    pub fn new(credential: &str) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            expected_digest: digest(credential),
        }
    }

    /// Check a presented credential against the shared secret. Only
    /// digests are compared; the clear credential is never kept.
    pub fn authenticate(&self, name: &str, credential: &str) -> Result<()> {
        if digest(credential) != self.expected_digest {
            return Err(Error::AuthFailure(name.to_string()));
        }
        Ok(())
    }

    /// Register a connecting worker. Fails with `AuthFailure` on a bad
    /// credential and `DuplicateWorker` if the name is already connected.
    /// A worker that previously disconnected may register again under the
    /// same name.
    pub async fn register(
        &self,
        registration: WorkerRegistration,
        link: Arc<dyn WorkerLink>,
    ) -> Result<Worker> {
        self.authenticate(&registration.name, &registration.credential)?;

        let mut workers = self.workers.write().await;
        if let Some(slot) = workers.get(&registration.name) {
            let guard = slot.lock().await;
            if guard.worker.status != WorkerStatus::Disconnected {
                return Err(Error::DuplicateWorker(registration.name));
            }
        }

        let now = Utc::now();
        let worker = Worker {
            id: WorkerId::new(),
            name: registration.name.clone(),
            capabilities: registration.capabilities,
            version: registration.version,
            status: WorkerStatus::Idle,
            current_request_id: None,
            registered_at: now,
            last_heartbeat_at: Some(now),
            last_assigned_at: None,
        };
        let slot = WorkerSlot {
            worker: worker.clone(),
            link: Some(link),
        };
        workers.insert(registration.name, Arc::new(Mutex::new(slot)));
        debug!(worker = %worker.name, "worker registered");
        Ok(worker)
    }

    /// Atomically claim the least-recently-assigned idle worker whose
    /// capability set covers `requirement`. The claim and the busy-marking
    /// happen under the worker's own lock, so two concurrent dispatch
    /// attempts can never claim the same worker.
    pub async fn claim_capable(
        &self,
        requirement: &CapabilityRequirement,
        request_id: RequestId,
    ) -> Option<ClaimedWorker> {
        let candidates: Vec<Arc<Mutex<WorkerSlot>>> =
            self.workers.read().await.values().cloned().collect();

        let mut ranked = Vec::new();
        for slot in candidates {
            let guard = slot.lock().await;
            if guard.worker.status.is_available() && guard.worker.capabilities.satisfies(requirement)
            {
                ranked.push((
                    guard.worker.last_assigned_at,
                    guard.worker.name.clone(),
                    slot.clone(),
                ));
            }
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, _, slot) in ranked {
            let mut guard = slot.lock().await;
            // Ranked without the lock held, so re-check before claiming.
            if !guard.worker.status.is_available()
                || !guard.worker.capabilities.satisfies(requirement)
            {
                continue;
            }
            let Some(link) = guard.link.clone() else {
                continue;
            };
            guard.worker.status = WorkerStatus::Busy;
            guard.worker.current_request_id = Some(request_id);
            guard.worker.last_assigned_at = Some(Utc::now());
            return Some(ClaimedWorker {
                id: guard.worker.id,
                name: guard.worker.name.clone(),
                link,
            });
        }
        None
    }

    /// Return a worker to the idle pool. A no-op for disconnected workers.
    pub async fn mark_idle(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut guard = slot.lock().await;
        if guard.worker.status == WorkerStatus::Disconnected {
            return Ok(());
        }
        guard.worker.status = WorkerStatus::Idle;
        guard.worker.current_request_id = None;
        Ok(())
    }

    /// Mark a worker disconnected and surrender its in-flight request, if
    /// any, so the dispatcher can requeue it. Idempotent: a second call for
    /// the same outage returns `None`.
    pub async fn mark_disconnected(
        &self,
        name: &str,
        reason: DisconnectReason,
    ) -> Option<DisconnectedWorker> {
        let workers = self.workers.read().await;
        let slot = workers.get(name)?.clone();
        drop(workers);

        let mut guard = slot.lock().await;
        if guard.worker.status == WorkerStatus::Disconnected {
            return None;
        }
        guard.worker.status = WorkerStatus::Disconnected;
        guard.link = None;
        let in_flight = guard.worker.current_request_id.take();
        debug!(worker = name, reason = ?reason, "worker disconnected");
        Some(DisconnectedWorker {
            in_flight,
            last_heartbeat_at: guard.worker.last_heartbeat_at,
        })
    }

    /// Record a liveness signal.
    pub async fn record_heartbeat(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut guard = slot.lock().await;
        guard.worker.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    /// Names of connected workers whose last heartbeat is older than
    /// `threshold_seconds`.
    pub async fn stale_workers(&self, threshold_seconds: u64) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::seconds(threshold_seconds as i64);
        let slots: Vec<Arc<Mutex<WorkerSlot>>> =
            self.workers.read().await.values().cloned().collect();

        let mut stale = Vec::new();
        for slot in slots {
            let guard = slot.lock().await;
            if guard.worker.status == WorkerStatus::Disconnected {
                continue;
            }
            let last_seen = guard.worker.last_heartbeat_at.unwrap_or(guard.worker.registered_at);
            if last_seen < cutoff {
                stale.push(guard.worker.name.clone());
            }
        }
        stale
    }

    /// Snapshot of one worker.
    pub async fn get(&self, name: &str) -> Option<Worker> {
        let workers = self.workers.read().await;
        let slot = workers.get(name)?.clone();
        drop(workers);
        Some(slot.lock().await.worker.clone())
    }

    /// Snapshot of the whole fleet, name-ordered.
    pub async fn list(&self) -> Vec<Worker> {
        let slots: Vec<Arc<Mutex<WorkerSlot>>> =
            self.workers.read().await.values().cloned().collect();
        let mut all = Vec::with_capacity(slots.len());
        for slot in slots {
            all.push(slot.lock().await.worker.clone());
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Live link for a connected worker.
    pub async fn link_of(&self, name: &str) -> Option<Arc<dyn WorkerLink>> {
        let workers = self.workers.read().await;
        let slot = workers.get(name)?.clone();
        drop(workers);
        let guard = slot.lock().await;
        guard.link.clone()
    }

    async fn slot(&self, name: &str) -> Result<Arc<Mutex<WorkerSlot>>> {
        self.workers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))
    }
}

fn digest(credential: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::capability::{Arch, CapabilitySet, Platform};
    use kiln_core::protocol::AssignFrame;

    struct NullLink;

    #[async_trait]
    impl WorkerLink for NullLink {
        async fn assign(&self, _order: AssignFrame) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self, _request_id: RequestId) -> Result<()> {
            Ok(())
        }
    }

    fn registration(name: &str, credential: &str) -> WorkerRegistration {
        WorkerRegistration {
            name: name.to_string(),
            credential: credential.to_string(),
            capabilities: CapabilitySet {
                platform: Platform::Linux,
                arch: Arch::X64,
                tags: vec!["python3".to_string()],
            },
            version: Some("0.1.0".to_string()),
        }
    }

    fn requirement() -> CapabilityRequirement {
        CapabilityRequirement {
            platform: Platform::Linux,
            arch: Arch::X64,
            tags: vec![],
        }
    }

    async fn register(registry: &WorkerRegistry, name: &str) -> Worker {
        registry
            .register(registration(name, "secret"), Arc::new(NullLink))
            .await
            .unwrap()
    }

    #[test]
    fn test_authenticate_compares_digests() {
        let registry = WorkerRegistry::new("secret");
        assert!(registry.authenticate("w1", "secret").is_ok());
        assert!(matches!(
            registry.authenticate("w1", "wrong").unwrap_err(),
            Error::AuthFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_credential() {
        let registry = WorkerRegistry::new("secret");
        let err = registry
            .register(registration("w1", "wrong"), Arc::new(NullLink))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_name() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w1").await;
        let err = registry
            .register(registration("w1", "secret"), Arc::new(NullLink))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateWorker(_)));
    }

    #[tokio::test]
    async fn test_reregister_after_disconnect() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w1").await;
        registry
            .mark_disconnected("w1", DisconnectReason::Error)
            .await
            .unwrap();
        let worker = registry
            .register(registration("w1", "secret"), Arc::new(NullLink))
            .await
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w1").await;

        let first = registry
            .claim_capable(&requirement(), RequestId::new())
            .await;
        assert!(first.is_some());

        let second = registry
            .claim_capable(&requirement(), RequestId::new())
            .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_claim_prefers_least_recently_assigned() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w-a").await;
        register(&registry, "w-b").await;

        let first = registry
            .claim_capable(&requirement(), RequestId::new())
            .await
            .unwrap();
        assert_eq!(first.name, "w-a");
        registry.mark_idle("w-a").await.unwrap();

        // w-b has never been assigned, so it goes next even though w-a is idle.
        let second = registry
            .claim_capable(&requirement(), RequestId::new())
            .await
            .unwrap();
        assert_eq!(second.name, "w-b");
        registry.mark_idle("w-b").await.unwrap();

        // Both assigned once; the earlier assignment wins.
        let third = registry
            .claim_capable(&requirement(), RequestId::new())
            .await
            .unwrap();
        assert_eq!(third.name, "w-a");
    }

    #[tokio::test]
    async fn test_claim_skips_non_matching_capabilities() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w1").await;

        let mut needs_windows = requirement();
        needs_windows.platform = Platform::Windows;
        assert!(registry
            .claim_capable(&needs_windows, RequestId::new())
            .await
            .is_none());

        let mut needs_tag = requirement();
        needs_tag.tags = vec!["valgrind".to_string()];
        assert!(registry
            .claim_capable(&needs_tag, RequestId::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_disconnected_surrenders_in_flight() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w1").await;
        let request_id = RequestId::new();
        registry
            .claim_capable(&requirement(), request_id)
            .await
            .unwrap();

        let outcome = registry
            .mark_disconnected("w1", DisconnectReason::Error)
            .await
            .unwrap();
        assert_eq!(outcome.in_flight, Some(request_id));

        // Second call for the same outage reports nothing.
        assert!(registry
            .mark_disconnected("w1", DisconnectReason::Error)
            .await
            .is_none());

        // Disconnected workers are not claimable.
        assert!(registry
            .claim_capable(&requirement(), RequestId::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_workers() {
        let registry = WorkerRegistry::new("secret");
        register(&registry, "w1").await;
        assert!(registry.stale_workers(3600).await.is_empty());
        // A zero threshold makes any heartbeat in the past stale.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(registry.stale_workers(0).await, vec!["w1".to_string()]);
    }
}
