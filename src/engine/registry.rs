// Session registry: single-flight swarm resolution keyed by info hash, plus idle eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{pick_playable_file, Session, SessionLease, SessionState};
use crate::error::GatewayError;
use crate::locator::{InfoHash, Locator};
use crate::swarm::traits::SwarmEngine;

type Resolution = Result<Arc<Session>, GatewayError>;

enum Slot {
    /// Waiters clone the receiver and observe the single outcome.
    Resolving(watch::Receiver<Option<Resolution>>),
    Ready(Arc<Session>),
}

pub struct SessionRegistry {
    engine: Arc<dyn SwarmEngine>,
    slots: RwLock<HashMap<InfoHash, Slot>>,
    ttl: Duration,
    /// Set under the write lock by `shutdown`; late resolutions are discarded.
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn SwarmEngine>, ttl: Duration) -> Self {
        Self {
            engine,
            slots: RwLock::new(HashMap::new()),
            ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// Return the ready session for the locator's info hash, joining the swarm at most once.
    ///
    /// Concurrent callers for the same hash share one join and one outcome. Failures are
    /// delivered to every attached caller and leave no entry behind.
    pub async fn resolve(
        self: &Arc<Self>,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Arc<Session>, GatewayError> {
        let info_hash = locator.info_hash();

        if let Some(Slot::Ready(session)) = self.slots.read().get(info_hash) {
            session.touch();
            return Ok(Arc::clone(session));
        }

        let mut rx = {
            let mut slots = self.slots.write();
            match slots.get(info_hash) {
                Some(Slot::Ready(session)) => {
                    session.touch();
                    return Ok(Arc::clone(session));
                }
                Some(Slot::Resolving(rx)) => {
                    debug!("attaching to in-flight resolution {}", info_hash);
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(info_hash.clone(), Slot::Resolving(rx.clone()));
                    // Detached so the outcome still lands if the first caller goes away.
                    let guard = ResolvingGuard {
                        registry: Arc::clone(self),
                        info_hash: info_hash.clone(),
                        armed: true,
                    };
                    tokio::spawn(run_resolution(guard, locator.clone(), timeout, tx));
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone())
            .map_err(|_| GatewayError::Internal("resolution ended without an outcome".into()))?;
        outcome.unwrap_or_else(|| Err(GatewayError::Internal("empty resolution outcome".into())))
    }

    /// Take an active reference on `session` if it is still the registered ready session.
    ///
    /// Runs under the registry lock, so an eviction sweep can never remove a session
    /// between the reference check and the increment.
    pub fn lease(&self, session: &Arc<Session>) -> Option<SessionLease> {
        let slots = self.slots.read();
        match slots.get(session.info_hash()) {
            Some(Slot::Ready(current)) if Arc::ptr_eq(current, session) => Some(session.lease()),
            _ => None,
        }
    }

    /// Remove ready sessions that have no active connections and exceeded the TTL.
    pub fn evict_idle(&self) -> Vec<InfoHash> {
        let now = Instant::now();
        let evicted: Vec<Arc<Session>> = {
            let mut slots = self.slots.write();
            let expired: Vec<InfoHash> = slots
                .iter()
                .filter_map(|(hash, slot)| match slot {
                    Slot::Ready(session) if session.is_idle(now, self.ttl) => Some(hash.clone()),
                    _ => None,
                })
                .collect();
            expired
                .iter()
                .filter_map(|hash| match slots.remove(hash) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        for session in &evicted {
            info!(
                "evicting idle session {} age={}s",
                session.info_hash(),
                now.saturating_duration_since(session.created_at()).as_secs()
            );
            session.handle().destroy();
        }
        evicted.iter().map(|s| s.info_hash().clone()).collect()
    }

    /// Run `evict_idle` every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle();
                        if !evicted.is_empty() {
                            debug!("session sweep evicted {}", evicted.len());
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    pub fn state(&self, info_hash: &InfoHash) -> Option<SessionState> {
        match self.slots.read().get(info_hash)? {
            Slot::Resolving(_) => Some(SessionState::Resolving),
            Slot::Ready(_) => Some(SessionState::Ready),
        }
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<Session>> {
        match self.slots.read().get(info_hash)? {
            Slot::Ready(session) => Some(Arc::clone(session)),
            Slot::Resolving(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Destroy every ready swarm handle. Best effort, used at process shutdown.
    ///
    /// Resolutions still in flight are destroyed when they complete.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut slots = self.slots.write();
            self.closed.store(true, Ordering::SeqCst);
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(session) => Some(session),
                    Slot::Resolving(_) => None,
                })
                .collect()
        };
        for session in sessions {
            session.handle().destroy();
        }
    }
}

/// Removes the `Resolving` slot if the resolution task ends without publishing.
struct ResolvingGuard {
    registry: Arc<SessionRegistry>,
    info_hash: InfoHash,
    armed: bool,
}

impl ResolvingGuard {
    /// Record the outcome in the map. A session that lands after shutdown is
    /// destroyed and reported to waiters as an error.
    fn publish(mut self, outcome: Resolution) -> Resolution {
        self.armed = false;
        let orphaned = {
            let mut slots = self.registry.slots.write();
            match &outcome {
                Ok(session) if !self.registry.closed.load(Ordering::SeqCst) => {
                    slots.insert(self.info_hash.clone(), Slot::Ready(Arc::clone(session)));
                    None
                }
                Ok(session) => Some(Arc::clone(session)),
                Err(_) => {
                    slots.remove(&self.info_hash);
                    None
                }
            }
        };
        match orphaned {
            Some(session) => {
                warn!("session {} ready after shutdown, destroying", self.info_hash);
                session.handle().destroy();
                Err(GatewayError::Internal("session registry is shut down".into()))
            }
            None => outcome,
        }
    }
}

impl Drop for ResolvingGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("resolution for {} abandoned", self.info_hash);
            let mut slots = self.registry.slots.write();
            if matches!(slots.get(&self.info_hash), Some(Slot::Resolving(_))) {
                slots.remove(&self.info_hash);
            }
        }
    }
}

async fn run_resolution(
    guard: ResolvingGuard,
    locator: Locator,
    timeout: Duration,
    tx: watch::Sender<Option<Resolution>>,
) {
    let outcome = establish(guard.registry.engine.as_ref(), &locator, timeout).await;
    match &outcome {
        Ok(session) => info!(
            "session ready {} file={} length={}",
            session.info_hash(),
            session.file().name,
            session.file_length()
        ),
        Err(e) => warn!("resolution failed {}: {}", locator.info_hash(), e),
    }
    // Registry first, so a caller woken by a failure re-attempts instead of re-attaching.
    let outcome = guard.publish(outcome);
    tx.send_replace(Some(outcome));
}

/// Join the swarm and race readiness against the timeout.
async fn establish(
    engine: &dyn SwarmEngine,
    locator: &Locator,
    timeout: Duration,
) -> Resolution {
    let info_hash = locator.info_hash().clone();
    debug!("joining swarm {}", info_hash);
    let handle = engine
        .join(locator)
        .map_err(|e| GatewayError::ResolutionError {
            message: format!("{:#}", e),
        })?;

    // Dropping the losing branch drops the readiness wait with it.
    let outcome = match tokio::time::timeout(timeout, handle.ready()).await {
        Err(_) => Err(GatewayError::ResolutionTimeout { timeout }),
        Ok(Err(e)) => Err(GatewayError::ResolutionError {
            message: format!("{:#}", e),
        }),
        Ok(Ok(())) => match pick_playable_file(&handle.files()) {
            Some(file) => Ok(Arc::new(Session::new(info_hash, Arc::clone(&handle), file))),
            None => Err(GatewayError::NoPlayableFile),
        },
    };
    if outcome.is_err() {
        handle.destroy();
    }
    outcome
}
