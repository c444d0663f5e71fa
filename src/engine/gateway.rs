// Request orchestration: locator -> blocklist -> session -> range -> bridge.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bridge::StreamBridge;
use super::connection::ConnectionRegistry;
use super::registry::SessionRegistry;
use super::session::SessionLease;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::locator::{Blocklist, Locator};
use crate::server::range::{negotiate, Negotiated};
use crate::swarm::traits::SwarmEngine;

/// A negotiated request holding a session reference, not yet streaming.
pub struct PreparedStream {
    pub lease: SessionLease,
    pub negotiated: Negotiated,
}

/// Process-wide gateway state, constructed once at startup.
pub struct Gateway {
    config: GatewayConfig,
    blocklist: Blocklist,
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig, engine: Arc<dyn SwarmEngine>) -> Result<Self> {
        let blocklist = Blocklist::from_entries(&config.blocked_hashes)?;
        let sessions = Arc::new(SessionRegistry::new(engine, config.session_ttl()));
        info!(
            "gateway configured: timeout={}s ttl={}s trackers={} blocked={}",
            config.resolve_timeout_secs,
            config.session_ttl_secs,
            config.trackers.len(),
            blocklist.len()
        );
        Ok(Self {
            config,
            blocklist,
            sessions,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Parse and canonicalize, then refuse blocked content. No swarm work happens here.
    pub fn admit(&self, raw: Option<&str>) -> Result<Locator, GatewayError> {
        let raw = raw
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| GatewayError::InvalidLocator("magnet parameter is required".into()))?;
        let locator = Locator::parse(raw, &self.config.trackers)?;
        self.blocklist.check(locator.info_hash())?;
        Ok(locator)
    }

    /// Resolve the session and take a reference on it.
    pub async fn acquire(&self, locator: &Locator) -> Result<SessionLease, GatewayError> {
        // A second pass covers an eviction landing between resolve and lease.
        for _ in 0..2 {
            let session = self
                .sessions
                .resolve(locator, self.config.resolve_timeout())
                .await?;
            if let Some(lease) = self.sessions.lease(&session) {
                return Ok(lease);
            }
            debug!("session {} evicted before lease", locator.info_hash());
        }
        Err(GatewayError::Internal(format!(
            "session {} could not be leased",
            locator.info_hash()
        )))
    }

    /// Everything short of opening a byte source: admission, resolution, negotiation.
    pub async fn prepare(
        &self,
        raw: Option<&str>,
        range: Option<&str>,
    ) -> Result<PreparedStream, GatewayError> {
        let locator = self.admit(raw)?;
        let lease = self.acquire(&locator).await?;
        let negotiated = negotiate(
            range,
            lease.session().file_length(),
            self.config.open_ended_cap(),
        )?;
        debug!(
            "negotiated {} range={:?} window={:?} partial={}",
            locator.info_hash(),
            range,
            negotiated.window,
            negotiated.partial
        );
        Ok(PreparedStream { lease, negotiated })
    }

    /// Open a bridge for a prepared request. `None` when there are no bytes to send.
    pub async fn open_stream(
        &self,
        prepared: PreparedStream,
    ) -> Result<Option<StreamBridge>, GatewayError> {
        let Some(window) = prepared.negotiated.window else {
            return Ok(None);
        };
        let bridge = StreamBridge::open(
            Arc::clone(&self.connections),
            prepared.lease,
            window,
            self.config.read_chunk_bytes,
        )
        .await?;
        Ok(Some(bridge))
    }

    /// Start the session and connection sweepers.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.sessions
                .spawn_sweeper(self.config.session_sweep_interval(), self.shutdown.clone()),
            self.connections
                .spawn_sweeper(self.config.connection_sweep_interval(), self.shutdown.clone()),
        ]
    }

    /// Stop the sweepers, cancel live connections and destroy swarm handles.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.cancel_all();
        self.connections.sweep();
        self.sessions.shutdown();
    }
}
