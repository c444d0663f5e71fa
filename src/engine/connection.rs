// Connection registry: tracks live stream bridges and sweeps ones whose endpoints closed.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::Take;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::session::SessionLease;
use crate::locator::InfoHash;
use crate::swarm::traits::ByteSource;

/// Chunked reader over one window of a swarm byte source.
pub(crate) type SourceStream = ReaderStream<Take<ByteSource>>;

/// Inclusive byte window `[start, end]` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Streaming = 0,
    Closed = 1,
    Aborted = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Streaming,
            1 => ConnectionState::Closed,
            _ => ConnectionState::Aborted,
        }
    }
}

/// One accepted stream request against a ready session.
pub struct Connection {
    id: String,
    info_hash: InfoHash,
    window: ByteWindow,
    state: AtomicU8,
    lease: Mutex<Option<SessionLease>>,
    source: Mutex<Option<SourceStream>>,
    cancel: CancellationToken,
    source_closed: AtomicBool,
    sink_closed: AtomicBool,
    bytes_sent: AtomicU64,
    opened_at: Instant,
}

impl Connection {
    fn new(lease: SessionLease, window: ByteWindow) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            info_hash: lease.session().info_hash().clone(),
            window,
            state: AtomicU8::new(ConnectionState::Streaming as u8),
            lease: Mutex::new(Some(lease)),
            source: Mutex::new(None),
            cancel: CancellationToken::new(),
            source_closed: AtomicBool::new(false),
            sink_closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn window(&self) -> ByteWindow {
        self.window
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Fires when the connection must tear down its source.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn mark_source_closed(&self) {
        self.source_closed.store(true, Ordering::SeqCst);
    }

    pub fn mark_sink_closed(&self) {
        self.sink_closed.store(true, Ordering::SeqCst);
    }

    /// Either endpoint already reports closed, or teardown was requested.
    pub fn endpoints_closed(&self) -> bool {
        self.source_closed.load(Ordering::SeqCst)
            || self.sink_closed.load(Ordering::SeqCst)
            || self.cancel.is_cancelled()
    }

    pub fn holds_lease(&self) -> bool {
        self.lease.lock().is_some()
    }

    /// The byte source is still open.
    pub fn has_source(&self) -> bool {
        self.source.lock().is_some()
    }

    /// Hand the opened source to the connection. Ignored once terminated.
    pub(crate) fn attach_source(&self, source: SourceStream) {
        // Holding the slot while checking the lease orders this against `terminate`.
        let mut slot = self.source.lock();
        if self.lease.lock().is_some() {
            *slot = Some(source);
        }
    }

    /// Pull the next chunk. `None` once the source is exhausted or was released.
    pub(crate) fn poll_source(&self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        match self.source.lock().as_mut() {
            Some(source) => Pin::new(source).poll_next(cx),
            None => Poll::Ready(None),
        }
    }

    /// Destroy the byte source, release the session reference and record the final
    /// state. Returns `false` if the connection had already been terminated.
    fn terminate(&self, state: ConnectionState) -> bool {
        let lease = self.lease.lock().take();
        if lease.is_none() {
            return false;
        }
        self.state.store(state as u8, Ordering::SeqCst);
        self.cancel.cancel();
        let source = self.source.lock().take();
        drop(source);
        self.source_closed.store(true, Ordering::SeqCst);
        self.sink_closed.store(true, Ordering::SeqCst);
        drop(lease);
        true
    }
}

/// Live connections by id. The sweep is a safety net; bridges deregister themselves.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a connection holding `lease`.
    pub fn open(&self, lease: SessionLease, window: ByteWindow) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(lease, window));
        self.connections
            .lock()
            .insert(conn.id.clone(), Arc::clone(&conn));
        debug!(
            "connection {} opened {} window=[{}, {}]",
            conn.id, conn.info_hash, window.start, window.end
        );
        conn
    }

    /// Terminate and deregister. Only the first call for a connection has any effect.
    pub fn close(&self, conn: &Connection, state: ConnectionState) -> bool {
        self.connections.lock().remove(&conn.id);
        if !conn.terminate(state) {
            return false;
        }
        info!(
            "connection {} {} {:?} bytes={} elapsed_ms={}",
            conn.id,
            conn.info_hash,
            state,
            conn.bytes_sent(),
            conn.opened_at.elapsed().as_millis()
        );
        true
    }

    /// Remove connections whose source or sink already closed and force-release them.
    pub fn sweep(&self) -> usize {
        let stale: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            let ids: Vec<String> = connections
                .iter()
                .filter(|(_, c)| c.endpoints_closed())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        for conn in &stale {
            if conn.terminate(ConnectionState::Aborted) {
                info!("connection {} reclaimed by sweep", conn.id);
            }
        }
        stale.len()
    }

    /// Run `sweep` every `interval` until `shutdown` fires.
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
                        let reclaimed = registry.sweep();
                        if reclaimed > 0 {
                            debug!("connection sweep reclaimed {}", reclaimed);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Cancel every live connection, used at shutdown.
    pub fn cancel_all(&self) {
        for conn in self.connections.lock().values() {
            conn.cancel.cancel();
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::Session;
    use crate::locator::Locator;
    use crate::swarm::memory::MemorySwarm;
    use crate::swarm::traits::{SwarmEngine, SwarmFile};

    fn lease() -> (Arc<Session>, SessionLease) {
        let locator = Locator::parse(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
            &[],
        )
        .unwrap();
        let handle = MemorySwarm::new().join(&locator).unwrap();
        let file = SwarmFile {
            index: 0,
            name: "a.mp4".to_string(),
            length: 1000,
        };
        let session = Arc::new(Session::new(locator.info_hash().clone(), handle, file));
        let lease = session.lease();
        (session, lease)
    }

    #[test]
    fn test_window_len_is_inclusive() {
        assert_eq!(ByteWindow { start: 0, end: 0 }.len(), 1);
        assert_eq!(ByteWindow { start: 10, end: 109 }.len(), 100);
    }

    #[tokio::test]
    async fn test_close_releases_lease_once() {
        let (session, lease) = lease();
        let registry = ConnectionRegistry::new();
        let conn = registry.open(lease, ByteWindow { start: 0, end: 99 });
        assert_eq!(conn.state(), ConnectionState::Streaming);
        assert!(!conn.endpoints_closed());
        assert_eq!(session.active_connections(), 1);

        assert!(registry.close(&conn, ConnectionState::Closed));
        assert!(!registry.close(&conn, ConnectionState::Aborted));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.cancel_token().is_cancelled());
        assert_eq!(session.active_connections(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_live_connections() {
        let (session, lease) = lease();
        let registry = ConnectionRegistry::new();
        let conn = registry.open(lease, ByteWindow { start: 0, end: 99 });

        assert_eq!(registry.sweep(), 0);
        conn.mark_source_closed();
        assert_eq!(registry.sweep(), 1);
        assert_eq!(conn.state(), ConnectionState::Aborted);
        assert_eq!(session.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_marks_for_sweep() {
        let registry = ConnectionRegistry::new();
        let (_a, first) = lease();
        let (_b, second) = lease();
        registry.open(first, ByteWindow { start: 0, end: 9 });
        registry.open(second, ByteWindow { start: 0, end: 9 });

        registry.cancel_all();
        assert_eq!(registry.sweep(), 2);
        assert!(registry.is_empty());
    }
}
