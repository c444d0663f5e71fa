// Swarm session: one resolved swarm handle and the file chosen for playback.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::VIDEO_EXTENSIONS;
use crate::locator::InfoHash;
use crate::swarm::traits::{SwarmFile, SwarmHandle};

/// Lifecycle of a registry entry. Failed resolutions are never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Ready,
}

pub struct Session {
    info_hash: InfoHash,
    handle: Arc<dyn SwarmHandle>,
    file: SwarmFile,
    created_at: Instant,
    last_access: Mutex<Instant>,
    active: AtomicUsize,
}

impl Session {
    pub(crate) fn new(info_hash: InfoHash, handle: Arc<dyn SwarmHandle>, file: SwarmFile) -> Self {
        let now = Instant::now();
        Self {
            info_hash,
            handle,
            file,
            created_at: now,
            last_access: Mutex::new(now),
            active: AtomicUsize::new(0),
        }
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn handle(&self) -> &Arc<dyn SwarmHandle> {
        &self.handle
    }

    pub fn file(&self) -> &SwarmFile {
        &self.file
    }

    pub fn file_length(&self) -> u64 {
        self.file.length
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Number of live connections holding a lease on this session.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Unreferenced and untouched for longer than `ttl`.
    pub(crate) fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.active_connections() == 0 && now.saturating_duration_since(self.last_access()) > ttl
    }

    /// Callers must hold the registry lock so this cannot race an eviction.
    pub(crate) fn lease(self: &Arc<Self>) -> SessionLease {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.touch();
        SessionLease {
            session: Arc::clone(self),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("info_hash", &self.info_hash)
            .field("file", &self.file)
            .field("active", &self.active_connections())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("session {} dropped", self.info_hash);
    }
}

/// One active reference to a session. Dropping it releases the reference exactly once.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // Touch first so idle age counts from the end of the last connection.
        self.session.touch();
        self.session.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// First file with a known video extension, else the first file.
pub fn pick_playable_file(files: &[SwarmFile]) -> Option<SwarmFile> {
    files
        .iter()
        .find(|f| has_video_extension(&f.name))
        .or_else(|| files.first())
        .cloned()
}

fn has_video_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
