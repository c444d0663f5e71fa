// In-process swarm engine serving files from memory, with scripted readiness.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Sleep;

use super::traits::{ByteSource, SwarmEngine, SwarmFile, SwarmHandle};
use crate::locator::{InfoHash, Locator};

const DEFAULT_READ_SIZE: usize = 16 * 1024;

/// How a joined swarm reaches (or fails to reach) the ready state.
#[derive(Debug, Clone)]
pub enum Readiness {
    Immediate,
    After(Duration),
    Never,
    Fail(String),
}

/// Content and behavior for one info hash.
#[derive(Debug, Clone)]
pub struct MemoryTorrent {
    files: Vec<(String, Bytes)>,
    readiness: Readiness,
    pace: Option<Duration>,
    read_size: usize,
    fail_after: Option<usize>,
}

impl MemoryTorrent {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            readiness: Readiness::Immediate,
            pace: None,
            read_size: DEFAULT_READ_SIZE,
            fail_after: None,
        }
    }

    pub fn file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push((name.into(), data.into()));
        self
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Delay every read by `pace`, simulating a slow swarm.
    pub fn paced(mut self, pace: Duration, read_size: usize) -> Self {
        self.pace = Some(pace);
        self.read_size = read_size.max(1);
        self
    }

    /// Byte sources fail with an I/O error once `bytes` have been read.
    pub fn fail_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }
}

impl Default for MemoryTorrent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Counters {
    joins: AtomicUsize,
    live_sources: AtomicUsize,
    destroyed_sources: AtomicUsize,
    destroyed_handles: AtomicUsize,
}

/// Unknown info hashes join a swarm that never becomes ready.
#[derive(Default)]
pub struct MemorySwarm {
    torrents: RwLock<HashMap<InfoHash, MemoryTorrent>>,
    counters: Arc<Counters>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info_hash: InfoHash, torrent: MemoryTorrent) {
        self.torrents.write().insert(info_hash, torrent);
    }

    pub fn join_count(&self) -> usize {
        self.counters.joins.load(Ordering::SeqCst)
    }

    /// Byte sources opened and not yet dropped.
    pub fn live_sources(&self) -> usize {
        self.counters.live_sources.load(Ordering::SeqCst)
    }

    pub fn destroyed_sources(&self) -> usize {
        self.counters.destroyed_sources.load(Ordering::SeqCst)
    }

    pub fn destroyed_handles(&self) -> usize {
        self.counters.destroyed_handles.load(Ordering::SeqCst)
    }
}

impl SwarmEngine for MemorySwarm {
    fn join(&self, locator: &Locator) -> Result<Arc<dyn SwarmHandle>> {
        self.counters.joins.fetch_add(1, Ordering::SeqCst);
        let torrent = self
            .torrents
            .read()
            .get(locator.info_hash())
            .cloned()
            .unwrap_or_else(|| MemoryTorrent::new().readiness(Readiness::Never));
        Ok(Arc::new(MemoryHandle {
            torrent,
            counters: Arc::clone(&self.counters),
            ready: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct MemoryHandle {
    torrent: MemoryTorrent,
    counters: Arc<Counters>,
    ready: AtomicBool,
    destroyed: AtomicBool,
}

#[async_trait]
impl SwarmHandle for MemoryHandle {
    async fn ready(&self) -> Result<()> {
        match &self.torrent.readiness {
            Readiness::Immediate => {}
            Readiness::After(delay) => tokio::time::sleep(*delay).await,
            Readiness::Never => std::future::pending::<()>().await,
            Readiness::Fail(message) => return Err(anyhow!("{}", message)),
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn files(&self) -> Vec<SwarmFile> {
        if !self.ready.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.torrent
            .files
            .iter()
            .enumerate()
            .map(|(index, (name, data))| SwarmFile {
                index,
                name: name.clone(),
                length: data.len() as u64,
            })
            .collect()
    }

    async fn open_byte_stream(
        &self,
        file: &SwarmFile,
        start: u64,
        end: u64,
    ) -> Result<ByteSource> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(anyhow!("swarm already destroyed"));
        }
        let (_, data) = self
            .torrent
            .files
            .get(file.index)
            .ok_or_else(|| anyhow!("no file at index {}", file.index))?;
        if start > end || end >= data.len() as u64 {
            return Err(anyhow!(
                "window [{}, {}] outside file of {} bytes",
                start,
                end,
                data.len()
            ));
        }

        self.counters.live_sources.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(MemorySource {
            data: data.slice(start as usize..=end as usize),
            pos: 0,
            read_size: self.torrent.read_size,
            pace: self.torrent.pace,
            sleep: None,
            fail_after: self.torrent.fail_after,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.counters.destroyed_handles.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MemorySource {
    data: Bytes,
    pos: usize,
    read_size: usize,
    pace: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    fail_after: Option<usize>,
    counters: Arc<Counters>,
}

impl AsyncRead for MemorySource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fail_after.is_some_and(|limit| this.pos >= limit) {
            return Poll::Ready(Err(io::Error::other("injected source failure")));
        }
        if this.pos >= this.data.len() {
            return Poll::Ready(Ok(()));
        }
        if let Some(pace) = this.pace {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(pace)));
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
        }

        let mut n = this
            .read_size
            .min(this.data.len() - this.pos)
            .min(buf.remaining());
        if let Some(limit) = this.fail_after {
            n = n.min(limit - this.pos);
        }
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.counters.live_sources.fetch_sub(1, Ordering::SeqCst);
        self.counters.destroyed_sources.fetch_add(1, Ordering::SeqCst);
    }
}
