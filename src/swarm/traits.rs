use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::locator::Locator;

/// One file inside a swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmFile {
    pub index: usize,
    pub name: String,
    pub length: u64,
}

/// Readable bytes for a window of one file. Dropping it destroys the source.
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

pub trait SwarmEngine: Send + Sync {
    /// Start joining the swarm named by `locator`. Returns before metadata is known.
    fn join(&self, locator: &Locator) -> Result<Arc<dyn SwarmHandle>>;
}

#[async_trait]
pub trait SwarmHandle: Send + Sync {
    /// Completes exactly once: `Ok` when metadata is available, `Err` on engine failure.
    ///
    /// Dropping the returned future abandons the wait without side effects.
    async fn ready(&self) -> Result<()>;

    /// Files of the swarm. Empty until `ready` has completed successfully.
    fn files(&self) -> Vec<SwarmFile>;

    /// Open the inclusive byte window `[start, end]` of `file`.
    ///
    /// Each call yields an independent read position.
    async fn open_byte_stream(&self, file: &SwarmFile, start: u64, end: u64)
        -> Result<ByteSource>;

    /// Release the swarm. Called once when the owning session goes away.
    fn destroy(&self) {}
}
