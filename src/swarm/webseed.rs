// Web-seed swarm engine: serves a magnet's `ws` URLs through ranged HTTP requests.

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode, Url};
use tokio::sync::OnceCell;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{ByteSource, SwarmEngine, SwarmFile, SwarmHandle};
use crate::locator::{InfoHash, Locator};

pub struct WebSeedEngine {
    client: Client,
}

impl WebSeedEngine {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for WebSeedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmEngine for WebSeedEngine {
    fn join(&self, locator: &Locator) -> Result<Arc<dyn SwarmHandle>> {
        if locator.web_seeds().is_empty() {
            return Err(anyhow!(
                "locator {} carries no web seed (ws=) to fetch from",
                locator.info_hash()
            ));
        }
        debug!(
            "web seed join {} seeds={}",
            locator.info_hash(),
            locator.web_seeds().len()
        );
        Ok(Arc::new(WebSeedHandle {
            client: self.client.clone(),
            info_hash: locator.info_hash().clone(),
            display_name: locator.display_name().map(str::to_string),
            seeds: locator.web_seeds().to_vec(),
            resolved: OnceCell::new(),
            destroyed: CancellationToken::new(),
        }))
    }
}

struct ResolvedSeed {
    url: String,
    file: SwarmFile,
}

struct WebSeedHandle {
    client: Client,
    info_hash: InfoHash,
    display_name: Option<String>,
    seeds: Vec<String>,
    resolved: OnceCell<Result<ResolvedSeed, String>>,
    destroyed: CancellationToken,
}

impl WebSeedHandle {
    async fn resolve_first_seed(&self) -> Result<ResolvedSeed, String> {
        let mut last_error = String::from("no web seeds");
        for url in &self.seeds {
            match self.probe(url).await {
                Ok(length) => {
                    let name = self
                        .display_name
                        .clone()
                        .or_else(|| file_name_from_url(url))
                        .unwrap_or_else(|| self.info_hash.to_string());
                    info!(
                        "web seed ready {} url={} name={} length={}",
                        self.info_hash, url, name, length
                    );
                    return Ok(ResolvedSeed {
                        url: url.clone(),
                        file: SwarmFile {
                            index: 0,
                            name,
                            length,
                        },
                    });
                }
                Err(e) => {
                    warn!("web seed probe failed url={}: {}", url, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(last_error)
    }

    /// Ask for the first byte and read the total from `Content-Range: bytes 0-0/<total>`.
    async fn probe(&self, url: &str) -> Result<u64> {
        let resp = self.client.get(url).header(RANGE, "bytes=0-0").send().await?;
        let status = resp.status();
        debug!("web seed probe status={} url={}", status.as_u16(), url);

        match status {
            StatusCode::PARTIAL_CONTENT => header_str(&resp, CONTENT_RANGE)
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| anyhow!("probe response has no usable Content-Range")),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // Zero-length files cannot satisfy bytes=0-0.
                Ok(header_str(&resp, CONTENT_RANGE)
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(0))
            }
            s if s.is_success() => Err(anyhow!(
                "web seed ignores range requests (HTTP {})",
                s.as_u16()
            )),
            s => Err(anyhow!("probe failed: HTTP {}", s.as_u16())),
        }
    }
}

#[async_trait]
impl SwarmHandle for WebSeedHandle {
    async fn ready(&self) -> Result<()> {
        let resolved = self
            .resolved
            .get_or_init(|| self.resolve_first_seed())
            .await;
        match resolved {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!("{}", e)),
        }
    }

    fn files(&self) -> Vec<SwarmFile> {
        match self.resolved.get() {
            Some(Ok(seed)) => vec![seed.file.clone()],
            _ => Vec::new(),
        }
    }

    async fn open_byte_stream(
        &self,
        file: &SwarmFile,
        start: u64,
        end: u64,
    ) -> Result<ByteSource> {
        if self.destroyed.is_cancelled() {
            return Err(anyhow!("swarm {} already destroyed", self.info_hash));
        }
        let seed = match self.resolved.get() {
            Some(Ok(seed)) if seed.file.index == file.index => seed,
            _ => return Err(anyhow!("file {} is not available", file.name)),
        };
        if start > end || end >= seed.file.length {
            return Err(anyhow!(
                "window [{}, {}] outside file of {} bytes",
                start,
                end,
                seed.file.length
            ));
        }

        let range = format!("bytes={}-{}", start, end);
        let resp = self
            .client
            .get(&seed.url)
            .header(RANGE, &range)
            .send()
            .await?;

        let status = resp.status();
        let whole_file = start == 0 && end + 1 == seed.file.length;
        if !(status == StatusCode::PARTIAL_CONTENT || (status == StatusCode::OK && whole_file)) {
            warn!(
                "web seed fetch failed status={} range={}",
                status.as_u16(),
                range
            );
            return Err(anyhow!("fetch failed: HTTP {}", status.as_u16()));
        }
        if let Some(len) = header_str(&resp, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok()) {
            if len != end - start + 1 {
                return Err(anyhow!(
                    "web seed returned {} bytes for range {}",
                    len,
                    range
                ));
            }
        }

        let body = resp.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        Ok(Box::pin(StreamReader::new(body)))
    }

    fn destroy(&self) {
        debug!("web seed handle {} destroyed", self.info_hash);
        self.destroyed.cancel();
    }
}

fn header_str(resp: &Response, name: reqwest::header::HeaderName) -> Option<&str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}
