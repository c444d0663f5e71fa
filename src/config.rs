use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Port used when neither the config file nor `PORT` names one.
pub const DEFAULT_PORT: u16 = 1111;

/// How long a swarm gets to produce metadata before resolution fails.
pub const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 60;

/// Idle age after which an unreferenced session is evicted (5 minutes).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 300;

/// Interval between idle-session sweeps.
pub const DEFAULT_SESSION_SWEEP_INTERVAL_SECS: u64 = 30;

/// Interval between connection-registry sweeps.
pub const DEFAULT_CONNECTION_SWEEP_INTERVAL_SECS: u64 = 5;

/// Cap for open-ended ranges (`bytes=N-`), 5 MB. Zero disables capping.
pub const DEFAULT_OPEN_ENDED_CHUNK_BYTES: u64 = 5 * 1024 * 1024;

/// Size of each read pulled from a byte source (64 KB).
pub const DEFAULT_READ_CHUNK_BYTES: usize = 64 * 1024;

/// Content type advertised for every stream.
pub const STREAM_CONTENT_TYPE: &str = "video/mp4";

/// Extensions preferred when picking the file to serve from a swarm.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi"];

/// Announce endpoints merged into every locator.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "wss://tracker.openwebtorrent.com",
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://tracker.leechers-paradise.org:6969/announce",
    "udp://tracker.coppersurfer.tk:6969/announce",
    "udp://explodie.org:6969/announce",
    "udp://tracker.internetwarriors.net:1337/announce",
    "udp://tracker.pirateparty.gr:6969/announce",
    "udp://tracker.tiny-vps.com:6969/announce",
    "udp://tracker.torrent.eu.org:451/announce",
];

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// TCP port the HTTP server listens on.
    pub port: u16,
    /// Upper bound on waiting for a swarm to become ready.
    pub resolve_timeout_secs: u64,
    /// Idle age after which an unreferenced session is evicted.
    pub session_ttl_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub connection_sweep_interval_secs: u64,
    /// Cap applied to ranges with an omitted end. Zero serves to end of file.
    pub open_ended_chunk_bytes: u64,
    pub read_chunk_bytes: usize,
    /// Announce endpoints merged into every locator.
    pub trackers: Vec<String>,
    /// Content identifiers refused before any swarm join (hex or base32).
    pub blocked_hashes: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            resolve_timeout_secs: DEFAULT_RESOLVE_TIMEOUT_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            session_sweep_interval_secs: DEFAULT_SESSION_SWEEP_INTERVAL_SECS,
            connection_sweep_interval_secs: DEFAULT_CONNECTION_SWEEP_INTERVAL_SECS,
            open_ended_chunk_bytes: DEFAULT_OPEN_ENDED_CHUNK_BYTES,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            trackers: DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect(),
            blocked_hashes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the file named by `GATEWAY_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PORT") {
            self.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = lookup("RESOLVE_TIMEOUT_SECS") {
            self.resolve_timeout_secs = parse_var("RESOLVE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("SESSION_TTL_SECS") {
            self.session_ttl_secs = parse_var("SESSION_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("STREAM_CHUNK_BYTES") {
            self.open_ended_chunk_bytes = parse_var("STREAM_CHUNK_BYTES", &v)?;
        }
        if let Some(v) = lookup("BLOCKED_HASHES") {
            self.blocked_hashes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolve_timeout_secs == 0 {
            return Err(anyhow!("resolve_timeout_secs must be > 0"));
        }
        if self.session_sweep_interval_secs == 0 || self.connection_sweep_interval_secs == 0 {
            return Err(anyhow!("sweep intervals must be > 0"));
        }
        if self.read_chunk_bytes == 0 {
            return Err(anyhow!("read_chunk_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }

    pub fn connection_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.connection_sweep_interval_secs)
    }

    /// The open-ended range cap, or `None` when capping is disabled.
    pub fn open_ended_cap(&self) -> Option<u64> {
        (self.open_ended_chunk_bytes > 0).then_some(self.open_ended_chunk_bytes)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid value for {}: {:?}", name, value))
}
