use std::collections::HashSet;

use anyhow::{Context, Result};
use tracing::warn;

use super::info_hash::InfoHash;
use crate::error::GatewayError;

/// Process-wide set of forbidden content identifiers. Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    hashes: HashSet<InfoHash>,
}

impl Blocklist {
    /// Build from hex or base32 entries. An unparseable entry is a startup error.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hashes = HashSet::new();
        for entry in entries {
            let entry = entry.as_ref();
            let hash = InfoHash::parse(entry)
                .with_context(|| format!("invalid blocklist entry {:?}", entry))?;
            hashes.insert(hash);
        }
        Ok(Self { hashes })
    }

    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.hashes.contains(info_hash)
    }

    /// Fail with `ContentBlocked` if `info_hash` is listed.
    pub fn check(&self, info_hash: &InfoHash) -> Result<(), GatewayError> {
        if self.contains(info_hash) {
            warn!("refusing blocked content {}", info_hash);
            return Err(GatewayError::ContentBlocked {
                info_hash: info_hash.to_string(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
