use std::fmt;

use anyhow::{anyhow, Result};
use data_encoding::BASE32;

/// Length of a v1 info hash in bytes.
const INFO_HASH_LEN: usize = 20;

/// Swarm content identifier, always stored as 40 uppercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(String);

impl InfoHash {
    /// Parse a 40-char hex or 32-char base32 info hash, in any letter case.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let bytes = match value.len() {
            40 => hex::decode(value).map_err(|e| anyhow!("invalid hex info hash: {}", e))?,
            32 => BASE32
                .decode(value.to_ascii_uppercase().as_bytes())
                .map_err(|e| anyhow!("invalid base32 info hash: {}", e))?,
            n => return Err(anyhow!("invalid info hash length: {}", n)),
        };
        if bytes.len() != INFO_HASH_LEN {
            return Err(anyhow!("info hash decodes to {} bytes", bytes.len()));
        }
        Ok(Self(hex::encode_upper(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
