// Magnet locator normalization: extract the info hash and merge announce endpoints.

use url::form_urlencoded;

use super::info_hash::InfoHash;
use crate::error::GatewayError;

const SCHEME_PREFIX: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

/// A parsed and canonicalized magnet locator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    raw: String,
    normalized: String,
    info_hash: InfoHash,
    display_name: Option<String>,
    trackers: Vec<String>,
    web_seeds: Vec<String>,
}

impl Locator {
    /// Parse `raw` and merge `extra_trackers` into its announce list.
    ///
    /// Existing trackers keep their order and come first; duplicates are dropped.
    /// Every other parameter is preserved in its original position.
    pub fn parse(raw: &str, extra_trackers: &[String]) -> Result<Self, GatewayError> {
        let trimmed = raw.trim();
        let query = strip_prefix_ignore_case(trimmed, SCHEME_PREFIX).ok_or_else(|| {
            GatewayError::InvalidLocator(format!("locator must start with {:?}", SCHEME_PREFIX))
        })?;

        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut info_hash = None;
        for (key, value) in &pairs {
            if !is_param(key, "xt") {
                continue;
            }
            if let Some(hash) = strip_prefix_ignore_case(value, BTIH_PREFIX) {
                let parsed = InfoHash::parse(hash)
                    .map_err(|e| GatewayError::InvalidLocator(e.to_string()))?;
                info_hash = Some(parsed);
                break;
            }
        }
        let info_hash = info_hash.ok_or_else(|| {
            GatewayError::InvalidLocator("missing xt=urn:btih: parameter".to_string())
        })?;

        let mut trackers: Vec<String> = Vec::new();
        let existing = pairs
            .iter()
            .filter(|(k, _)| is_param(k, "tr"))
            .map(|(_, v)| v.as_str());
        for tracker in existing.chain(extra_trackers.iter().map(String::as_str)) {
            let tracker = tracker.trim();
            if !tracker.is_empty() && !trackers.iter().any(|t| t == tracker) {
                trackers.push(tracker.to_string());
            }
        }

        let display_name = pairs
            .iter()
            .find(|(k, v)| k == "dn" && !v.is_empty())
            .map(|(_, v)| v.clone());
        let web_seeds = pairs
            .iter()
            .filter(|(k, v)| is_param(k, "ws") && !v.is_empty())
            .map(|(_, v)| v.clone())
            .collect();

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        let mut wrote_xt = false;
        for (key, value) in &pairs {
            if is_param(key, "tr") {
                continue;
            }
            if is_param(key, "xt") && strip_prefix_ignore_case(value, BTIH_PREFIX).is_some() {
                if wrote_xt {
                    continue;
                }
                wrote_xt = true;
                serializer.append_pair("xt", &format!("{}{}", BTIH_PREFIX, info_hash));
                continue;
            }
            serializer.append_pair(key, value);
        }
        for tracker in &trackers {
            serializer.append_pair("tr", tracker);
        }
        let normalized = format!("{}{}", SCHEME_PREFIX, serializer.finish());

        Ok(Self {
            raw: raw.to_string(),
            normalized,
            info_hash,
            display_name,
            trackers,
            web_seeds,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Canonical magnet string with the merged tracker list.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    /// BEP-19 web seed URLs (`ws` parameters).
    pub fn web_seeds(&self) -> &[String] {
        &self.web_seeds
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Matches `name` and its numbered forms (`xt.1`, `tr.2`, ...).
fn is_param(key: &str, name: &str) -> bool {
    match key.strip_prefix(name) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}
