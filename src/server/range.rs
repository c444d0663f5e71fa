// Byte-range negotiation against a file whose length is known.

use crate::engine::connection::ByteWindow;
use crate::error::GatewayError;

/// Syntactically valid `bytes=<start>-<end>?` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRange {
    pub start: u64,
    pub end_inclusive: Option<u64>,
}

/// Outcome of negotiating a request against a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// `None` only for a zero-length file served whole.
    pub window: Option<ByteWindow>,
    /// 206 when `true`, 200 otherwise.
    pub partial: bool,
    pub total: u64,
}

impl Negotiated {
    pub fn content_length(&self) -> u64 {
        self.window.map_or(0, |w| w.len())
    }

    /// `Content-Range` value for partial responses.
    pub fn content_range(&self) -> Option<String> {
        match (self.partial, self.window) {
            (true, Some(w)) => Some(format!("bytes {}-{}/{}", w.start, w.end, self.total)),
            _ => None,
        }
    }
}

/// Parse a `Range` header value.
///
/// Only a single `bytes=<start>-<end>` or `bytes=<start>-` range is accepted. Suffix
/// ranges, multiple ranges and non-digit bounds are malformed. The bounds are not
/// ordered here: `negotiate` decides between 416 and full content for `end < start`.
pub fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let unit_len = "bytes=".len();
    let unit = value.get(..unit_len)?;
    if !unit.eq_ignore_ascii_case("bytes=") {
        return None;
    }
    let (start_str, end_str) = value[unit_len..].split_once('-')?;

    let start = parse_bound(start_str.trim())?;
    let end_str = end_str.trim();
    let end_inclusive = if end_str.is_empty() {
        None
    } else {
        Some(parse_bound(end_str)?)
    };
    Some(ParsedRange {
        start,
        end_inclusive,
    })
}

/// Digits only: rejects signs, whitespace and anything `u64::from_str` would otherwise accept.
fn parse_bound(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Negotiate the optional `Range` header against `length`.
///
/// A start past the end of the file is unsatisfiable even when the pair is unordered;
/// an in-bounds start with `end < start` is served as if no range was sent.
/// `open_ended_cap` bounds the window for `bytes=<start>-` requests; it never applies
/// when the header is absent or malformed.
pub fn negotiate(
    range: Option<&str>,
    length: u64,
    open_ended_cap: Option<u64>,
) -> Result<Negotiated, GatewayError> {
    let Some(parsed) = range.and_then(parse_range_header) else {
        return Ok(full_content(length));
    };

    let last = match length.checked_sub(1) {
        Some(last) if parsed.start <= last => last,
        _ => return Err(GatewayError::RangeNotSatisfiable { length }),
    };
    let end = match parsed.end_inclusive {
        Some(end) if end < parsed.start => return Ok(full_content(length)),
        Some(end) => end,
        None => match open_ended_cap {
            Some(cap) if cap > 0 => parsed.start.saturating_add(cap - 1).min(last),
            _ => last,
        },
    };
    if end > last {
        return Err(GatewayError::RangeNotSatisfiable { length });
    }

    Ok(Negotiated {
        window: Some(ByteWindow {
            start: parsed.start,
            end,
        }),
        partial: true,
        total: length,
    })
}

fn full_content(length: u64) -> Negotiated {
    Negotiated {
        window: (length > 0).then(|| ByteWindow {
            start: 0,
            end: length - 1,
        }),
        partial: false,
        total: length,
    }
}
