//! Header parsing for the rate-limit tracker.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};
use crate::transport::HeaderBag;

lazy_static! {
    /// `<number><unit>`, unit in {ms, s, m, h}. Mirrors the original
    /// implementation's `(\d+(?:\.\d+)?)([a-zA-Z]+)` duration regex.
    static ref DURATION_RE: Regex = Regex::new(r"^(\d+(?:\.\d+)?)([a-zA-Z]+)$").unwrap();
}

/// Parse a `<number><unit>` duration string into seconds. Any string that
/// doesn't match the grammar — including compound forms like `"1h2m3s"` —
/// parses to zero, per spec (duration parsing, not header-value parsing, has
/// its own fallback and is never an ingestion error).
#[must_use]
pub(crate) fn parse_duration_secs(s: &str) -> f64 {
    let Some(captures) = DURATION_RE.captures(s.trim()) else {
        return 0.0;
    };
    let Ok(amount) = captures[1].parse::<f64>() else {
        return 0.0;
    };
    match &captures[2] {
        "ms" => amount / 1000.0,
        "s" => amount,
        "m" => amount * 60.0,
        "h" => amount * 3600.0,
        _ => 0.0,
    }
}

/// Values parsed from one quota window's three headers (limit, remaining, reset).
#[derive(Debug, Default)]
pub(crate) struct PartialWindow {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Parse the `limit-{suffix}` / `remaining-{suffix}` / `reset-{suffix}` triple
/// for one window out of the header bag. A present-but-unparseable limit or
/// remaining value is an ingestion error (never silently zeroed); a missing
/// header is simply absent from the result.
pub(crate) fn parse_window(
    bag: &HeaderBag,
    suffix: &str,
    now: DateTime<Utc>,
) -> Result<PartialWindow> {
    let limit = parse_optional_u64(bag, &format!("x-ratelimit-limit-{suffix}"))?;
    let remaining = parse_optional_u64(bag, &format!("x-ratelimit-remaining-{suffix}"))?;
    let reset_at = bag
        .get(&format!("x-ratelimit-reset-{suffix}"))
        .map(|v| now + chrono::Duration::milliseconds((parse_duration_secs(v) * 1000.0) as i64));

    Ok(PartialWindow {
        limit,
        remaining,
        reset_at,
    })
}

fn parse_optional_u64(bag: &HeaderBag, key: &str) -> Result<Option<u64>> {
    match bag.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Validation(format!("header {key} is not a valid integer: {raw:?}"))),
    }
}
