//! Derives cache metadata from HTTP response headers.

use std::time::{Duration, UNIX_EPOCH};

use log::debug;

use crate::cache::{epoch_millis, CacheEntry};
use crate::response::NetworkResponse;

/// Parses an HTTP-date header value into epoch milliseconds, `0` on failure.
fn parse_date_millis(value: &str) -> i64 {
    match httpdate::parse_http_date(value) {
        Ok(time) => time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
        Err(_) => {
            debug!("unparseable HTTP date: {value:?}");
            0
        }
    }
}

/// Formats epoch milliseconds as an HTTP-date string.
pub(crate) fn format_http_date(epoch_millis: i64) -> String {
    let time = UNIX_EPOCH + Duration::from_millis(epoch_millis.max(0) as u64);
    httpdate::fmt_http_date(time)
}

/// Computes a [`CacheEntry`] from a network response, or `None` when the
/// response forbids caching.
///
/// `Cache-Control` wins when present: `no-cache`/`no-store` make the
/// response uncacheable, `max-age` sets the soft TTL,
/// `stale-while-revalidate` extends the hard TTL past it, and
/// `must-revalidate`/`proxy-revalidate` pin the hard TTL to the soft one.
/// Without `Cache-Control`, the lifetime falls back to `Expires` minus the
/// server `Date`. A response carrying neither is cached but immediately
/// stale, forcing conditional revalidation on every use.
#[must_use]
pub fn parse_cache_headers(response: &NetworkResponse) -> Option<CacheEntry> {
    let now = epoch_millis();
    let headers = &response.headers;

    let server_date =
        headers.get("Date").map(parse_date_millis).unwrap_or(0);
    let last_modified =
        headers.get("Last-Modified").map(parse_date_millis).unwrap_or(0);
    let server_expires =
        headers.get("Expires").map(parse_date_millis).unwrap_or(0);
    let etag = headers.get("ETag").map(str::to_owned);

    let mut has_cache_control = false;
    let mut max_age_secs: i64 = 0;
    let mut stale_while_refresh_secs: i64 = 0;
    let mut must_revalidate = false;

    if let Some(cache_control) = headers.get("Cache-Control") {
        has_cache_control = true;
        for directive in cache_control.split(',') {
            let directive = directive.trim();
            if directive.eq_ignore_ascii_case("no-cache")
                || directive.eq_ignore_ascii_case("no-store")
            {
                return None;
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                max_age_secs = value.trim().parse().unwrap_or(0);
            } else if let Some(value) =
                directive.strip_prefix("stale-while-revalidate=")
            {
                stale_while_refresh_secs = value.trim().parse().unwrap_or(0);
            } else if directive.eq_ignore_ascii_case("must-revalidate")
                || directive.eq_ignore_ascii_case("proxy-revalidate")
            {
                must_revalidate = true;
            }
        }
    }

    let (soft_ttl, ttl) = if has_cache_control {
        let soft = now + max_age_secs.saturating_mul(1_000);
        let hard = if must_revalidate {
            soft
        } else {
            soft + stale_while_refresh_secs.saturating_mul(1_000)
        };
        (soft, hard)
    } else if server_date > 0 && server_expires >= server_date {
        let lifetime = server_expires - server_date;
        (now + lifetime, now + lifetime)
    } else {
        (0, 0)
    };

    Some(CacheEntry {
        data: response.body.clone(),
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers: response.headers.clone(),
    })
}
