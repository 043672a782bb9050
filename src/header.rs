//! An ordered HTTP header list.
//!
//! The pipeline keeps headers in a dedicated container rather than a map:
//! lookups are case-insensitive per RFC 7230, but the original casing and
//! insertion order must survive for on-wire replay and for the cache's
//! on-disk round trip.

use std::fmt;
use std::slice;

/// Fallback charset for textual media types without an explicit
/// `charset` parameter.
pub const DEFAULT_CHARSET: &str = "ISO-8859-1";

/// A single immutable HTTP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    /// Creates a header from a name and a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// The header name, with its original casing.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The header value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// An insertion-ordered list of HTTP headers.
///
/// Name lookups are case-insensitive; iteration yields headers in the order
/// they were added, with their original casing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    /// Creates an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header::new(name, value));
    }

    /// Replaces every header with the given name, then appends the new value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|h| !h.name.eq_ignore_ascii_case(&name));
        self.entries.push(Header::new(name, value));
    }

    /// Returns the first value for `name`, matching case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Returns every value for `name`, matching case-insensitively.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Whether a header with the given name is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Number of headers in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the headers in insertion order.
    pub fn iter(&self) -> slice::Iter<'_, Header> {
        self.entries.iter()
    }

    /// Extracts the charset parameter from a `Content-Type` header, falling
    /// back to `default` when the header or the parameter is missing.
    #[must_use]
    pub fn charset_or<'a>(&'a self, default: &'a str) -> &'a str {
        let Some(content_type) = self.get("Content-Type") else {
            return default;
        };
        for param in content_type.split(';').skip(1) {
            let mut pair = param.splitn(2, '=');
            let key = pair.next().unwrap_or("").trim();
            if key.eq_ignore_ascii_case("charset") {
                if let Some(value) = pair.next() {
                    return value.trim().trim_matches('"');
                }
            }
        }
        default
    }

    /// Merges the headers of a `304 Not Modified` response with the headers
    /// stored alongside the cached entry.
    ///
    /// Every server-returned header is kept in its returned order; a cached
    /// header is appended only when no server header shares its name
    /// (case-insensitively). The server wins on duplicates.
    #[must_use]
    pub fn merge_not_modified(server: &Headers, cached: &Headers) -> Headers {
        let mut merged = server.clone();
        for header in cached.iter() {
            if !server.contains(header.name()) {
                merged.append(header.name(), header.value());
            }
        }
        merged
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn order_and_casing_survive() {
        let mut headers = Headers::new();
        headers.append("X-First", "1");
        headers.append("x-second", "2");
        headers.append("X-First", "3");
        let collected: Vec<_> =
            headers.iter().map(|h| (h.name(), h.value())).collect();
        assert_eq!(
            collected,
            vec![("X-First", "1"), ("x-second", "2"), ("X-First", "3")]
        );
        assert_eq!(headers.get_all("X-FIRST"), vec!["1", "3"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("accept", "text/plain");
        headers.set("Accept", "application/json");
        assert_eq!(headers.get_all("accept"), vec!["application/json"]);
    }

    #[test]
    fn charset_extraction() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain; charset=utf-8");
        assert_eq!(headers.charset_or(DEFAULT_CHARSET), "utf-8");

        let mut quoted = Headers::new();
        quoted.append("Content-Type", "text/html; charset=\"UTF-16\"");
        assert_eq!(quoted.charset_or(DEFAULT_CHARSET), "UTF-16");

        let missing = Headers::new();
        assert_eq!(missing.charset_or(DEFAULT_CHARSET), "ISO-8859-1");

        let mut bare = Headers::new();
        bare.append("Content-Type", "text/html");
        assert_eq!(bare.charset_or(DEFAULT_CHARSET), "ISO-8859-1");
    }

    #[test]
    fn not_modified_merge_prefers_server() {
        let server: Headers = [
            ("Date", "Thu, 01 Jan 2026 00:00:00 GMT"),
            ("ETag", "\"v2\""),
        ]
        .into_iter()
        .collect();
        let cached: Headers = [
            ("etag", "\"v1\""),
            ("Content-Type", "application/json"),
            ("X-Custom", "kept"),
        ]
        .into_iter()
        .collect();

        let merged = Headers::merge_not_modified(&server, &cached);
        assert_eq!(merged.get("ETag"), Some("\"v2\""));
        assert_eq!(merged.get_all("etag"), vec!["\"v2\""]);
        assert_eq!(merged.get("Content-Type"), Some("application/json"));
        assert_eq!(merged.get("X-Custom"), Some("kept"));
        assert_eq!(merged.len(), 4);
    }
}
