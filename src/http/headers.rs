//! Order-preserving header map with case-insensitive lookup (RFC 9110 §5).

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use tally::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Retry-After", "30");
/// headers.insert("X-Cache", "miss");
/// headers.insert("X-Cache", "hit");
///
/// assert_eq!(headers.get("retry-after"), Some("30"));
/// let all: Vec<_> = headers.get_all("x-cache").collect();
/// assert_eq!(all, vec!["miss", "hit"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes every entry named `name`. Returns `true` if any were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("X-RateLimit-Remaining", "4");
        assert_eq!(h.get("x-ratelimit-remaining"), Some("4"));
        assert_eq!(h.get("X-RATELIMIT-REMAINING"), Some("4"));
        assert!(h.contains("x-ratelimit-remaining"));
        assert!(!h.contains("retry-after"));
    }

    #[test]
    fn remove_drops_every_value() {
        let mut h = Headers::new();
        h.insert("X-Cache", "miss");
        h.insert("x-cache", "hit");
        assert_eq!(h.get_all("X-CACHE").count(), 2);
        assert!(h.remove("X-Cache"));
        assert!(h.is_empty());
        assert!(!h.remove("X-Cache"));
    }

    #[test]
    fn display_is_wire_format() {
        let mut h = Headers::new();
        h.insert("Retry-After", "60");
        assert_eq!(h.to_string(), "Retry-After: 60\r\n");
    }
}
