//! Case-insensitive, order-preserving header map.

/// Header names whose values never reach the logs.
const SENSITIVE: [&str; 3] = ["authorization", "cookie", "proxy-authorization"];

/// A case-insensitive, multi-value HTTP header map.
///
/// Entries keep their insertion order and original casing, which matters when
/// the map is written back to the wire.
///
/// # Examples
///
/// ```
/// use portico::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Vary", "Origin");
/// headers.insert("Vary", "Accept");
/// headers.set("Content-Type", "application/json");
///
/// assert_eq!(headers.get("content-type"), Some("application/json"));
/// assert_eq!(headers.get_all("vary").count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends an entry, keeping any existing values for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every existing value for `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries named `name`. Returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Number of entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries with credential-bearing values masked, for logging.
    pub fn redacted(&self) -> Vec<(&str, &str)> {
        self.iter()
            .map(|(k, v)| {
                if SENSITIVE.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                    (k, "<redacted>")
                } else {
                    (k, v)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(h.contains("Content-type"));
    }

    #[test]
    fn set_replaces_all_previous_values() {
        let mut h = Headers::new();
        h.insert("X-Trace", "a");
        h.insert("x-trace", "b");
        h.set("X-Trace", "c");
        assert_eq!(h.get_all("x-trace").collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }

    #[test]
    fn redaction_masks_credentials_only() {
        let mut h = Headers::new();
        h.insert("Authorization", "Bearer secret");
        h.insert("Accept", "*/*");
        let shown = h.redacted();
        assert_eq!(shown[0], ("Authorization", "<redacted>"));
        assert_eq!(shown[1], ("Accept", "*/*"));
    }
}
