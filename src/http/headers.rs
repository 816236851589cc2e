//! Ordered, case-insensitive header collection

use std::collections::HashMap;

/// An HTTP header collection that preserves insertion order and duplicate
/// entries. Lookups are case-insensitive and return the first occurrence,
/// matching how most header consumers behave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any existing entries with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` in insertion order.
    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// Removes every entry named `name`, returning how many were dropped.
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes back to wire form: one `name: value\r\n` line per entry
    /// followed by the blank line that terminates the header block.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 32 + 2);
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Convenience flattening: first occurrence per lowercased name.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (name, value) in &self.entries {
            map.entry(name.to_ascii_lowercase())
                .or_insert_with(|| value.clone());
        }
        map
    }

    pub(crate) fn last_value_mut(&mut self) -> Option<&mut String> {
        self.entries.last_mut().map(|(_, v)| v)
    }
}

/// Whether `name` is a valid RFC 7230 `token`.
pub(crate) fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'^' | b'_' | b'`' | b'|' | b'~' |
                b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
        })
}

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Check if a header is hop-by-hop and must not be forwarded. Tokens listed
/// in the `Connection` header of `headers` count as hop-by-hop too.
pub fn is_hop_by_hop_header(name: &str, headers: &Headers) -> bool {
    if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
        return true;
    }
    headers
        .all("connection")
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order_and_duplicates() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Host", "example.test");
        headers.append("Set-Cookie", "b=2");

        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, ["Set-Cookie", "Host", "Set-Cookie"]);
        let cookies: Vec<_> = headers.all("set-cookie").collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
    }

    #[test]
    fn first_is_case_insensitive_and_returns_first_inserted() {
        let mut headers = Headers::new();
        headers.append("X-Thing", "one");
        headers.append("x-thing", "two");
        assert_eq!(headers.first("X-THING"), Some("one"));
        assert_eq!(headers.first("missing"), None);
    }

    #[test]
    fn remove_all_drops_every_occurrence() {
        let mut headers = Headers::new();
        headers.append("A", "1");
        headers.append("a", "2");
        headers.append("B", "3");
        assert_eq!(headers.remove_all("A"), 2);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.first("b"), Some("3"));
    }

    #[test]
    fn to_wire_serializes_with_terminator() {
        let mut headers = Headers::new();
        headers.append("Host", "example.test");
        headers.append("Accept", "*/*");
        assert_eq!(
            headers.to_wire(),
            b"Host: example.test\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn to_map_keeps_first_occurrence() {
        let mut headers = Headers::new();
        headers.append("X-Dup", "first");
        headers.append("x-dup", "second");
        let map = headers.to_map();
        assert_eq!(map.get("x-dup").map(String::as_str), Some("first"));
    }

    #[test]
    fn connection_listed_headers_are_hop_by_hop() {
        let mut headers = Headers::new();
        headers.append("Connection", "close, X-Custom-Hop");
        assert!(is_hop_by_hop_header("transfer-encoding", &headers));
        assert!(is_hop_by_hop_header("x-custom-hop", &headers));
        assert!(!is_hop_by_hop_header("content-length", &headers));
    }

    #[test]
    fn token_validation() {
        assert!(is_token("Content-Length"));
        assert!(is_token("x_custom~header"));
        assert!(!is_token(""));
        assert!(!is_token("bad header"));
        assert!(!is_token("bad:header"));
    }
}
