//! An ordered multimap of HTTP header names and values.

use std::fmt;

use crate::error::Error;
use crate::http::date;

/// The header fields of a single HTTP message.
///
/// Pairs keep their insertion order. Name lookup is ASCII case-insensitive.
/// Multi-valued headers are stored as multiple pairs, never joined.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pairs: Vec<(String, String)>,
}

impl Headers {
    /// An empty header block.
    pub fn new() -> Headers {
        Headers { pairs: Vec::new() }
    }

    pub fn builder() -> HeadersBuilder {
        HeadersBuilder { pairs: Vec::new() }
    }

    /// Builds headers from alternating name/value pairs.
    ///
    /// # Panics
    ///
    /// If `pairs` has odd length or any name or value is malformed.
    pub fn of(pairs: &[&str]) -> Headers {
        assert!(pairs.len() % 2 == 0, "expected alternating names and values");
        let mut builder = Headers::builder();
        for chunk in pairs.chunks(2) {
            builder.add(chunk[0], chunk[1]);
        }
        builder.build()
    }

    /// The last value for `name`, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The last value for `name` parsed as an HTTP date, in epoch millis.
    pub fn get_date(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(date::parse_millis)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The name at `index`.
    pub fn name(&self, index: usize) -> &str {
        &self.pairs[index].0
    }

    /// The value at `index`.
    pub fn value(&self, index: usize) -> &str {
        &self.pairs[index].1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Distinct header names, lowercased, in first-seen order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (n, _) in &self.pairs {
            let lower = n.to_ascii_lowercase();
            if !names.contains(&lower) {
                names.push(lower);
            }
        }
        names
    }

    pub fn to_builder(&self) -> HeadersBuilder {
        HeadersBuilder {
            pairs: self.pairs.clone(),
        }
    }

    /// Bytes of all names and values plus per-pair overhead of ": " and CRLF.
    pub fn byte_count(&self) -> u64 {
        let mut result = (self.pairs.len() as u64) * 4;
        for (n, v) in &self.pairs {
            result += n.len() as u64 + v.len() as u64;
        }
        result
    }

    pub(crate) fn contains_value(&self, name: &str, value: &str) -> bool {
        self.values(name).iter().any(|v| v.eq_ignore_ascii_case(value))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_list();
        for (n, v) in &self.pairs {
            map.entry(&format_args!("{}: {}", n, super::value_for_log(n, v)));
        }
        map.finish()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, v) in &self.pairs {
            writeln!(f, "{}: {}", n, v)?;
        }
        Ok(())
    }
}

/// Builds a [`Headers`] incrementally.
#[derive(Clone, Debug, Default)]
pub struct HeadersBuilder {
    pairs: Vec<(String, String)>,
}

impl HeadersBuilder {
    /// Adds a header pair.
    ///
    /// # Panics
    ///
    /// If the name or value contains forbidden octets.
    pub fn add(&mut self, name: &str, value: &str) -> &mut HeadersBuilder {
        if let Err(e) = check_name(name) {
            panic!("{}", e);
        }
        if let Err(e) = check_value(name, value) {
            panic!("{}", e);
        }
        self.pairs.push((name.to_string(), value.trim().to_string()));
        self
    }

    /// Adds a pair read off the wire without validation.
    pub(crate) fn add_lenient(&mut self, name: &str, value: &str) -> &mut HeadersBuilder {
        self.pairs.push((name.to_string(), value.trim().to_string()));
        self
    }

    /// Adds a `name: value` line read off the wire.
    pub(crate) fn add_line(&mut self, line: &str) -> &mut HeadersBuilder {
        match line.find(':') {
            Some(0) => self.add_lenient("", &line[1..]),
            Some(i) => self.add_lenient(&line[..i], &line[i + 1..]),
            None => self.add_lenient("", line),
        }
    }

    /// Replaces all values for `name` with a single pair.
    ///
    /// # Panics
    ///
    /// If the name or value contains forbidden octets.
    pub fn set(&mut self, name: &str, value: &str) -> &mut HeadersBuilder {
        self.remove_all(name);
        self.add(name, value)
    }

    pub fn remove_all(&mut self, name: &str) -> &mut HeadersBuilder {
        self.pairs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn build(&self) -> Headers {
        Headers {
            pairs: self.pairs.clone(),
        }
    }
}

/// Validates a header name: non-empty, each octet in `0x21..=0x7e`.
pub(crate) fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_header("name is empty"));
    }
    for (i, b) in name.bytes().enumerate() {
        if !(0x21..=0x7e).contains(&b) {
            return Err(Error::invalid_header(format!(
                "unexpected char 0x{:02x} at {} in header name: {}",
                b, i, name
            )));
        }
    }
    Ok(())
}

/// Validates a header value: each octet is HTAB or in `0x20..=0x7e`.
pub(crate) fn check_value(name: &str, value: &str) -> Result<(), Error> {
    for (i, b) in value.bytes().enumerate() {
        if b != b'\t' && !(0x20..=0x7e).contains(&b) {
            return Err(Error::invalid_header(format!(
                "unexpected char 0x{:02x} at {} in {} value",
                b, i, name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_and_case_insensitive() {
        let headers = Headers::of(&["Set-Cookie", "a=1", "Content-Type", "text/plain", "set-cookie", "b=2"]);
        assert_eq!(headers.values("SET-COOKIE"), vec!["a=1", "b=2"]);
        assert_eq!(headers.get("set-cookie"), Some("b=2"));
        assert_eq!(headers.name(1), "Content-Type");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn set_replaces_all() {
        let mut builder = Headers::of(&["A", "1", "a", "2", "B", "3"]).to_builder();
        builder.set("a", "4");
        let headers = builder.build();
        assert_eq!(headers.values("A"), vec!["4"]);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    #[should_panic]
    fn rejects_control_in_value() {
        Headers::of(&["A", "bad\nvalue"]);
    }

    #[test]
    fn lenient_line_parsing() {
        let mut builder = Headers::builder();
        builder.add_line("Content-Length: 5");
        builder.add_line(":empty-name");
        let headers = builder.build();
        assert_eq!(headers.get("content-length"), Some("5"));
        assert_eq!(headers.get(""), Some("empty-name"));
    }

    #[test]
    fn debug_redacts_sensitive_values() {
        let headers = Headers::of(&["Authorization", "Basic hunter2", "Accept", "*/*"]);
        let rendered = format!("{:?}", headers);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("*/*"));
    }

    #[test]
    fn byte_count() {
        let headers = Headers::of(&["abc", "def"]);
        assert_eq!(headers.byte_count(), 10);
    }
}
