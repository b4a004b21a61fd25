//! The `Cache-Control` directive set.

use std::fmt;

use crate::http::Headers;

/// Parsed cache directives from a request or response.
///
/// When constructed by parsing headers, `to_string` returns the original
/// header value, unless multiple `Cache-Control` headers or a `Pragma`
/// header contributed directives; then the value is re-rendered from the
/// parsed directive set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheControl {
    no_cache: bool,
    no_store: bool,
    max_age_seconds: Option<i64>,
    s_max_age_seconds: Option<i64>,
    private: bool,
    public: bool,
    must_revalidate: bool,
    max_stale_seconds: Option<i64>,
    min_fresh_seconds: Option<i64>,
    only_if_cached: bool,
    no_transform: bool,
    immutable: bool,
    header_value: Option<String>,
}

impl CacheControl {
    /// Requires a network fetch, bypassing the cache.
    pub fn force_network() -> CacheControl {
        CacheControl {
            no_cache: true,
            ..CacheControl::default()
        }
    }

    /// Requires the cache, failing with 504 when no entry exists.
    pub fn force_cache() -> CacheControl {
        CacheControl {
            only_if_cached: true,
            max_stale_seconds: Some(i64::MAX),
            ..CacheControl::default()
        }
    }

    pub fn builder() -> CacheControlBuilder {
        CacheControlBuilder {
            result: CacheControl::default(),
        }
    }

    /// Parses the union of all `Cache-Control` and `Pragma` headers.
    pub fn parse(headers: &Headers) -> CacheControl {
        let mut result = CacheControl::default();
        let mut can_use_header_value = true;
        let mut header_value = None;

        for i in 0..headers.len() {
            let name = headers.name(i);
            let value = headers.value(i);
            if name.eq_ignore_ascii_case("Cache-Control") {
                if header_value.is_none() {
                    header_value = Some(value.to_string());
                } else {
                    // Multiple headers: the raw value no longer represents
                    // the full directive set.
                    can_use_header_value = false;
                }
            } else if name.eq_ignore_ascii_case("Pragma") {
                can_use_header_value = false;
            } else {
                continue;
            }

            for (directive, argument) in tokenize(value) {
                let directive = directive.to_ascii_lowercase();
                let seconds = || argument.as_deref().and_then(parse_seconds);
                match directive.as_str() {
                    "no-cache" => result.no_cache = true,
                    "no-store" => result.no_store = true,
                    "max-age" => result.max_age_seconds = seconds(),
                    "s-maxage" => result.s_max_age_seconds = seconds(),
                    "private" => result.private = true,
                    "public" => result.public = true,
                    "must-revalidate" => result.must_revalidate = true,
                    "max-stale" => {
                        result.max_stale_seconds = Some(seconds().unwrap_or(i64::MAX));
                    }
                    "min-fresh" => result.min_fresh_seconds = seconds(),
                    "only-if-cached" => result.only_if_cached = true,
                    "no-transform" => result.no_transform = true,
                    "immutable" => result.immutable = true,
                    _ => {}
                }
            }
        }

        if can_use_header_value {
            result.header_value = header_value;
        }
        result
    }

    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    pub fn no_store(&self) -> bool {
        self.no_store
    }

    pub fn max_age_seconds(&self) -> Option<i64> {
        self.max_age_seconds
    }

    pub fn s_max_age_seconds(&self) -> Option<i64> {
        self.s_max_age_seconds
    }

    pub fn private(&self) -> bool {
        self.private
    }

    pub fn public(&self) -> bool {
        self.public
    }

    pub fn must_revalidate(&self) -> bool {
        self.must_revalidate
    }

    pub fn max_stale_seconds(&self) -> Option<i64> {
        self.max_stale_seconds
    }

    pub fn min_fresh_seconds(&self) -> Option<i64> {
        self.min_fresh_seconds
    }

    pub fn only_if_cached(&self) -> bool {
        self.only_if_cached
    }

    pub fn no_transform(&self) -> bool {
        self.no_transform
    }

    pub fn immutable(&self) -> bool {
        self.immutable
    }

    fn render(&self) -> String {
        let mut out = Vec::new();
        if self.no_cache {
            out.push("no-cache".to_string());
        }
        if self.no_store {
            out.push("no-store".to_string());
        }
        if let Some(s) = self.max_age_seconds {
            out.push(format!("max-age={}", s));
        }
        if let Some(s) = self.s_max_age_seconds {
            out.push(format!("s-maxage={}", s));
        }
        if self.private {
            out.push("private".to_string());
        }
        if self.public {
            out.push("public".to_string());
        }
        if self.must_revalidate {
            out.push("must-revalidate".to_string());
        }
        if let Some(s) = self.max_stale_seconds {
            if s == i64::MAX {
                out.push("max-stale".to_string());
            } else {
                out.push(format!("max-stale={}", s));
            }
        }
        if let Some(s) = self.min_fresh_seconds {
            out.push(format!("min-fresh={}", s));
        }
        if self.only_if_cached {
            out.push("only-if-cached".to_string());
        }
        if self.no_transform {
            out.push("no-transform".to_string());
        }
        if self.immutable {
            out.push("immutable".to_string());
        }
        out.join(", ")
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header_value {
            Some(ref value) => f.write_str(value),
            None => f.write_str(&self.render()),
        }
    }
}

/// Builds request cache directives.
#[derive(Clone, Debug, Default)]
pub struct CacheControlBuilder {
    result: CacheControl,
}

impl CacheControlBuilder {
    pub fn no_cache(mut self) -> Self {
        self.result.no_cache = true;
        self
    }

    pub fn no_store(mut self) -> Self {
        self.result.no_store = true;
        self
    }

    pub fn max_age_seconds(mut self, seconds: i64) -> Self {
        self.result.max_age_seconds = Some(seconds.max(0));
        self
    }

    pub fn max_stale_seconds(mut self, seconds: i64) -> Self {
        self.result.max_stale_seconds = Some(seconds.max(0));
        self
    }

    pub fn min_fresh_seconds(mut self, seconds: i64) -> Self {
        self.result.min_fresh_seconds = Some(seconds.max(0));
        self
    }

    pub fn only_if_cached(mut self) -> Self {
        self.result.only_if_cached = true;
        self
    }

    pub fn no_transform(mut self) -> Self {
        self.result.no_transform = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.result.immutable = true;
        self
    }

    pub fn build(self) -> CacheControl {
        self.result
    }
}

/// Splits a header value into `(directive, argument)` pairs, tolerating
/// quoted arguments and stray separators.
fn tokenize(value: &str) -> Vec<(String, Option<String>)> {
    let mut result = Vec::new();
    let bytes = value.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        // Skip separators.
        while pos < bytes.len() && matches!(bytes[pos], b',' | b' ' | b'\t') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let start = pos;
        while pos < bytes.len() && !matches!(bytes[pos], b',' | b' ' | b'\t' | b'=') {
            pos += 1;
        }
        let directive = value[start..pos].to_string();
        let mut argument = None;
        if pos < bytes.len() && bytes[pos] == b'=' {
            pos += 1;
            if pos < bytes.len() && bytes[pos] == b'"' {
                pos += 1;
                let arg_start = pos;
                while pos < bytes.len() && bytes[pos] != b'"' {
                    pos += 1;
                }
                argument = Some(value[arg_start..pos].to_string());
                pos += 1;
            } else {
                let arg_start = pos;
                while pos < bytes.len() && !matches!(bytes[pos], b',' | b' ' | b'\t') {
                    pos += 1;
                }
                argument = Some(value[arg_start..pos].to_string());
            }
        }
        result.push((directive, argument));
    }
    result
}

fn parse_seconds(value: &str) -> Option<i64> {
    match value.parse::<i64>() {
        Ok(n) if n >= 0 => Some(n),
        Ok(_) => Some(0),
        Err(_) if value.starts_with('-') => Some(0),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_directives() {
        let headers = Headers::of(&["Cache-Control", "no-cache, max-age=60, private"]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_cache());
        assert!(cc.private());
        assert_eq!(cc.max_age_seconds(), Some(60));
        assert!(!cc.no_store());
    }

    #[test]
    fn to_string_returns_original_when_canonical() {
        let headers = Headers::of(&["Cache-Control", "max-age=60,  public"]);
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.to_string(), "max-age=60,  public");
    }

    #[test]
    fn multiple_headers_are_not_canonical() {
        let headers = Headers::of(&[
            "Cache-Control",
            "max-age=60",
            "Cache-Control",
            "no-transform",
        ]);
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.max_age_seconds(), Some(60));
        assert!(cc.no_transform());
        assert_eq!(cc.to_string(), "max-age=60, no-transform");
    }

    #[test]
    fn pragma_taints_header_value() {
        let headers = Headers::of(&["Cache-Control", "max-age=30", "Pragma", "no-cache"]);
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.to_string(), "no-cache, max-age=30");
    }

    #[test]
    fn reparse_preserves_directives() {
        let headers = Headers::of(&["Cache-Control", "no-store, max-stale, immutable"]);
        let cc = CacheControl::parse(&headers);
        let rendered = cc.to_string();
        let cc2 = CacheControl::parse(&Headers::of(&["Cache-Control", &rendered]));
        assert_eq!(cc.no_store(), cc2.no_store());
        assert_eq!(cc.max_stale_seconds(), cc2.max_stale_seconds());
        assert_eq!(cc.immutable(), cc2.immutable());
    }

    #[test]
    fn quoted_argument() {
        let headers = Headers::of(&["Cache-Control", "max-age=\"120\""]);
        assert_eq!(CacheControl::parse(&headers).max_age_seconds(), Some(120));
    }

    #[test]
    fn force_cache_constants() {
        assert!(CacheControl::force_cache().only_if_cached());
        assert!(CacheControl::force_network().no_cache());
    }
}
