//! RFC 7231 media types.

use std::fmt;

/// A parsed `type/subtype` with its ordered parameter list.
///
/// `Display` returns the string this media type was parsed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaType {
    full: String,
    type_: String,
    subtype: String,
    parameters: Vec<(String, String)>,
}

impl MediaType {
    /// Parses a media type, returning `None` when the input does not match
    /// the RFC 7231 grammar.
    pub fn parse(input: &str) -> Option<MediaType> {
        let input_trimmed = input.trim();
        let mut rest = input_trimmed;

        let slash = rest.find('/')?;
        let type_ = &rest[..slash];
        rest = &rest[slash + 1..];
        let subtype_end = rest
            .find(|c: char| c == ';' || c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        let subtype = &rest[..subtype_end];
        if !is_token(type_) || !is_token(subtype) {
            return None;
        }
        rest = rest[subtype_end..].trim_start();

        let mut parameters = Vec::new();
        while !rest.is_empty() {
            rest = rest.strip_prefix(';')?.trim_start();
            if rest.is_empty() {
                break;
            }
            let eq = rest.find('=')?;
            let name = rest[..eq].trim();
            if !is_token(name) {
                return None;
            }
            rest = &rest[eq + 1..];
            let value;
            if let Some(quoted) = rest.strip_prefix('"') {
                let close = quoted.find('"')?;
                value = quoted[..close].to_string();
                rest = quoted[close + 1..].trim_start();
            } else {
                let end = rest.find(';').unwrap_or(rest.len());
                let raw = rest[..end].trim();
                if !is_token(raw) {
                    return None;
                }
                value = raw.to_string();
                rest = rest[end..].trim_start();
            }
            parameters.push((name.to_ascii_lowercase(), value));
        }

        Some(MediaType {
            full: input_trimmed.to_string(),
            type_: type_.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            parameters,
        })
    }

    /// The high-level type, such as `text` or `application`.
    pub fn type_(&self) -> &str {
        &self.type_
    }

    /// The specific subtype, such as `plain` or `json`.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// The first value of the parameter `name` (case-insensitive).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The declared charset, if any.
    pub fn charset(&self) -> Option<&str> {
        self.parameter("charset")
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

fn is_token(input: &str) -> bool {
    !input.is_empty()
        && input.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let media = MediaType::parse("text/plain").unwrap();
        assert_eq!(media.type_(), "text");
        assert_eq!(media.subtype(), "plain");
        assert_eq!(media.charset(), None);
    }

    #[test]
    fn parse_with_charset() {
        let media = MediaType::parse("text/plain; charset=UTF-8").unwrap();
        assert_eq!(media.charset(), Some("UTF-8"));
        assert_eq!(media.to_string(), "text/plain; charset=UTF-8");
    }

    #[test]
    fn quoted_parameter() {
        let media = MediaType::parse("multipart/form-data; boundary=\"a b\"").unwrap();
        assert_eq!(media.parameter("BOUNDARY"), Some("a b"));
    }

    #[test]
    fn case_normalized_type() {
        let media = MediaType::parse("Text/HTML").unwrap();
        assert_eq!(media.type_(), "text");
        assert_eq!(media.subtype(), "html");
    }

    #[test]
    fn rejects_garbage() {
        assert!(MediaType::parse("noslash").is_none());
        assert!(MediaType::parse("text/pl ain").is_none());
        assert!(MediaType::parse("text/plain; =x").is_none());
    }
}
