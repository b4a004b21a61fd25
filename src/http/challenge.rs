//! `WWW-Authenticate` / `Proxy-Authenticate` challenge parsing.

use std::collections::HashMap;

use crate::http::Headers;

/// An RFC 7235 authentication challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub(crate) scheme: String,
    pub(crate) params: HashMap<String, String>,
}

impl Challenge {
    pub(crate) fn realm(&self) -> Option<&str> {
        self.params.get("realm").map(|s| s.as_str())
    }
}

/// Parses every challenge in every header named `header_name`.
///
/// Tolerates quoted strings and multiple challenges per header. A parameter
/// list that cannot be parsed terminates that header's challenges.
pub(crate) fn parse_challenges(headers: &Headers, header_name: &str) -> Vec<Challenge> {
    let mut result = Vec::new();
    for value in headers.values(header_name) {
        parse_header(value, &mut result);
    }
    result
}

fn parse_header(value: &str, out: &mut Vec<Challenge>) {
    let mut rest = value.trim();
    while !rest.is_empty() {
        // Scheme token.
        let end = rest
            .find(|c: char| c.is_ascii_whitespace() || c == ',')
            .unwrap_or(rest.len());
        let scheme = &rest[..end];
        if scheme.is_empty() {
            return;
        }
        rest = rest[end..].trim_start_matches([' ', '\t', ',']);

        let mut params = HashMap::new();
        loop {
            // A parameter is `token=value`; anything else starts the next
            // challenge's scheme.
            let Some(eq) = rest.find('=') else { break };
            let candidate = &rest[..eq];
            if candidate.contains(|c: char| c.is_ascii_whitespace() || c == ',') {
                break;
            }
            let name = candidate.trim().to_ascii_lowercase();
            rest = rest[eq + 1..].trim_start();

            let param_value;
            if let Some(quoted) = rest.strip_prefix('"') {
                let Some(close) = find_unescaped_quote(quoted) else {
                    return;
                };
                param_value = unescape(&quoted[..close]);
                rest = quoted[close + 1..].trim_start_matches([' ', '\t', ',']);
            } else {
                let end = rest.find([',', ' ', '\t']).unwrap_or(rest.len());
                param_value = rest[..end].to_string();
                rest = rest[end..].trim_start_matches([' ', '\t', ',']);
            }
            params.insert(name, param_value);
            if rest.is_empty() {
                break;
            }
        }

        out.push(Challenge {
            scheme: scheme.to_string(),
            params,
        });
        rest = rest.trim_start_matches([' ', '\t', ',']);
    }
}

fn find_unescaped_quote(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_realm() {
        let headers = Headers::of(&["WWW-Authenticate", "Basic realm=\"protected area\""]);
        let challenges = parse_challenges(&headers, "WWW-Authenticate");
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].scheme, "Basic");
        assert_eq!(challenges[0].realm(), Some("protected area"));
    }

    #[test]
    fn multiple_challenges_one_header() {
        let headers = Headers::of(&[
            "WWW-Authenticate",
            "Digest realm=\"digests\", Basic realm=\"basics\"",
        ]);
        let challenges = parse_challenges(&headers, "WWW-Authenticate");
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "Digest");
        assert_eq!(challenges[1].scheme, "Basic");
        assert_eq!(challenges[1].realm(), Some("basics"));
    }

    #[test]
    fn unquoted_and_extra_params() {
        let headers = Headers::of(&[
            "WWW-Authenticate",
            "Bearer realm=oauth, error=invalid_token",
        ]);
        let challenges = parse_challenges(&headers, "WWW-Authenticate");
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].realm(), Some("oauth"));
        assert_eq!(challenges[0].params.get("error").map(String::as_str), Some("invalid_token"));
    }

    #[test]
    fn escaped_quotes() {
        let headers = Headers::of(&["WWW-Authenticate", r#"Basic realm="a \"b\" c""#]);
        let challenges = parse_challenges(&headers, "WWW-Authenticate");
        assert_eq!(challenges[0].realm(), Some(r#"a "b" c"#));
    }
}
