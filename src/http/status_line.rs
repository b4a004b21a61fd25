//! The first line of an HTTP response.

use std::fmt;

use crate::connect::Protocol;
use crate::error::{Error, Result};

/// A parsed status line: protocol, code, and reason phrase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StatusLine {
    pub(crate) protocol: Protocol,
    pub(crate) code: u16,
    pub(crate) message: String,
}

impl StatusLine {
    /// Parses `HTTP/<major>.<minor> <code> <reason>`. Shoutcast's
    /// `ICY <code> <reason>` is accepted as HTTP/1.0.
    pub(crate) fn parse(line: &str) -> Result<StatusLine> {
        let malformed = || Error::protocol(format!("unexpected status line: {}", line));

        let (protocol, rest) = if let Some(rest) = line.strip_prefix("HTTP/1.") {
            let mut chars = rest.chars();
            let minor = chars.next().ok_or_else(malformed)?;
            let protocol = match minor {
                '0' => Protocol::Http10,
                '1' => Protocol::Http11,
                _ => return Err(malformed()),
            };
            let rest = chars.as_str();
            let rest = rest.strip_prefix(' ').ok_or_else(malformed)?;
            (protocol, rest)
        } else if let Some(rest) = line.strip_prefix("ICY ") {
            (Protocol::Http10, rest)
        } else {
            return Err(malformed());
        };

        if rest.len() < 3 || !rest.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
            return Err(malformed());
        }
        let code: u16 = rest[..3].parse().map_err(|_| malformed())?;

        let message = match rest.as_bytes().get(3) {
            None => String::new(),
            Some(b' ') => rest[4..].to_string(),
            Some(_) => return Err(malformed()),
        };

        Ok(StatusLine {
            protocol,
            code,
            message,
        })
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Http10 => f.write_str("HTTP/1.0")?,
            _ => f.write_str("HTTP/1.1")?,
        }
        write!(f, " {}", self.code)?;
        if !self.message.is_empty() {
            write!(f, " {}", self.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_http11() {
        let line = StatusLine::parse("HTTP/1.1 200 OK").unwrap();
        assert_eq!(line.protocol, Protocol::Http11);
        assert_eq!(line.code, 200);
        assert_eq!(line.message, "OK");
    }

    #[test]
    fn parse_empty_reason() {
        let line = StatusLine::parse("HTTP/1.0 503").unwrap();
        assert_eq!(line.protocol, Protocol::Http10);
        assert_eq!(line.code, 503);
        assert_eq!(line.message, "");
    }

    #[test]
    fn parse_icy() {
        let line = StatusLine::parse("ICY 200 OK").unwrap();
        assert_eq!(line.protocol, Protocol::Http10);
        assert_eq!(line.code, 200);
    }

    #[test]
    fn reason_may_contain_spaces() {
        let line = StatusLine::parse("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(line.message, "Not Found");
    }

    #[test]
    fn rejects_malformed() {
        assert!(StatusLine::parse("HTTP/2.0 200 OK").is_err());
        assert!(StatusLine::parse("HTTP/1.1200 OK").is_err());
        assert!(StatusLine::parse("HTTP/1.1 20 OK").is_err());
        assert!(StatusLine::parse("HTTP/1.1 20x OK").is_err());
        assert!(StatusLine::parse("HTTP/1.5 200 OK").is_err());
        assert!(StatusLine::parse("").is_err());
    }

    #[test]
    fn display_round_trip() {
        let line = StatusLine::parse("HTTP/1.1 301 Moved Permanently").unwrap();
        assert_eq!(line.to_string(), "HTTP/1.1 301 Moved Permanently");
    }
}
