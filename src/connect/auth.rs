//! Reactive authentication for 401 and 407 responses.

use std::fmt;

use base64::Engine as _;

use crate::connect::Route;
use crate::error::Result;
use crate::http::{Request, Response};

/// Supplies credentials after an authentication challenge.
///
/// Returns the request to retry with credentials attached, or `None` to give
/// up. Implementations must not loop: when the failed request already
/// carried their credentials, return `None`.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: Option<&Route>, response: &Response) -> Result<Option<Request>>;
}

impl fmt::Debug for dyn Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Authenticator")
    }
}

/// Never authenticates.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuthentication;

impl Authenticator for NoAuthentication {
    fn authenticate(&self, _route: Option<&Route>, _response: &Response) -> Result<Option<Request>> {
        Ok(None)
    }
}

/// The `Basic` credential value for a username and password.
pub fn basic_credentials(username: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", username, password));
    format!("Basic {}", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_encode() {
        assert_eq!(
            basic_credentials("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
