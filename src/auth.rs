//! Proxy credential validation for `Proxy-Authorization: Basic ...`.

use base64::{Engine as _, engine::general_purpose};
use http::HeaderValue;
use http::header::{HeaderMap, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};

pub const BASIC_PREFIX: &str = "Basic ";
pub const CHALLENGE: &str = "Basic realm=\"Proxy\"";

/// The single identity the proxy accepts.
#[derive(Debug, Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

/// Why a credential was refused. Only ever logged, never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    Missing,
    UnsupportedScheme,
    InvalidEncoding,
    Malformed,
    Mismatch,
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            AuthRejection::Missing => "missing Proxy-Authorization header",
            AuthRejection::UnsupportedScheme => "unsupported authentication scheme",
            AuthRejection::InvalidEncoding => "invalid base64 payload",
            AuthRejection::Malformed => "credentials are not user:password",
            AuthRejection::Mismatch => "invalid username or password",
        };
        f.write_str(reason)
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Checks a raw header value. Scheme token is case-sensitive and the
    /// decoded pair is compared byte for byte.
    pub fn verify(&self, header: Option<&[u8]>) -> Result<(), AuthRejection> {
        let header = header.ok_or(AuthRejection::Missing)?;
        let encoded = header
            .strip_prefix(BASIC_PREFIX.as_bytes())
            .ok_or(AuthRejection::UnsupportedScheme)?;

        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AuthRejection::InvalidEncoding)?;

        let colon = decoded
            .iter()
            .position(|b| *b == b':')
            .ok_or(AuthRejection::Malformed)?;
        let (username, password) = (&decoded[..colon], &decoded[colon + 1..]);

        if username == self.username.as_bytes() && password == self.password.as_bytes() {
            Ok(())
        } else {
            Err(AuthRejection::Mismatch)
        }
    }

    /// Reads `Proxy-Authorization` from a header map. Repeated headers are
    /// judged on the first value only.
    pub fn verify_headers(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        self.verify(headers.get(PROXY_AUTHORIZATION).map(HeaderValue::as_bytes))
    }
}

/// Renders `Basic base64(username:password)`.
pub fn basic_authorization(username: &str, password: &str) -> String {
    let encoded = general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("{}{}", BASIC_PREFIX, encoded)
}

/// Header pair asking the client to authenticate again.
pub fn challenge_header() -> (http::HeaderName, HeaderValue) {
    (PROXY_AUTHENTICATE, HeaderValue::from_static(CHALLENGE))
}
