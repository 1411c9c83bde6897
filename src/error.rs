use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy authentication required")]
    AuthRejected,

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Connection does not support raw takeover")]
    HijackUnsupported,

    #[error("Client connection went away before the reply")]
    ClientGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

impl ProxyError {
    /// Status reported to the client when this error ends an exchange
    /// that has not emitted a response yet.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::AuthRejected => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ProtocolViolation(_) | ProxyError::Url(_) => StatusCode::BAD_REQUEST,
            ProxyError::HeadTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text body sent alongside `status_code`.
    pub fn client_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => "Proxy Authentication Required",
            StatusCode::BAD_GATEWAY => "Bad Gateway",
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE => "Request Header Fields Too Large",
            _ => "Internal Server Error",
        }
    }
}
