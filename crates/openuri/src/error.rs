//! Error types for open operations

use std::fmt;
use thiserror::Error;
use url::Url;

use crate::handle::ResourceHandle;
use crate::meta::StatusLine;

/// Which part of a call exceeded its time budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// TCP connect, proxy tunnel setup or TLS handshake
    Connect,
    /// A single read or write on an established connection
    Read,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Who produced the response carried by an [`HttpError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// The origin server (possibly reached through a proxy)
    Server,
    /// The proxy itself, answering a CONNECT or refusing authentication
    Proxy,
}

/// A terminal HTTP response that did not yield a resource.
///
/// The full response is kept in [`HttpError::io`] for inspection: status line,
/// headers, the URI that produced it and whatever body the peer sent.
#[derive(Debug)]
pub struct HttpError {
    /// The response, readable like a successful one
    pub io: ResourceHandle,
    /// Server or proxy
    pub origin: ResponseOrigin,
    /// Raw `Location` header when the status was a redirect
    pub location: Option<String>,
    /// Whether basic-auth credentials were attached to the failing request.
    ///
    /// Distinguishes "credentials rejected" from "credentials never offered"
    /// on a 401/407.
    pub credentials_offered: bool,
}

impl HttpError {
    /// Status line of the carried response
    pub fn status(&self) -> &StatusLine {
        self.io.status()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.io.status();
        write!(f, "{} {}", status.code(), status.message())?;
        if self.origin == ResponseOrigin::Proxy {
            write!(f, " (from proxy)")?;
        }
        if let Some(location) = &self.location {
            write!(f, " (redirect to {location})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(Box<HttpError>),

    #[error("Redirection forbidden: {from} -> {to}")]
    RedirectForbidden { from: Url, to: String },

    #[error("HTTP redirection loop: {0}")]
    RedirectLoop(Url),

    #[error("Too many redirects (limit {limit})")]
    TooManyRedirects { limit: u32 },

    #[error("FTP error on {command}: {reply}")]
    Ftp { command: String, reply: String },

    #[error("Timeout during {phase}")]
    Timeout { phase: TimeoutPhase },

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpenError {
    pub(crate) fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Classify an error raised by socket I/O.
    ///
    /// rustls reports handshake failures through `std::io::Error`; those are
    /// unwrapped into [`OpenError::Tls`] so certificate problems stay visible.
    pub(crate) fn from_network(err: std::io::Error) -> Self {
        if let Some(tls) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::Tls(tls.clone());
        }
        Self::Network(err)
    }

    /// Whether a connect or read budget was exceeded
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether TLS negotiation or certificate validation failed
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Whether the error was raised before any network I/O
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InvalidUri { .. })
    }

    /// The carried response, for HTTP-level failures
    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            Self::Http(err) => Some(err),
            _ => None,
        }
    }

    /// Status line of the carried response, for HTTP-level failures
    pub fn status(&self) -> Option<&StatusLine> {
        self.http_error().map(HttpError::status)
    }
}

pub type Result<T> = std::result::Result<T, OpenError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::meta::Meta;

    fn not_found() -> HttpError {
        let url = Url::parse("http://example.com/missing").unwrap();
        let meta = Meta::new(StatusLine::new("404", "Not Found"), Some(url));
        HttpError {
            io: ResourceHandle::new(meta, b"gone".to_vec()),
            origin: ResponseOrigin::Server,
            location: None,
            credentials_offered: false,
        }
    }

    #[test]
    fn test_http_error_display() {
        let err = OpenError::Http(Box::new(not_found()));
        assert_eq!(err.to_string(), "HTTP error: 404 Not Found");
        assert_eq!(err.status().map(StatusLine::code), Some("404"));
    }

    #[test]
    fn test_proxy_origin_display() {
        let mut err = not_found();
        err.origin = ResponseOrigin::Proxy;
        assert_eq!(err.to_string(), "404 Not Found (from proxy)");
    }

    #[test]
    fn test_tls_errors_are_unwrapped_from_io() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(OpenError::from_network(io).is_tls());

        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            OpenError::from_network(io),
            OpenError::Network(_)
        ));
    }

    #[test]
    fn test_classification() {
        assert!(OpenError::Config("x".to_string()).is_config());
        assert!(OpenError::invalid_uri("ftp://h/a", "bad").is_config());
        assert!(
            OpenError::Timeout {
                phase: TimeoutPhase::Read
            }
            .is_timeout()
        );
        assert!(OpenError::Protocol("x".to_string()).status().is_none());
    }
}
