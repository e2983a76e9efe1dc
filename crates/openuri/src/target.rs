//! Parsed open targets

use percent_encoding::percent_decode_str;
use std::fmt;
use url::{Host, Url};

use crate::error::{OpenError, Result};

/// Schemes the fetcher can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ftp" => Some(Self::Ftp),
            _ => None,
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            Self::Ftp => 21,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
        }
    }

    pub const fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FTP transfer type selected by a `;type=` suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpType {
    Ascii,
    Binary,
}

/// Directory and file components of an FTP path, percent-decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpPath {
    pub directories: Vec<String>,
    pub filename: String,
}

/// An immutable, validated location to open
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
    scheme: Scheme,
    host: String,
    port: u16,
    typecode: Option<FtpType>,
}

impl Target {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| OpenError::invalid_uri(input, e.to_string()))?;
        Self::from_url(url)
    }

    pub fn from_url(mut url: Url) -> Result<Self> {
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            OpenError::invalid_uri(url.as_str(), format!("unsupported scheme {}", url.scheme()))
        })?;

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(OpenError::invalid_uri(url.as_str(), "missing host")),
        };

        if scheme.is_http() && (!url.username().is_empty() || url.password().is_some()) {
            return Err(OpenError::invalid_uri(
                url.as_str(),
                "userinfo not supported [RFC3986]",
            ));
        }

        let typecode = if scheme == Scheme::Ftp {
            extract_typecode(&mut url)?
        } else {
            None
        };

        let port = url.port().unwrap_or_else(|| scheme.default_port());
        url.set_fragment(None);

        Ok(Self {
            url,
            scheme,
            host,
            port,
            typecode,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host without IPv6 brackets, suitable for DNS and SNI
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn typecode(&self) -> Option<FtpType> {
        self.typecode
    }

    /// `host:port` as used in a CONNECT request line
    pub fn authority(&self) -> String {
        format!("{}:{}", bracketed(&self.host), self.port)
    }

    /// Value for the `Host` header; the port is omitted when it is the default
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            bracketed(&self.host)
        } else {
            self.authority()
        }
    }

    /// Origin-form request target: path plus query
    pub fn request_target(&self) -> String {
        let mut out = self.url.path().to_string();
        if out.is_empty() {
            out.push('/');
        }
        if let Some(query) = self.url.query() {
            out.push('?');
            out.push_str(query);
        }
        out
    }

    /// Absolute-form request target, used when talking to a plain HTTP proxy.
    ///
    /// FTP userinfo is kept: the proxy performs the login.
    pub fn absolute_target(&self) -> String {
        let mut url = self.url.clone();
        if let Some(FtpType::Ascii) = self.typecode {
            url.set_path(&format!("{};type=a", url.path()));
        } else if let Some(FtpType::Binary) = self.typecode {
            url.set_path(&format!("{};type=i", url.path()));
        }
        url.to_string()
    }

    /// Percent-decoded `(user, password)` from the URI, if any
    pub fn userinfo(&self) -> Option<(String, Option<String>)> {
        if self.url.username().is_empty() {
            return None;
        }
        let user = percent_decode_str(self.url.username())
            .decode_utf8_lossy()
            .into_owned();
        let password = self
            .url
            .password()
            .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned());
        Some((user, password))
    }

    /// Split an FTP path into directories and file name.
    ///
    /// The leading `/` separates the path from the authority and is not part
    /// of the first directory; an encoded `%2F` there requests an absolute
    /// path. Segments are percent-decoded; a decoded segment containing CR or
    /// LF is rejected so nothing can be smuggled onto the control channel.
    pub fn ftp_path(&self) -> Result<FtpPath> {
        let raw = self.url.path();
        let raw = raw.strip_prefix('/').unwrap_or(raw);
        let mut segments: Vec<String> = raw
            .split('/')
            .map(|s| {
                let bytes: Vec<u8> = percent_decode_str(s).collect();
                String::from_utf8_lossy(&bytes).into_owned()
            })
            .collect();

        let filename = segments.pop().unwrap_or_default();
        if filename.is_empty() {
            return Err(OpenError::invalid_uri(self.url.as_str(), "no filename"));
        }

        for dir in &segments {
            if dir.contains(['\r', '\n']) {
                return Err(OpenError::invalid_uri(
                    self.url.as_str(),
                    format!("invalid directory: {dir:?}"),
                ));
            }
        }
        if filename.contains(['\r', '\n']) {
            return Err(OpenError::invalid_uri(
                self.url.as_str(),
                format!("invalid filename: {filename:?}"),
            ));
        }

        segments.retain(|d| !d.is_empty());
        Ok(FtpPath {
            directories: segments,
            filename,
        })
    }

    /// Scheme, host and port; used to decide whether credentials still apply
    pub fn origin(&self) -> (Scheme, String, u16) {
        (self.scheme, self.host.to_ascii_lowercase(), self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Strip a trailing `;type=X` from the last path segment
fn extract_typecode(url: &mut Url) -> Result<Option<FtpType>> {
    let path = url.path().to_string();
    let Some(idx) = path.rfind(";type=") else {
        return Ok(None);
    };
    if path[idx..].contains('/') {
        return Ok(None);
    }

    let code = &path[idx + ";type=".len()..];
    let typecode = match code {
        "a" | "A" => FtpType::Ascii,
        "i" | "I" => FtpType::Binary,
        _ => {
            return Err(OpenError::invalid_uri(
                url.as_str(),
                format!("invalid typecode: {code:?}"),
            ));
        }
    };
    url.set_path(&path[..idx]);
    Ok(Some(typecode))
}
