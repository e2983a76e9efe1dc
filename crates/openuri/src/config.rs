//! Options accepted by an open call
//!
//! Every recognised option is a typed field. Option sets loaded from JSON
//! reject unknown keys, and [`OpenOptions::validate`] enforces the
//! mutually-exclusive groups once, before any socket is opened.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OpenError, Result};
use crate::progress::{ContentLengthProc, ProgressProc};
use crate::proxy::parse_proxy_url;

/// Default connect and read budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default redirect hop ceiling
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// How the proxy for a call is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOption {
    /// Look at `http_proxy` and friends
    Environment,
    /// Connect directly
    Disabled,
    /// Use this proxy; it must be an `http://` URI
    Uri(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProxyRepr {
    Flag(bool),
    Uri(String),
}

fn deserialize_proxy<'de, D>(deserializer: D) -> std::result::Result<Option<ProxyOption>, D::Error>
where
    D: Deserializer<'de>,
{
    // A present key always counts as a proxy selection, even `null`.
    Ok(Some(match Option::<ProxyRepr>::deserialize(deserializer)? {
        None | Some(ProxyRepr::Flag(false)) => ProxyOption::Disabled,
        Some(ProxyRepr::Flag(true)) => ProxyOption::Environment,
        Some(ProxyRepr::Uri(uri)) => ProxyOption::Uri(uri),
    }))
}

fn serialize_proxy<S>(value: &Option<ProxyOption>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        None | Some(ProxyOption::Environment) => serializer.serialize_bool(true),
        Some(ProxyOption::Disabled) => serializer.serialize_bool(false),
        Some(ProxyOption::Uri(uri)) => serializer.serialize_str(uri),
    }
}

/// Username and password for HTTP basic authentication.
///
/// Deserializes from `["user", "pass"]` as well as an object.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(user:pass)>`
    pub fn header_value(&self) -> String {
        use base64::Engine;
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Proxy URI plus the credentials to present to it.
///
/// Deserializes from `["http://proxy:3128", "user", "pass"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub uri: String,
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(
        uri: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn credentials(&self) -> BasicAuth {
        BasicAuth::new(self.username.clone(), self.password.clone())
    }
}

/// Server certificate checking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SslVerifyMode {
    /// Validate the chain against the trust store and the host name
    #[default]
    #[serde(rename = "verify", alias = "verify_peer")]
    Verify,
    /// Skip chain validation. The host name is still checked.
    #[serde(rename = "verify_none")]
    VerifyNone,
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            None => Ok(None),
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!("invalid timeout {s}"))),
        }
    }
}

const fn default_true() -> bool {
    true
}

#[allow(clippy::unnecessary_wraps)]
const fn default_timeout() -> Option<Duration> {
    Some(DEFAULT_TIMEOUT)
}

const fn default_max_redirects() -> u32 {
    DEFAULT_MAX_REDIRECTS
}

/// Options for one open call
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenOptions {
    /// `None` when not given: the environment decides
    #[serde(
        default,
        deserialize_with = "deserialize_proxy",
        serialize_with = "serialize_proxy"
    )]
    pub proxy: Option<ProxyOption>,

    #[serde(default)]
    pub proxy_http_basic_authentication: Option<ProxyAuth>,

    #[serde(default)]
    pub http_basic_authentication: Option<BasicAuth>,

    /// Resend `http_basic_authentication` to other hosts reached by redirect
    #[serde(default)]
    pub redirect_basic_authentication: bool,

    #[serde(skip)]
    pub content_length_proc: Option<ContentLengthProc>,

    #[serde(skip)]
    pub progress_proc: Option<ProgressProc>,

    /// Follow 301/302/303/307/308
    #[serde(default = "default_true")]
    pub redirect: bool,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Budget for each individual read, `None` to wait forever
    #[serde(default = "default_timeout", with = "seconds")]
    pub read_timeout: Option<Duration>,

    /// Budget for connecting, tunnelling and the TLS handshake
    #[serde(default = "default_timeout", with = "seconds")]
    pub open_timeout: Option<Duration>,

    /// PEM file or directory of PEM files. The bundled roots are used when unset.
    #[serde(default)]
    pub ssl_ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub ssl_verify_mode: SslVerifyMode,

    /// Extra request headers; they replace defaults of the same name
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Let the FTP server connect back to us instead of using PASV
    #[serde(default)]
    pub ftp_active_mode: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            proxy_http_basic_authentication: None,
            http_basic_authentication: None,
            redirect_basic_authentication: false,
            content_length_proc: None,
            progress_proc: None,
            redirect: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            read_timeout: Some(DEFAULT_TIMEOUT),
            open_timeout: Some(DEFAULT_TIMEOUT),
            ssl_ca_cert: None,
            ssl_verify_mode: SslVerifyMode::Verify,
            headers: BTreeMap::new(),
            ftp_active_mode: false,
        }
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("proxy", &self.proxy)
            .field(
                "proxy_http_basic_authentication",
                &self.proxy_http_basic_authentication.as_ref().map(|p| &p.uri),
            )
            .field("http_basic_authentication", &self.http_basic_authentication)
            .field(
                "redirect_basic_authentication",
                &self.redirect_basic_authentication,
            )
            .field("content_length_proc", &self.content_length_proc.is_some())
            .field("progress_proc", &self.progress_proc.is_some())
            .field("redirect", &self.redirect)
            .field("max_redirects", &self.max_redirects)
            .field("read_timeout", &self.read_timeout)
            .field("open_timeout", &self.open_timeout)
            .field("ssl_ca_cert", &self.ssl_ca_cert)
            .field("ssl_verify_mode", &self.ssl_verify_mode)
            .field("headers", &self.headers)
            .field("ftp_active_mode", &self.ftp_active_mode)
            .finish()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON object, rejecting unknown keys
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| OpenError::Config(e.to_string()))
    }

    /// Defaults overridden by `OPENURI_*` environment variables.
    ///
    /// A variable that is set but malformed is a configuration error.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok();
        let invalid = |name: &str, raw: &str, why: &str| {
            OpenError::Config(format!("invalid {name} {raw:?}: {why}"))
        };
        let secs = |name: &str| -> Result<Option<Option<Duration>>> {
            let Some(raw) = var(name) else {
                return Ok(None);
            };
            match raw.trim() {
                "" | "none" => Ok(Some(None)),
                v => v
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(|s| Some(Some(Duration::from_secs_f64(s))))
                    .ok_or_else(|| invalid(name, &raw, "expected seconds or \"none\"")),
            }
        };

        let mut options = Self::default();
        if let Some(t) = secs("OPENURI_READ_TIMEOUT")? {
            options.read_timeout = t;
        }
        if let Some(t) = secs("OPENURI_OPEN_TIMEOUT")? {
            options.open_timeout = t;
        }
        if let Some(path) = var("OPENURI_SSL_CA_CERT") {
            options.ssl_ca_cert = Some(PathBuf::from(path));
        }
        if let Some(raw) = var("OPENURI_MAX_REDIRECTS") {
            options.max_redirects = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                invalid("OPENURI_MAX_REDIRECTS", &raw, &e.to_string())
            })?;
        }
        Ok(options)
    }

    pub fn with_proxy(mut self, proxy: ProxyOption) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_proxy_basic_auth(
        mut self,
        uri: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxy_http_basic_authentication = Some(ProxyAuth::new(uri, username, password));
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.http_basic_authentication = Some(BasicAuth::new(username, password));
        self
    }

    pub fn with_redirect_basic_auth(mut self, forward: bool) -> Self {
        self.redirect_basic_authentication = forward;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_content_length_proc<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<u64>) + Send + Sync + 'static,
    {
        self.content_length_proc = Some(Arc::new(f));
        self
    }

    pub fn with_progress_proc<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.progress_proc = Some(Arc::new(f));
        self
    }

    pub fn with_redirect(mut self, follow: bool) -> Self {
        self.redirect = follow;
        self
    }

    pub fn with_max_redirects(mut self, limit: u32) -> Self {
        self.max_redirects = limit;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_ca_cert = Some(path.into());
        self
    }

    pub fn with_verify_mode(mut self, mode: SslVerifyMode) -> Self {
        self.ssl_verify_mode = mode;
        self
    }

    pub fn with_ftp_active_mode(mut self, active: bool) -> Self {
        self.ftp_active_mode = active;
        self
    }

    /// Check option consistency. Runs before any network I/O.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.is_some() && self.proxy_http_basic_authentication.is_some() {
            return Err(OpenError::Config(
                "multiple proxy options specified: proxy and proxy_http_basic_authentication"
                    .to_string(),
            ));
        }

        if let Some(ProxyOption::Uri(uri)) = &self.proxy {
            if !uri.trim().is_empty() {
                parse_proxy_url(uri)?;
            }
        }
        if let Some(auth) = &self.proxy_http_basic_authentication {
            parse_proxy_url(&auth.uri)?;
        }

        if let Some(path) = &self.ssl_ca_cert {
            if !path.exists() {
                return Err(OpenError::Config(format!(
                    "ssl_ca_cert not found: {}",
                    path.display()
                )));
            }
        }

        for (name, value) in &self.headers {
            if name.is_empty() || !name.bytes().all(is_header_name_byte) {
                return Err(OpenError::Config(format!("invalid header name: {name:?}")));
            }
            if value.contains(['\r', '\n', '\0']) {
                return Err(OpenError::Config(format!(
                    "invalid value for header {name}: {value:?}"
                )));
            }
        }

        Ok(())
    }
}

const fn is_header_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::float_cmp
)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let options = OpenOptions::default();
        assert!(options.proxy.is_none());
        assert!(options.redirect);
        assert_eq!(options.max_redirects, 5);
        assert_eq!(options.read_timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.open_timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.ssl_verify_mode, SslVerifyMode::Verify);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_multiple_proxy_options_rejected() {
        let options = OpenOptions::new()
            .with_proxy(ProxyOption::Uri("http://p:3128/".to_string()))
            .with_proxy_basic_auth("http://p:3128/", "u", "p");
        assert!(matches!(options.validate(), Err(OpenError::Config(_))));

        // Even an explicit "no proxy" conflicts.
        let options = OpenOptions::new()
            .with_proxy(ProxyOption::Disabled)
            .with_proxy_basic_auth("http://p:3128/", "u", "p");
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_non_http_proxy_rejected() {
        let options = OpenOptions::new().with_proxy(ProxyOption::Uri("socks5://p:1080".to_string()));
        assert!(matches!(options.validate(), Err(OpenError::Config(_))));

        let options = OpenOptions::new().with_proxy_basic_auth("ftp://p/", "u", "p");
        assert!(matches!(options.validate(), Err(OpenError::Config(_))));

        let options = OpenOptions::new().with_proxy(ProxyOption::Uri(String::new()));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_header_injection_rejected() {
        let options = OpenOptions::new().with_header("X-Evil", "a\r\nHost: other");
        assert!(options.validate().is_err());
        let options = OpenOptions::new().with_header("Bad Name", "v");
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_missing_ca_cert_rejected() {
        let options = OpenOptions::new().with_ca_cert("/definitely/not/here.pem");
        assert!(matches!(options.validate(), Err(OpenError::Config(_))));
    }

    #[test]
    fn test_from_json() {
        let options = OpenOptions::from_json(
            r#"{
                "proxy": "http://proxy.example:3128/",
                "http_basic_authentication": ["user", "pass"],
                "read_timeout": 0.5,
                "open_timeout": null,
                "ssl_verify_mode": "verify_none",
                "headers": {"Accept-Language": "en"},
                "ftp_active_mode": true
            }"#,
        )
        .unwrap();

        assert_eq!(
            options.proxy,
            Some(ProxyOption::Uri("http://proxy.example:3128/".to_string()))
        );
        assert_eq!(
            options.http_basic_authentication,
            Some(BasicAuth::new("user", "pass"))
        );
        assert_eq!(options.read_timeout, Some(Duration::from_millis(500)));
        assert_eq!(options.open_timeout, None);
        assert_eq!(options.ssl_verify_mode, SslVerifyMode::VerifyNone);
        assert_eq!(options.headers.get("Accept-Language").map(String::as_str), Some("en"));
        assert!(options.ftp_active_mode);
        assert!(options.redirect);
    }

    #[test]
    fn test_from_json_proxy_states() {
        let off = OpenOptions::from_json(r#"{"proxy": null}"#).unwrap();
        assert_eq!(off.proxy, Some(ProxyOption::Disabled));
        let off = OpenOptions::from_json(r#"{"proxy": false}"#).unwrap();
        assert_eq!(off.proxy, Some(ProxyOption::Disabled));
        let env = OpenOptions::from_json(r#"{"proxy": true}"#).unwrap();
        assert_eq!(env.proxy, Some(ProxyOption::Environment));
        let unset = OpenOptions::from_json("{}").unwrap();
        assert_eq!(unset.proxy, None);
    }

    #[test]
    fn test_from_json_unknown_key_rejected() {
        let err = OpenOptions::from_json(r#"{"proxxy": true}"#).unwrap_err();
        assert!(matches!(err, OpenError::Config(_)));
    }

    #[test]
    fn test_from_json_proxy_auth_tuple() {
        let options = OpenOptions::from_json(
            r#"{"proxy_http_basic_authentication": ["http://p:8080/", "pu", "pp"]}"#,
        )
        .unwrap();
        assert_eq!(
            options.proxy_http_basic_authentication,
            Some(ProxyAuth::new("http://p:8080/", "pu", "pp"))
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let auth = BasicAuth::new("Aladdin", "open sesame");
        assert_eq!(auth.header_value(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(!format!("{auth:?}").contains("sesame"));
    }

    #[test]
    fn test_from_env() {
        // Only this test touches OPENURI_* variables.
        unsafe {
            std::env::set_var("OPENURI_READ_TIMEOUT", "2.5");
            std::env::set_var("OPENURI_OPEN_TIMEOUT", "none");
            std::env::set_var("OPENURI_MAX_REDIRECTS", "9");
        }
        let options = OpenOptions::from_env().unwrap();
        assert_eq!(options.read_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(options.open_timeout, None);
        assert_eq!(options.max_redirects, 9);

        unsafe {
            std::env::set_var("OPENURI_MAX_REDIRECTS", "lots");
        }
        let err = OpenOptions::from_env().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("OPENURI_MAX_REDIRECTS"), "{err}");

        unsafe {
            std::env::set_var("OPENURI_MAX_REDIRECTS", "9");
            std::env::set_var("OPENURI_READ_TIMEOUT", "-1");
        }
        let err = OpenOptions::from_env().unwrap_err();
        assert!(err.to_string().contains("OPENURI_READ_TIMEOUT"), "{err}");

        unsafe {
            std::env::set_var("OPENURI_READ_TIMEOUT", "soon");
        }
        assert!(OpenOptions::from_env().unwrap_err().is_config());

        unsafe {
            std::env::remove_var("OPENURI_READ_TIMEOUT");
            std::env::remove_var("OPENURI_OPEN_TIMEOUT");
            std::env::remove_var("OPENURI_MAX_REDIRECTS");
        }
    }
}
