//! Proxy selection
//!
//! A proxy comes from one of three places, in order: the
//! `proxy_http_basic_authentication` option, the `proxy` option, or the
//! process environment. Environment lookups work on a [`ProxyEnv`] snapshot
//! taken once per call so a concurrent `set_var` cannot change the decision
//! halfway through.

use ipnetwork::IpNetwork;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::config::{BasicAuth, OpenOptions, ProxyOption};
use crate::error::{OpenError, Result};
use crate::target::{Scheme, Target};

const TRACKED_VARS: &[&str] = &[
    "http_proxy",
    "HTTP_PROXY",
    "https_proxy",
    "HTTPS_PROXY",
    "ftp_proxy",
    "FTP_PROXY",
    "no_proxy",
    "NO_PROXY",
    "REQUEST_METHOD",
    "CGI_HTTP_PROXY",
];

/// A proxy to send one request through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub url: Url,
    pub credentials: Option<BasicAuth>,
}

impl ProxyConfig {
    /// Proxy host without IPv6 brackets
    pub fn host(&self) -> String {
        match self.url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// Value for a `Proxy-Authorization` header
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(BasicAuth::header_value)
    }
}

/// Parse a proxy URI. Only `http://` proxies are supported; a value without
/// a scheme, as often found in `http_proxy`, is taken to be one.
pub fn parse_proxy_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| OpenError::Config(format!("invalid proxy URI {raw:?}: {e}")))?;

    if url.scheme() != "http" {
        return Err(OpenError::Config(format!("Non-HTTP proxy URI: {raw}")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(OpenError::Config(format!("proxy URI without host: {raw}")));
    }
    Ok(url)
}

fn proxy_from_url(url: Url, credentials: Option<BasicAuth>) -> ProxyConfig {
    let credentials = credentials.or_else(|| {
        if url.username().is_empty() {
            return None;
        }
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        Some(BasicAuth::new(
            decode(url.username()),
            url.password().map(decode).unwrap_or_default(),
        ))
    });

    let mut url = url;
    let _ = url.set_username("");
    let _ = url.set_password(None);
    ProxyConfig { url, credentials }
}

/// Immutable copy of the proxy-related environment variables
#[derive(Debug, Clone, Default)]
pub struct ProxyEnv {
    vars: BTreeMap<String, String>,
}

impl ProxyEnv {
    /// Snapshot the current process environment
    pub fn from_env() -> Self {
        Self::from_pairs(
            TRACKED_VARS
                .iter()
                .filter_map(|name| std::env::var(name).ok().map(|v| (*name, v))),
        )
    }

    /// Build a snapshot from explicit name/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// A snapshot with nothing set
    pub fn empty() -> Self {
        Self::default()
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn is_cgi(&self) -> bool {
        self.vars.contains_key("REQUEST_METHOD")
    }

    /// Raw proxy setting for a scheme, before any bypass rule
    pub fn proxy_for_scheme(&self, scheme: Scheme) -> Option<&str> {
        match scheme {
            // Under CGI the client controls HTTP_PROXY through a "Proxy:"
            // request header, so only CGI_HTTP_PROXY is trusted there.
            Scheme::Http if self.is_cgi() => self.get("CGI_HTTP_PROXY"),
            Scheme::Http => self.get("http_proxy").or_else(|| {
                let upper = self.get("HTTP_PROXY");
                if upper.is_some() {
                    warn!("The environment variable HTTP_PROXY is discouraged. Use http_proxy.");
                }
                upper
            }),
            Scheme::Https => self.get("https_proxy").or_else(|| self.get("HTTPS_PROXY")),
            Scheme::Ftp => self.get("ftp_proxy").or_else(|| self.get("FTP_PROXY")),
        }
    }

    pub fn no_proxy(&self) -> NoProxy {
        self.get("no_proxy")
            .or_else(|| self.get("NO_PROXY"))
            .map(NoProxy::parse)
            .unwrap_or_default()
    }

    /// Proxy the environment selects for `target`, if any
    pub fn find(&self, target: &Target) -> Result<Option<ProxyConfig>> {
        let Some(raw) = self.proxy_for_scheme(target.scheme()) else {
            return Ok(None);
        };

        if is_loopback(target.host()) {
            debug!("Proxy bypassed for loopback host {}", target.host());
            return Ok(None);
        }
        if self.no_proxy().matches(target.host(), target.port()) {
            debug!("Proxy bypassed by no_proxy for {}", target.host());
            return Ok(None);
        }

        let url = parse_proxy_url(raw)?;
        Ok(Some(proxy_from_url(url, None)))
    }
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NoProxyEntry {
    All,
    Network(IpNetwork),
    Host { name: String, port: Option<u16> },
}

/// Hosts that must be reached directly, parsed from `no_proxy`.
///
/// Entries are separated by commas or whitespace. Each is `*`, an IP
/// address or CIDR block, or a domain name optionally followed by `:port`.
/// A domain matches itself and all of its subdomains; a leading dot is
/// accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoProxy {
    entries: Vec<NoProxyEntry>,
}

impl NoProxy {
    pub fn parse(value: &str) -> Self {
        let entries = value
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(parse_no_proxy_entry)
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let ip = host.parse::<IpAddr>().ok();

        self.entries.iter().any(|entry| match entry {
            NoProxyEntry::All => true,
            NoProxyEntry::Network(net) => ip.is_some_and(|ip| net.contains(ip)),
            NoProxyEntry::Host { name, port: want } => {
                if want.is_some_and(|p| p != port) {
                    return false;
                }
                host == *name
                    || (host.len() > name.len()
                        && host.ends_with(name.as_str())
                        && host.as_bytes()[host.len() - name.len() - 1] == b'.')
            }
        })
    }
}

fn parse_no_proxy_entry(raw: &str) -> Option<NoProxyEntry> {
    if raw == "*" {
        return Some(NoProxyEntry::All);
    }

    if let Ok(ip) = raw.parse::<IpAddr>() {
        return IpNetwork::new(ip, if ip.is_ipv4() { 32 } else { 128 })
            .ok()
            .map(NoProxyEntry::Network);
    }
    if raw.contains('/') {
        return raw.parse::<IpNetwork>().ok().map(NoProxyEntry::Network);
    }

    // [v6]:port
    if let Some(rest) = raw.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']')?;
        let ip = addr.parse::<IpAddr>().ok()?;
        return match tail.strip_prefix(':') {
            Some(port) => Some(NoProxyEntry::Host {
                name: ip.to_string(),
                port: Some(port.parse().ok()?),
            }),
            None => IpNetwork::new(ip, 128).ok().map(NoProxyEntry::Network),
        };
    }

    let (name, port) = match raw.rsplit_once(':') {
        Some((name, port)) => (name, Some(port.parse::<u16>().ok()?)),
        None => (raw, None),
    };
    let name = name
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    Some(NoProxyEntry::Host { name, port })
}

/// Decide which proxy, if any, a request for `target` goes through
pub fn resolve_proxy(
    target: &Target,
    options: &OpenOptions,
    env: &ProxyEnv,
) -> Result<Option<ProxyConfig>> {
    if let Some(auth) = &options.proxy_http_basic_authentication {
        let url = parse_proxy_url(&auth.uri)?;
        return Ok(Some(proxy_from_url(url, Some(auth.credentials()))));
    }

    match &options.proxy {
        Some(ProxyOption::Disabled) => Ok(None),
        Some(ProxyOption::Uri(uri)) if uri.trim().is_empty() => Ok(None),
        Some(ProxyOption::Uri(uri)) => Ok(Some(proxy_from_url(parse_proxy_url(uri)?, None))),
        Some(ProxyOption::Environment) | None => env.find(target),
    }
}
