//! Request encoding

use std::collections::BTreeMap;

use crate::config::BasicAuth;
use crate::target::Target;

/// `User-Agent` sent unless the caller overrides it
pub const USER_AGENT: &str = concat!("openuri/", env!("CARGO_PKG_VERSION"));

/// A GET request ready to be written to the wire
#[derive(Debug, Clone)]
pub struct GetRequest {
    request_target: String,
    headers: Vec<(String, String)>,
}

impl GetRequest {
    /// Build a GET for `target`.
    ///
    /// `absolute_form` is set when the request is sent to a plain HTTP proxy
    /// rather than the origin (or a CONNECT tunnel to it).
    pub fn new(target: &Target, absolute_form: bool) -> Self {
        let request_target = if absolute_form {
            target.absolute_target()
        } else {
            target.request_target()
        };

        let headers = vec![
            ("Host".to_string(), target.host_header()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
            ("Accept".to_string(), "*/*".to_string()),
            ("Connection".to_string(), "close".to_string()),
        ];
        Self {
            request_target,
            headers,
        }
    }

    /// Set a header, replacing any existing one with the same name
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn with_authorization(mut self, auth: Option<&BasicAuth>) -> Self {
        if let Some(auth) = auth {
            self.set("Authorization", auth.header_value());
        }
        self
    }

    pub fn with_proxy_authorization(mut self, value: Option<String>) -> Self {
        if let Some(value) = value {
            self.set("Proxy-Authorization", value);
        }
        self
    }

    /// Caller headers win over the defaults
    pub fn with_headers(mut self, extra: &BTreeMap<String, String>) -> Self {
        for (name, value) in extra {
            self.set(name, value.clone());
        }
        self
    }

    pub fn request_target(&self) -> &str {
        &self.request_target
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("GET {} HTTP/1.1\r\n", self.request_target);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}
