//! HTTP client: one GET per hop, following redirects
//!
//! Every hop opens its own connection (`Connection: close`). Redirect state
//! lives in a [`RedirectState`] owned by the call, so nothing leaks between
//! calls.

pub mod request;
pub mod response;

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::{BasicAuth, OpenOptions};
use crate::decode::{decode_content, decode_content_or_raw, read_body};
use crate::error::{HttpError, OpenError, ResponseOrigin, Result};
use crate::handle::ResourceHandle;
use crate::progress::ProgressReporter;
use crate::proxy::{ProxyConfig, ProxyEnv, resolve_proxy};
use crate::target::{Scheme, Target};
use crate::tls;
use crate::transport::{ConnectParams, connect};

use request::GetRequest;

/// Status codes that are followed as redirects
pub const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

fn normalize(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Per-call redirect bookkeeping
#[derive(Debug)]
pub struct RedirectState {
    hops: u32,
    limit: u32,
    visited: HashSet<String>,
    origin: (Scheme, String, u16),
}

impl RedirectState {
    pub fn new(start: &Target, limit: u32) -> Self {
        let mut visited = HashSet::new();
        visited.insert(normalize(start.url()));
        Self {
            hops: 0,
            limit,
            visited,
            origin: start.origin(),
        }
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    /// Whether `target` is on the scheme, host and port the call started on
    pub fn same_origin(&self, target: &Target) -> bool {
        target.origin() == self.origin
    }

    /// Validate and record a redirect from `from` to `to`
    pub fn follow(&mut self, from: &Target, to: Url) -> Result<Target> {
        let to_scheme = to.scheme().to_ascii_lowercase();
        let allowed = match from.scheme() {
            Scheme::Https => to_scheme == "https",
            Scheme::Http | Scheme::Ftp => to_scheme == "http" || to_scheme == "https",
        };
        if !allowed {
            return Err(OpenError::RedirectForbidden {
                from: from.url().clone(),
                to: to.to_string(),
            });
        }

        let next = Target::from_url(to)?;
        if !self.visited.insert(normalize(next.url())) {
            return Err(OpenError::RedirectLoop(next.url().clone()));
        }
        if self.hops >= self.limit {
            return Err(OpenError::TooManyRedirects { limit: self.limit });
        }
        self.hops += 1;
        Ok(next)
    }
}

enum Outcome {
    Done(ResourceHandle),
    Redirect(Box<HttpError>),
}

/// Fetch `target` over HTTP(S), or an FTP URI through an HTTP proxy
pub async fn fetch(target: Target, options: &OpenOptions, env: &ProxyEnv) -> Result<ResourceHandle> {
    let mut state = RedirectState::new(&target, options.max_redirects);
    let mut tls_config: Option<Arc<rustls::ClientConfig>> = None;
    let mut current = target;

    loop {
        let proxy = resolve_proxy(&current, options, env)?;
        if current.scheme() == Scheme::Https && tls_config.is_none() {
            tls_config = Some(tls::client_config(options)?);
        }

        let auth = options
            .http_basic_authentication
            .as_ref()
            .filter(|_| options.redirect_basic_authentication || state.same_origin(&current));

        let outcome = exchange(&current, proxy.as_ref(), auth, tls_config.clone(), options).await?;
        let redirect = match outcome {
            Outcome::Done(handle) => return Ok(handle),
            Outcome::Redirect(err) => err,
        };

        if !options.redirect {
            return Err(OpenError::Http(redirect));
        }
        let Some(location) = redirect.location.clone() else {
            return Err(OpenError::Http(redirect));
        };
        let next = match current.url().join(&location) {
            Ok(url) => url,
            Err(e) => {
                debug!("Unparsable Location {location:?}: {e}");
                return Err(OpenError::Http(redirect));
            }
        };

        let next = state.follow(&current, next)?;
        debug!(
            "Redirect {} ({}): {} -> {}",
            state.hops(),
            redirect.status().code(),
            current,
            next
        );
        current = next;
    }
}

/// One request/response over a fresh connection
async fn exchange(
    target: &Target,
    proxy: Option<&ProxyConfig>,
    auth: Option<&BasicAuth>,
    tls: Option<Arc<rustls::ClientConfig>>,
    options: &OpenOptions,
) -> Result<Outcome> {
    let mut conn = connect(ConnectParams {
        target,
        proxy,
        tls,
        open_timeout: options.open_timeout,
        read_timeout: options.read_timeout,
    })
    .await?;

    // Plain requests through a proxy name the full URI; https ones
    // already go through a CONNECT tunnel.
    let via_proxy = proxy.filter(|_| target.scheme() != Scheme::Https);
    let request = GetRequest::new(target, via_proxy.is_some())
        .with_authorization(auth)
        .with_proxy_authorization(via_proxy.and_then(ProxyConfig::authorization))
        .with_headers(&options.headers);

    match via_proxy {
        Some(p) => debug!("GET {} via {}", request.request_target(), p.url),
        None => debug!("GET {}", target),
    }
    conn.write_all(&request.encode()).await?;

    let head = response::read_head(&mut conn).await?;
    let code = head.code();
    debug!("{} {}", head.status, target);
    let framing = head.framing()?;

    if head.status.is_success() {
        let mut reporter = ProgressReporter::new(
            options.content_length_proc.as_ref(),
            options.progress_proc.as_ref(),
        );
        let body = read_body(&mut conn, framing, &mut reporter).await?;
        let meta = head.into_meta(Some(target.url().clone()));
        let body = decode_content(&meta.content_encoding(), body)?;
        return Ok(Outcome::Done(ResourceHandle::new(meta, body)));
    }

    let body = read_body(&mut conn, framing, &mut ProgressReporter::silent()).await?;
    let location = REDIRECT_CODES
        .contains(&code)
        .then(|| head.location())
        .flatten();
    let (origin, credentials_offered) = if code == 407 {
        (
            ResponseOrigin::Proxy,
            proxy.is_some_and(|p| p.credentials.is_some()),
        )
    } else {
        (ResponseOrigin::Server, auth.is_some())
    };
    let meta = head.into_meta(Some(target.url().clone()));
    let body = decode_content_or_raw(&meta.content_encoding(), body);
    let err = Box::new(HttpError {
        io: ResourceHandle::new(meta, body),
        origin,
        location,
        credentials_offered,
    });

    if REDIRECT_CODES.contains(&code) {
        return Ok(Outcome::Redirect(err));
    }
    Err(OpenError::Http(err))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn target(s: &str) -> Target {
        Target::parse(s).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_redirect_loop_detected() {
        let a = target("http://a.example/");
        let mut state = RedirectState::new(&a, 5);
        let b = state.follow(&a, url("http://b.example/")).unwrap();
        let err = state.follow(&b, url("http://a.example/#frag")).unwrap_err();
        assert!(matches!(err, OpenError::RedirectLoop(_)));
    }

    #[test]
    fn test_redirect_budget() {
        let start = target("http://h/0");
        let mut state = RedirectState::new(&start, 2);
        let one = state.follow(&start, url("http://h/1")).unwrap();
        let two = state.follow(&one, url("http://h/2")).unwrap();
        let err = state.follow(&two, url("http://h/3")).unwrap_err();
        assert!(matches!(err, OpenError::TooManyRedirects { limit: 2 }));
    }

    #[test]
    fn test_redirect_scheme_rules() {
        let http = target("http://h/");
        let mut state = RedirectState::new(&http, 5);
        assert!(matches!(
            state.follow(&http, url("file:///etc/passwd")).unwrap_err(),
            OpenError::RedirectForbidden { .. }
        ));
        assert!(matches!(
            state.follow(&http, url("ftp://h/file")).unwrap_err(),
            OpenError::RedirectForbidden { .. }
        ));
        assert!(state.follow(&http, url("https://h/")).is_ok());

        let https = target("https://h/");
        let mut state = RedirectState::new(&https, 5);
        assert!(matches!(
            state.follow(&https, url("http://h/plain")).unwrap_err(),
            OpenError::RedirectForbidden { .. }
        ));
    }

    #[test]
    fn test_same_origin() {
        let start = target("http://h:8080/a");
        let state = RedirectState::new(&start, 5);
        assert!(state.same_origin(&target("http://H:8080/b")));
        assert!(!state.same_origin(&target("http://h:8081/a")));
        assert!(!state.same_origin(&target("http://other:8080/a")));
    }
}
