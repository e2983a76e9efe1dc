//! # openuri - open http, https and ftp resources
//!
//! One call opens one resource and returns its body together with the
//! response metadata. Along the way the fetcher handles:
//!
//! - **Redirects**: 301/302/303/307/308 up to a hop limit, with loop detection
//!   and no downgrade from https
//! - **Proxies**: explicit or from `http_proxy`/`https_proxy`/`ftp_proxy`,
//!   `no_proxy` bypass, CONNECT tunnels for https, FTP relayed as HTTP
//! - **Authentication**: HTTP and proxy basic auth, never forwarded to
//!   another host unless asked to
//! - **Decoding**: chunked transfer coding, gzip and deflate content codings
//! - **TLS**: certificates checked against a CA file or directory, or the
//!   bundled Mozilla roots
//! - **FTP**: passive (PASV/EPSV) and active (PORT/EPRT) data connections
//! - **Progress**: content-length and byte-count callbacks
//!
//! Nothing is retried. Failures are reported through [`OpenError`], which
//! keeps the final response of an HTTP failure for inspection.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use openuri::{OpenOptions, open};
//! use std::io::Read;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = OpenOptions::new()
//!         .with_progress_proc(|n| eprintln!("{n} bytes"));
//!     let mut handle = open("https://example.com/", &options).await?;
//!
//!     println!("{} {}", handle.status().code(), handle.content_type());
//!     let mut body = String::new();
//!     handle.read_to_string(&mut body)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! Requests, redirects, proxy decisions and FTP commands are logged through
//! `tracing` at debug level; FTP passwords are masked.

pub mod config;
pub mod decode;
pub mod error;
pub mod ftp;
pub mod handle;
pub mod http;
pub mod meta;
pub mod progress;
pub mod proxy;
pub mod target;
pub mod tls;
pub mod transport;

pub use config::{BasicAuth, OpenOptions, ProxyAuth, ProxyOption, SslVerifyMode};
pub use error::{HttpError, OpenError, ResponseOrigin, Result, TimeoutPhase};
pub use handle::ResourceHandle;
pub use meta::{ContentType, Meta, StatusLine};
pub use progress::{ContentLengthProc, ProgressProc};
pub use proxy::{NoProxy, ProxyConfig, ProxyEnv};
pub use target::{Scheme, Target};

use tracing::debug;
use url::Url;

/// Opens resources with a fixed set of options
#[derive(Debug, Clone, Default)]
pub struct Opener {
    options: OpenOptions,
    proxy_env: Option<ProxyEnv>,
}

impl Opener {
    pub fn new(options: OpenOptions) -> Self {
        Self {
            options,
            proxy_env: None,
        }
    }

    /// Use this snapshot instead of reading the process environment
    pub fn with_proxy_env(mut self, env: ProxyEnv) -> Self {
        self.proxy_env = Some(env);
        self
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// Open the resource at `uri`
    pub async fn open(&self, uri: &str) -> Result<ResourceHandle> {
        self.options.validate()?;
        self.open_target(Target::parse(uri)?).await
    }

    /// Open an already parsed URL
    pub async fn open_url(&self, url: Url) -> Result<ResourceHandle> {
        self.options.validate()?;
        self.open_target(Target::from_url(url)?).await
    }

    /// Open `uri` and hand the resource to `f`.
    ///
    /// Every connection is closed before `f` runs, whatever it does.
    pub async fn open_with<F, T>(&self, uri: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ResourceHandle) -> T,
    {
        let mut handle = self.open(uri).await?;
        Ok(f(&mut handle))
    }

    /// Open `uri` from synchronous code.
    ///
    /// Runs the call on a private current-thread runtime, so it must not be
    /// called from within an async context.
    pub fn open_blocking(&self, uri: &str) -> Result<ResourceHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.open(uri))
    }

    async fn open_target(&self, target: Target) -> Result<ResourceHandle> {
        let env = self.proxy_env.clone().unwrap_or_else(ProxyEnv::from_env);
        debug!("Opening {target}");

        if target.scheme() != Scheme::Ftp {
            return http::fetch(target, &self.options, &env).await;
        }

        // Reject unsafe paths before any connection is made, proxied or not.
        target.ftp_path()?;
        ftp::login_credentials(&target)?;

        match proxy::resolve_proxy(&target, &self.options, &env)? {
            Some(proxy) => {
                debug!("Relaying {target} through HTTP proxy {}", proxy.url);
                http::fetch(target, &self.options, &env).await
            }
            None => ftp::fetch(&target, &self.options).await,
        }
    }
}

/// Open the resource at `uri` with `options`
pub async fn open(uri: &str, options: &OpenOptions) -> Result<ResourceHandle> {
    Opener::new(options.clone()).open(uri).await
}

/// Open `uri` and pass the resource to `f`; see [`Opener::open_with`]
pub async fn open_with<F, T>(uri: &str, options: &OpenOptions, f: F) -> Result<T>
where
    F: FnOnce(&mut ResourceHandle) -> T,
{
    Opener::new(options.clone()).open_with(uri, f).await
}

/// Blocking variant of [`open`]; see [`Opener::open_blocking`]
pub fn open_blocking(uri: &str, options: &OpenOptions) -> Result<ResourceHandle> {
    Opener::new(options.clone()).open_blocking(uri)
}
