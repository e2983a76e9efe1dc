//! Connections to origin servers and proxies
//!
//! A [`Connection`] is a buffered byte stream over plain TCP or TLS with a
//! per-read time budget. [`connect`] produces one for an HTTP exchange,
//! tunnelling through the proxy with CONNECT when the target is https.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::decode::read_body;
use crate::error::{HttpError, OpenError, ResponseOrigin, Result, TimeoutPhase};
use crate::handle::ResourceHandle;
use crate::http::response;
use crate::progress::ProgressReporter;
use crate::proxy::ProxyConfig;
use crate::target::{Scheme, Target};

/// Longest accepted status, header or FTP reply line
pub const MAX_LINE: usize = 16 * 1024;

/// Anything a connection can run over
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Run `fut` under an optional time budget
pub(crate) async fn within<T, F>(budget: Option<Duration>, phase: TimeoutPhase, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match budget {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| OpenError::Timeout { phase })?,
        None => fut.await,
    }
}

/// Run a socket operation under an optional time budget
pub(crate) async fn timed<T, F>(budget: Option<Duration>, phase: TimeoutPhase, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    within(budget, phase, async { fut.await.map_err(OpenError::from_network) }).await
}

/// Open a TCP connection to `host:port` within `budget`
pub async fn connect_tcp(host: &str, port: u16, budget: Option<Duration>) -> Result<TcpStream> {
    trace!("Connecting to {host}:{port}");
    let stream = timed(budget, TimeoutPhase::Connect, TcpStream::connect((host, port))).await?;
    stream.set_nodelay(true).map_err(OpenError::from_network)?;
    Ok(stream)
}

/// A buffered, possibly encrypted, byte stream
pub struct Connection {
    stream: BufReader<Box<dyn Io>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_timeout: Option<Duration>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn from_tcp(stream: TcpStream, read_timeout: Option<Duration>) -> Result<Self> {
        let local_addr = stream.local_addr().map_err(OpenError::from_network)?;
        let peer_addr = stream.peer_addr().map_err(OpenError::from_network)?;
        let io: Box<dyn Io> = Box::new(stream);
        Ok(Self {
            stream: BufReader::new(io),
            local_addr,
            peer_addr,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one line, without its CR LF. `None` at end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.stream).take(MAX_LINE as u64);
        let n = timed(
            self.read_timeout,
            TimeoutPhase::Read,
            limited.read_until(b'\n', &mut buf),
        )
        .await?;

        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && n >= MAX_LINE {
            return Err(OpenError::Protocol("line too long".to_string()));
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read some bytes; 0 at end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        timed(self.read_timeout, TimeoutPhase::Read, self.stream.read(buf)).await
    }

    /// Write and flush `data` under the read budget
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let inner = self.stream.get_mut();
        timed(self.read_timeout, TimeoutPhase::Read, async move {
            inner.write_all(data).await?;
            inner.flush().await
        })
        .await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .get_mut()
            .shutdown()
            .await
            .map_err(OpenError::from_network)
    }

    /// Wrap the stream in TLS, verifying the certificate for `host`
    pub async fn start_tls(self, host: &str, config: Arc<rustls::ClientConfig>) -> Result<Self> {
        if !self.stream.buffer().is_empty() {
            return Err(OpenError::Protocol(
                "unexpected data before TLS handshake".to_string(),
            ));
        }

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| OpenError::invalid_uri(host, e.to_string()))?;
        let tls = TlsConnector::from(config)
            .connect(server_name, self.stream.into_inner())
            .await
            .map_err(OpenError::from_network)?;
        trace!("TLS established with {host}");

        let io: Box<dyn Io> = Box::new(tls);
        Ok(Self {
            stream: BufReader::new(io),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            read_timeout: self.read_timeout,
        })
    }
}

/// Settings for one [`connect`] call
pub struct ConnectParams<'a> {
    pub target: &'a Target,
    pub proxy: Option<&'a ProxyConfig>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub open_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

/// Connect for an HTTP exchange with `target`.
///
/// Without a proxy this is a direct connection. Through a proxy, plain
/// requests go to the proxy as-is and https targets get a CONNECT tunnel.
/// Connecting, tunnelling and the handshake share `open_timeout`.
pub async fn connect(params: ConnectParams<'_>) -> Result<Connection> {
    let ConnectParams {
        target,
        proxy,
        tls,
        open_timeout,
        read_timeout,
    } = params;

    within(open_timeout, TimeoutPhase::Connect, async move {
        let (host, port) = match proxy {
            Some(p) => (p.host(), p.port()),
            None => (target.host().to_string(), target.port()),
        };
        let tcp = connect_tcp(&host, port, None).await?;
        let mut conn = Connection::from_tcp(tcp, read_timeout)?;

        if target.scheme() == Scheme::Https {
            if let Some(proxy) = proxy {
                tunnel(&mut conn, target, proxy).await?;
            }
            let config = tls.ok_or_else(|| {
                OpenError::Config("https without TLS configuration".to_string())
            })?;
            conn = conn.start_tls(target.host(), config).await?;
        }
        Ok(conn)
    })
    .await
}

/// Ask the proxy for a byte pipe to the target
async fn tunnel(conn: &mut Connection, target: &Target, proxy: &ProxyConfig) -> Result<()> {
    let authority = target.authority();
    debug!("CONNECT {authority} via {}", proxy.url);

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = proxy.authorization() {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    conn.write_all(request.as_bytes()).await?;

    let head = response::read_head(conn).await?;
    if head.status.is_success() {
        return Ok(());
    }

    let framing = head.framing()?;
    let body = read_body(conn, framing, &mut ProgressReporter::silent()).await?;
    let meta = head.into_meta(Some(target.url().clone()));
    Err(OpenError::Http(Box::new(HttpError {
        io: ResourceHandle::new(meta, body),
        origin: ResponseOrigin::Proxy,
        location: None,
        credentials_offered: proxy.credentials.is_some(),
    })))
}
