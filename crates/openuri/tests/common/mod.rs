//! Shared fixtures for integration tests: raw HTTP servers, a proxy, a TLS
//! server and a scripted FTP server, all bound to 127.0.0.1.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use openuri::{OpenOptions, Opener, ProxyEnv};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Install a test subscriber; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Opener that ignores the process environment's proxy settings.
pub fn opener(options: OpenOptions) -> Opener {
    init_tracing();
    Opener::new(options).with_proxy_env(ProxyEnv::empty())
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Shared, ordered log of lines seen by a fixture server.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().unwrap().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

/// Accept connections forever, running `handler` on each.
pub async fn spawn_raw<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler(stream).await });
        }
    });
    addr
}

/// Listener that only counts the connections made to it.
pub async fn spawn_counting_listener() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            c.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (addr, count)
}

/// Read a request head; returns its lines without CR LF.
pub async fn read_request_head<R>(reader: &mut R) -> Vec<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return lines;
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            return lines;
        }
        lines.push(line);
    }
}

/// Serve one canned response per connection after reading the request.
pub async fn spawn_canned(response: &'static [u8]) -> SocketAddr {
    spawn_raw(move |stream| async move {
        let mut reader = BufReader::new(stream);
        read_request_head(&mut reader).await;
        let mut stream = reader.into_inner();
        let _ = stream.write_all(response).await;
        let _ = stream.shutdown().await;
    })
    .await
}

/// How the test proxy answers
#[derive(Clone, Default)]
pub struct ProxyBehavior {
    /// Expected `Proxy-Authorization` value; 407 when it differs
    pub required_auth: Option<String>,
    /// Status for non-CONNECT requests, as if relayed from upstream
    pub upstream_status: Option<u16>,
}

/// A small forward proxy.
///
/// CONNECT requests are tunnelled to their target. Any other request is
/// answered by the proxy itself with `proxied <request-target>` as body.
/// Every request line and `Proxy-Authorization` header is logged.
pub async fn spawn_proxy(behavior: ProxyBehavior) -> (SocketAddr, Log) {
    let log = Log::default();
    let l = log.clone();
    let addr = spawn_raw(move |stream| {
        let log = l.clone();
        let behavior = behavior.clone();
        async move {
            let mut reader = BufReader::new(stream);
            let head = read_request_head(&mut reader).await;
            let Some(request_line) = head.first().cloned() else {
                return;
            };
            log.push(request_line.clone());
            let auth = head
                .iter()
                .find_map(|h| h.strip_prefix("Proxy-Authorization: "))
                .map(str::to_string);
            if let Some(a) = &auth {
                log.push(format!("Proxy-Authorization: {a}"));
            }

            let mut stream = reader.into_inner();
            if let Some(required) = &behavior.required_auth {
                if auth.as_deref() != Some(required.as_str()) {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                              Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
                              Content-Length: 0\r\nConnection: close\r\n\r\n",
                        )
                        .await;
                    return;
                }
            }

            let mut parts = request_line.split(' ');
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();

            if method == "CONNECT" {
                let Ok(mut upstream) = TcpStream::connect(target.as_str()).await else {
                    let _ = stream
                        .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                };
                let _ = stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
                return;
            }

            let (status, body) = match behavior.upstream_status {
                Some(code) => (format!("{code} Upstream Failed"), format!("upstream refused {target}")),
                None => ("200 OK".to_string(), format!("proxied {target}")),
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    })
    .await;
    (addr, log)
}

fn tls_acceptor() -> tokio_rustls::TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(fixture("server_cert.pem")).unwrap(),
    ))
    .collect::<Result<Vec<_>, _>>()
    .unwrap();
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(fixture("server_key.pem")).unwrap(),
    ))
    .unwrap()
    .unwrap();

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

/// HTTPS server presenting the fixture certificate for 127.0.0.1 and
/// localhost, signed by `ca_cert.pem`.
pub async fn spawn_tls_server(body: &'static str) -> SocketAddr {
    let acceptor = tls_acceptor();
    spawn_raw(move |stream| {
        let acceptor = acceptor.clone();
        async move {
            let Ok(tls) = acceptor.accept(stream).await else {
                return;
            };
            let mut reader = BufReader::new(tls);
            read_request_head(&mut reader).await;
            let mut tls = reader.into_inner();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let _ = tls.write_all(response.as_bytes()).await;
            let _ = tls.shutdown().await;
        }
    })
    .await
}

/// Behaviour switches for [`spawn_ftp`]
#[derive(Clone, Default)]
pub struct FtpBehavior {
    /// Answer SIZE with 550
    pub refuse_size: bool,
    /// Advertise this address in PASV replies instead of 127.0.0.1
    pub pasv_host: Option<[u8; 4]>,
}

/// A scripted FTP server.
///
/// `files` maps `dir/sub/name` paths to contents. Every command received is
/// logged verbatim.
pub async fn spawn_ftp(files: HashMap<String, Vec<u8>>, behavior: FtpBehavior) -> (SocketAddr, Log) {
    let log = Log::default();
    let l = log.clone();
    let files = Arc::new(files);
    let addr = spawn_raw(move |stream| {
        let session = FtpSession {
            log: l.clone(),
            files: Arc::clone(&files),
            behavior: behavior.clone(),
        };
        async move { session.run(stream).await }
    })
    .await;
    (addr, log)
}

struct FtpSession {
    log: Log,
    files: Arc<HashMap<String, Vec<u8>>>,
    behavior: FtpBehavior,
}

enum DataChannel {
    None,
    Passive(TcpListener),
    Active(SocketAddr),
}

impl FtpSession {
    async fn run(self, stream: TcpStream) {
        let (read_half, mut write) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut cwd: Vec<String> = Vec::new();
        let mut data = DataChannel::None;

        let _ = write.write_all(b"220 test FTP server ready\r\n").await;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            self.log.push(line.clone());

            let (cmd, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let reply: String = match cmd {
                "USER" => "331 Password required".to_string(),
                "PASS" => "230 Logged in".to_string(),
                "TYPE" => format!("200 Type set to {arg}"),
                "CWD" if arg == "missing" => "550 No such directory".to_string(),
                "CWD" => {
                    cwd.push(arg.to_string());
                    "250 Directory changed".to_string()
                }
                "SIZE" if self.behavior.refuse_size => "550 SIZE not allowed".to_string(),
                "SIZE" => match self.files.get(&path_of(&cwd, arg)) {
                    Some(content) => format!("213 {}", content.len()),
                    None => "550 No such file".to_string(),
                },
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    let [a, b, c, d] = self.behavior.pasv_host.unwrap_or([127, 0, 0, 1]);
                    data = DataChannel::Passive(listener);
                    format!(
                        "227 Entering Passive Mode ({a},{b},{c},{d},{},{})",
                        port >> 8,
                        port & 0xff
                    )
                }
                "EPSV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    data = DataChannel::Passive(listener);
                    format!("229 Entering Extended Passive Mode (|||{port}|)")
                }
                "PORT" => {
                    let n: Vec<u16> = arg.split(',').map(|s| s.parse().unwrap()).collect();
                    let addr: SocketAddr =
                        format!("{}.{}.{}.{}:{}", n[0], n[1], n[2], n[3], (n[4] << 8) | n[5])
                            .parse()
                            .unwrap();
                    data = DataChannel::Active(addr);
                    "200 PORT command successful".to_string()
                }
                "RETR" => {
                    let Some(content) = self.files.get(&path_of(&cwd, arg)).cloned() else {
                        let _ = write.write_all(b"550 No such file\r\n").await;
                        continue;
                    };
                    let channel = std::mem::replace(&mut data, DataChannel::None);
                    let _ = write
                        .write_all(b"150 Opening BINARY mode data connection\r\n")
                        .await;
                    let mut conn = match channel {
                        DataChannel::Passive(listener) => listener.accept().await.unwrap().0,
                        DataChannel::Active(addr) => TcpStream::connect(addr).await.unwrap(),
                        DataChannel::None => {
                            let _ = write.write_all(b"425 Use PORT or PASV first\r\n").await;
                            continue;
                        }
                    };
                    let _ = conn.write_all(&content).await;
                    let _ = conn.shutdown().await;
                    drop(conn);
                    "226 Transfer complete".to_string()
                }
                "QUIT" => {
                    let _ = write.write_all(b"221 Goodbye\r\n").await;
                    return;
                }
                _ => "502 Command not implemented".to_string(),
            };
            let _ = write.write_all(format!("{reply}\r\n").as_bytes()).await;
        }
    }
}

fn path_of(cwd: &[String], name: &str) -> String {
    let mut parts = cwd.to_vec();
    parts.push(name.to_string());
    parts.join("/")
}

/// Read everything a client sends until it closes; used by slow servers.
pub async fn drain(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
}
