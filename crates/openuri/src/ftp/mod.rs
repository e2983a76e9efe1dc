//! FTP client
//!
//! One control session per call:
//!
//! ```text
//! USER, PASS, TYPE I, CWD <dir>..., [TYPE A], [SIZE <file>],
//! PASV|EPSV|PORT|EPRT, RETR <file>, <data>, 226, QUIT
//! ```
//!
//! Every step must be acknowledged with a 2xx or 3xx reply; anything else
//! ends the call with [`OpenError::Ftp`]. The greeting and the end of the
//! transfer must be 2xx. `QUIT` is sent on every exit path except a timeout,
//! which closes the control connection straight away.

pub mod reply;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::config::OpenOptions;
use crate::decode::{Framing, read_body};
use crate::error::{OpenError, Result, TimeoutPhase};
use crate::handle::ResourceHandle;
use crate::meta::{Meta, StatusLine};
use crate::progress::ProgressReporter;
use crate::target::{FtpPath, FtpType, Target};
use crate::transport::{Connection, connect_tcp, timed, within};

use reply::{Reply, parse_epsv, parse_pasv, port_command, read_reply};

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Longest wait for the reply to `QUIT`
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// Login credentials for `target`, anonymous unless the URI carries userinfo
pub fn login_credentials(target: &Target) -> Result<(String, String)> {
    let (user, password) = match target.userinfo() {
        Some((user, password)) => (user, password.unwrap_or_default()),
        None => (ANONYMOUS_USER.to_string(), ANONYMOUS_PASSWORD.to_string()),
    };
    if user.contains(['\r', '\n']) || password.contains(['\r', '\n']) {
        return Err(OpenError::invalid_uri(
            target.url().as_str(),
            "invalid userinfo",
        ));
    }
    Ok((user, password))
}

/// An open control connection
struct Session<'a> {
    control: Connection,
    options: &'a OpenOptions,
}

impl Session<'_> {
    async fn send(&mut self, command: &str) -> Result<Reply> {
        if let Some(rest) = command.strip_prefix("PASS ") {
            debug!("ftp > PASS {}", "*".repeat(rest.len().min(8)));
        } else {
            debug!("ftp > {command}");
        }
        self.control
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        read_reply(&mut self.control).await
    }

    /// Send `command` and require a 2xx or 3xx reply
    async fn command(&mut self, command: &str) -> Result<Reply> {
        let reply = self.send(command).await?;
        check(command, reply)
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let reply = self.send(&format!("USER {user}")).await?;
        if reply.code == 331 || reply.code == 332 {
            let reply = self.send(&format!("PASS {password}")).await?;
            check("PASS", reply)?;
        } else {
            check(&format!("USER {user}"), reply)?;
        }
        Ok(())
    }

    /// Expected size of `filename`. Servers that refuse SIZE yield `None`.
    async fn size(&mut self, filename: &str) -> Result<Option<u64>> {
        let command = format!("SIZE {filename}");
        let reply = self.send(&command).await?;
        match reply.class() {
            2 => Ok(reply.message().parse().ok()),
            5 => {
                warn!("SIZE refused: {reply}");
                Ok(None)
            }
            _ => Err(ftp_error(&command, &reply)),
        }
    }

    /// Open a passive data connection
    async fn passive(&mut self) -> Result<Connection> {
        let peer = self.control.peer_addr();
        let port = if peer.is_ipv6() {
            let reply = self.command("EPSV").await?;
            parse_epsv(&reply.text)
                .ok_or_else(|| OpenError::Protocol(format!("unparsable EPSV reply: {reply}")))?
        } else {
            let reply = self.command("PASV").await?;
            let advertised = parse_pasv(&reply.text)
                .ok_or_else(|| OpenError::Protocol(format!("unparsable PASV reply: {reply}")))?;
            if advertised.ip() != peer.ip() {
                debug!(
                    "Ignoring PASV address {}, using control peer {}",
                    advertised.ip(),
                    peer.ip()
                );
            }
            advertised.port()
        };

        // Data always goes to the control peer; a server-chosen host could
        // point the connection anywhere.
        let tcp = connect_tcp(&peer.ip().to_string(), port, self.options.open_timeout).await?;
        Connection::from_tcp(tcp, self.options.read_timeout)
    }

    /// Listen for the server's active-mode connection and announce it
    async fn active_listener(&mut self) -> Result<TcpListener> {
        let local: IpAddr = self.control.local_addr().ip();
        let listener = TcpListener::bind(SocketAddr::new(local, 0))
            .await
            .map_err(OpenError::from_network)?;
        let addr = listener.local_addr().map_err(OpenError::from_network)?;
        self.command(&port_command(addr)).await?;
        Ok(listener)
    }

    async fn retrieve(&mut self, target: &Target, path: &FtpPath) -> Result<ResourceHandle> {
        self.command("TYPE I").await?;
        for dir in &path.directories {
            self.command(&format!("CWD {dir}")).await?;
        }
        if target.typecode() == Some(FtpType::Ascii) {
            self.command("TYPE A").await?;
        }

        let total = if self.options.content_length_proc.is_some() {
            self.size(&path.filename).await?
        } else {
            None
        };
        let mut reporter = ProgressReporter::new(
            self.options.content_length_proc.as_ref(),
            self.options.progress_proc.as_ref(),
        );
        reporter.start(total);

        let retr = format!("RETR {}", path.filename);
        let mut data = if self.options.ftp_active_mode {
            let listener = self.active_listener().await?;
            self.expect_preliminary(&retr).await?;
            let (stream, from) = timed(
                self.options.open_timeout,
                TimeoutPhase::Connect,
                listener.accept(),
            )
            .await?;
            debug!("Data connection from {from}");
            Connection::from_tcp(stream, self.options.read_timeout)?
        } else {
            let data = self.passive().await?;
            self.expect_preliminary(&retr).await?;
            data
        };

        let body = read_body(&mut data, Framing::UntilClose, &mut reporter).await?;
        drop(data);

        let done = read_reply(&mut self.control).await?;
        if !done.is_complete() {
            return Err(ftp_error(&retr, &done));
        }
        debug!("Transfer finished: {done}, {} bytes", body.len());

        let meta = Meta::new(
            StatusLine::new(done.code.to_string(), done.message()),
            Some(target.url().clone()),
        );
        Ok(ResourceHandle::new(meta, body))
    }

    async fn expect_preliminary(&mut self, command: &str) -> Result<Reply> {
        let reply = self.send(command).await?;
        if reply.is_preliminary() {
            Ok(reply)
        } else {
            Err(ftp_error(command, &reply))
        }
    }

    async fn quit(&mut self) {
        let grace = self
            .options
            .read_timeout
            .map_or(QUIT_GRACE, |t| t.min(QUIT_GRACE));
        if let Err(e) = within(Some(grace), TimeoutPhase::Read, self.send("QUIT")).await {
            debug!("QUIT failed: {e}");
        }
        self.close().await;
    }

    async fn close(&mut self) {
        if let Err(e) = self.control.shutdown().await {
            debug!("Closing control connection failed: {e}");
        }
    }
}

fn ftp_error(command: &str, reply: &Reply) -> OpenError {
    let command = if command.starts_with("PASS") {
        "PASS".to_string()
    } else {
        command.to_string()
    };
    OpenError::Ftp {
        command,
        reply: reply.to_string(),
    }
}

fn check(command: &str, reply: Reply) -> Result<Reply> {
    if reply.is_positive() {
        Ok(reply)
    } else {
        Err(ftp_error(command, &reply))
    }
}

/// Retrieve `target` directly from its FTP server
pub async fn fetch(target: &Target, options: &OpenOptions) -> Result<ResourceHandle> {
    let path = target.ftp_path()?;
    let (user, password) = login_credentials(target)?;

    let tcp = connect_tcp(target.host(), target.port(), options.open_timeout).await?;
    let mut control = Connection::from_tcp(tcp, options.read_timeout)?;

    let mut greeting = read_reply(&mut control).await?;
    while greeting.is_preliminary() {
        greeting = read_reply(&mut control).await?;
    }
    if !greeting.is_complete() {
        return Err(ftp_error("connect", &greeting));
    }
    debug!("Connected to {}: {greeting}", target.authority());

    let mut session = Session { control, options };
    let result = async {
        session.login(&user, &password).await?;
        session.retrieve(target, &path).await
    }
    .await;
    if matches!(result, Err(OpenError::Timeout { .. })) {
        session.close().await;
    } else {
        session.quit().await;
    }
    result
}
