//! Response head parsing
//!
//! The head is collected line by line up to the empty line, then handed to
//! `httparse` as one buffer.

use tracing::trace;
use url::Url;

use crate::decode::Framing;
use crate::error::{OpenError, Result};
use crate::meta::{Meta, StatusLine};
use crate::transport::Connection;

const MAX_HEADERS: usize = 256;

/// Upper bound on a whole response head
const MAX_HEAD: usize = 64 * 1024;

/// Status line and header fields of one response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: StatusLine,
    pub fields: Vec<(String, String)>,
}

impl ResponseHead {
    /// All values of a field joined with `", "`
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn code(&self) -> u16 {
        self.status.as_u16().unwrap_or(0)
    }

    pub fn location(&self) -> Option<String> {
        self.header("location")
    }

    /// Work out how the body that follows this head is delimited
    pub fn framing(&self) -> Result<Framing> {
        let code = self.code();
        if (100..200).contains(&code) || code == 204 || code == 304 {
            return Ok(Framing::Empty);
        }

        if let Some(te) = self.header("transfer-encoding") {
            let last = te.rsplit(',').next().unwrap_or_default().trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(Framing::Chunked);
            }
            return Ok(Framing::UntilClose);
        }

        if let Some(cl) = self.header("content-length") {
            let mut lengths = cl.split(',').map(|v| v.trim().parse::<u64>());
            let first = lengths
                .next()
                .and_then(std::result::Result::ok)
                .ok_or_else(|| OpenError::Protocol(format!("invalid Content-Length: {cl}")))?;
            if lengths.any(|v| v.ok() != Some(first)) {
                return Err(OpenError::Protocol(format!(
                    "conflicting Content-Length: {cl}"
                )));
            }
            return Ok(Framing::Length(first));
        }

        Ok(Framing::UntilClose)
    }

    pub fn into_meta(self, base_uri: Option<Url>) -> Meta {
        Meta::from_fields(self.status, base_uri, &self.fields)
    }
}

/// Collect the raw head up to and including the empty line
async fn read_head_bytes(conn: &mut Connection) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    loop {
        let Some(line) = conn.read_line().await? else {
            let what = if raw.is_empty() {
                "connection closed before response"
            } else {
                "connection closed in response headers"
            };
            return Err(OpenError::Protocol(what.to_string()));
        };
        if line.is_empty() && raw.is_empty() {
            // Stray CR LF left over before the status line
            continue;
        }
        raw.extend_from_slice(line.as_bytes());
        raw.extend_from_slice(b"\r\n");
        if line.is_empty() {
            return Ok(raw);
        }
        if raw.len() > MAX_HEAD {
            return Err(OpenError::Protocol("response head too large".to_string()));
        }
    }
}

/// Join obs-fold continuation lines with single spaces
fn unfold(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse one complete response head
fn parse_head(raw: &[u8]) -> Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let status = httparse::ParserConfig::default()
        .allow_obsolete_multiline_headers_in_responses(true)
        .allow_spaces_after_header_name_in_responses(true)
        .parse_response(&mut response, raw)
        .map_err(|e| match e {
            httparse::Error::TooManyHeaders => {
                OpenError::Protocol("too many response headers".to_string())
            }
            e => OpenError::Protocol(format!(
                "malformed response head ({e}): {:?}",
                String::from_utf8_lossy(raw.split(|&b| b == b'\n').next().unwrap_or_default())
                    .trim_end()
            )),
        })?;
    if status.is_partial() {
        return Err(OpenError::Protocol("incomplete response head".to_string()));
    }

    let code = response
        .code
        .ok_or_else(|| OpenError::Protocol("response without status code".to_string()))?;
    let version = format!("HTTP/1.{}", response.version.unwrap_or(1));
    let message = response.reason.unwrap_or_default().trim();
    let fields = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), unfold(h.value)))
        .collect();

    Ok(ResponseHead {
        version,
        status: StatusLine::new(format!("{code:03}"), message),
        fields,
    })
}

/// Read a response head, skipping interim 1xx responses
pub async fn read_head(conn: &mut Connection) -> Result<ResponseHead> {
    loop {
        let raw = read_head_bytes(conn).await?;
        let head = parse_head(&raw)?;
        trace!("< {} {}", head.version, head.status);

        let code = head.code();
        if (100..200).contains(&code) && code != 101 {
            continue;
        }
        return Ok(head);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::connect_tcp;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn serve(bytes: &'static [u8]) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(bytes).await.unwrap();
        });
        let tcp = connect_tcp("127.0.0.1", port, None).await.unwrap();
        Connection::from_tcp(tcp, Some(Duration::from_secs(5))).unwrap()
    }

    fn head(code: &str, fields: &[(&str, &str)]) -> ResponseHead {
        ResponseHead {
            version: "HTTP/1.1".to_string(),
            status: StatusLine::new(code, "X"),
            fields: fields
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_parse_head() {
        let head =
            parse_head(b"HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\n\r\n").unwrap();
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.status, StatusLine::new("404", "Not Found"));
        assert_eq!(head.header("content-type").as_deref(), Some("text/html"));

        let head = parse_head(b"HTTP/1.0 200\r\n\r\n").unwrap();
        assert_eq!(head.version, "HTTP/1.0");
        assert_eq!(head.status.message(), "");

        assert!(parse_head(b"ICY 200 OK\r\n\r\n").is_err());
        assert!(parse_head(b"HTTP/1.1 2000 OK\r\n\r\n").is_err());
        assert!(parse_head(b"HTTP/1.1 200 OK\r\nno colon here\r\n\r\n").is_err());
    }

    #[test]
    fn test_too_many_headers() {
        let mut raw = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let err = parse_head(&raw).unwrap_err();
        assert!(matches!(err, OpenError::Protocol(ref m) if m.contains("too many")));
    }

    #[test]
    fn test_framing() {
        assert_eq!(head("204", &[("Content-Length", "5")]).framing().unwrap(), Framing::Empty);
        assert_eq!(
            head("200", &[("Transfer-Encoding", "gzip, chunked"), ("Content-Length", "5")])
                .framing()
                .unwrap(),
            Framing::Chunked
        );
        assert_eq!(head("200", &[("Content-Length", "5, 5")]).framing().unwrap(), Framing::Length(5));
        assert!(head("200", &[("Content-Length", "5, 6")]).framing().is_err());
        assert!(head("200", &[("Content-Length", "five")]).framing().is_err());
        assert_eq!(head("200", &[]).framing().unwrap(), Framing::UntilClose);
    }

    #[test]
    fn test_repeated_header_joined() {
        let h = head("200", &[("Via", "a"), ("via", "b")]);
        assert_eq!(h.header("VIA").as_deref(), Some("a, b"));
    }

    #[tokio::test]
    async fn test_read_head_skips_interim_and_unfolds() {
        let mut conn = serve(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nX-Long: one\r\n  two\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let head = read_head(&mut conn).await.unwrap();
        assert_eq!(head.code(), 200);
        assert_eq!(head.header("x-long").as_deref(), Some("one two"));
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut conn = serve(b"HTTP/1.1 200 OK\r\nX: y\r\n").await;
        assert!(matches!(
            read_head(&mut conn).await.unwrap_err(),
            OpenError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_read_head_oversized() {
        let pad = "X-Pad: 0123456789abcdef\r\n".repeat(4096);
        let raw = format!("HTTP/1.1 200 OK\r\n{pad}").into_bytes();
        let mut conn = serve(Box::leak(raw.into_boxed_slice())).await;
        let err = read_head(&mut conn).await.unwrap_err();
        assert!(matches!(err, OpenError::Protocol(ref m) if m.contains("too large")));
    }
}
