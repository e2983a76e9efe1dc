//! Body framing and content decoding
//!
//! Transfer framing (`chunked`, `Content-Length`, read-to-close) is removed
//! while reading from the socket; progress is reported on those de-framed
//! bytes. Content codings (`gzip`, `deflate`) are undone afterwards on the
//! complete body.

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use std::io::Read;
use tracing::{debug, trace};

use crate::error::{OpenError, Result};
use crate::progress::ProgressReporter;
use crate::transport::Connection;

const READ_CHUNK: usize = 16 * 1024;

/// Largest single chunk accepted in a chunked body
pub const MAX_CHUNK: u64 = 1 << 30;

/// How the end of a message body is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all (204, 304, 1xx)
    Empty,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Everything until the peer closes the connection
    UntilClose,
}

impl Framing {
    /// Size announced to the content-length callback
    pub fn expected_len(self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Length(n) => Some(n),
            Self::Chunked | Self::UntilClose => None,
        }
    }
}

/// Read a complete body from `conn`, reporting progress as bytes arrive
pub async fn read_body(
    conn: &mut Connection,
    framing: Framing,
    reporter: &mut ProgressReporter<'_>,
) -> Result<Vec<u8>> {
    reporter.start(framing.expected_len());

    let body = match framing {
        Framing::Empty => Vec::new(),
        Framing::Length(len) => read_length(conn, len, reporter).await?,
        Framing::Chunked => read_chunked(conn, reporter).await?,
        Framing::UntilClose => read_to_close(conn, reporter).await?,
    };
    trace!("Body complete: {} bytes", body.len());
    Ok(body)
}

async fn read_length(
    conn: &mut Connection,
    len: u64,
    reporter: &mut ProgressReporter<'_>,
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(usize::try_from(len.min(1 << 20)).unwrap_or(0));
    let mut buf = vec![0u8; READ_CHUNK];
    let mut remaining = len;

    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = conn.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(OpenError::Protocol(format!(
                "connection closed after {} of {len} body bytes",
                len - remaining
            )));
        }
        body.extend_from_slice(&buf[..n]);
        remaining -= n as u64;
        reporter.advance(n);
    }
    Ok(body)
}

async fn read_to_close(
    conn: &mut Connection,
    reporter: &mut ProgressReporter<'_>,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&buf[..n]);
        reporter.advance(n);
    }
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let digits = line.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(OpenError::Protocol(format!("invalid chunk size line: {line:?}")));
    }
    let size = u64::from_str_radix(digits, 16).unwrap_or(u64::MAX);
    if size > MAX_CHUNK {
        return Err(OpenError::Protocol(format!(
            "chunk of {size} bytes exceeds the {MAX_CHUNK} byte limit"
        )));
    }
    Ok(size)
}

async fn read_chunked(
    conn: &mut Connection,
    reporter: &mut ProgressReporter<'_>,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let line = conn
            .read_line()
            .await?
            .ok_or_else(|| OpenError::Protocol("connection closed in chunked body".to_string()))?;
        let size = parse_chunk_size(&line)?;
        trace!("Chunk of {size} bytes");

        if size == 0 {
            // Trailer fields are read and dropped.
            while let Some(trailer) = conn.read_line().await? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        let mut remaining = size;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
            let n = conn.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(OpenError::Protocol(
                    "connection closed inside a chunk".to_string(),
                ));
            }
            body.extend_from_slice(&buf[..n]);
            remaining -= n as u64;
            reporter.advance(n);
        }

        match conn.read_line().await? {
            Some(end) if end.is_empty() => {}
            _ => {
                return Err(OpenError::Protocol(
                    "missing CRLF after chunk data".to_string(),
                ));
            }
        }
    }
}

fn is_known_coding(token: &str) -> bool {
    matches!(token, "gzip" | "x-gzip" | "deflate" | "identity")
}

/// Undo the listed content codings, last applied first.
///
/// When any coding is not understood the body is returned untouched so the
/// caller can still decode it with the reported token list.
pub fn decode_content(codings: &[String], body: Vec<u8>) -> Result<Vec<u8>> {
    Ok(undo_codings(codings, &body)?.unwrap_or(body))
}

/// [`decode_content`] for error and redirect bodies: a body that does not
/// decode is kept as received
pub fn decode_content_or_raw(codings: &[String], body: Vec<u8>) -> Vec<u8> {
    match undo_codings(codings, &body) {
        Ok(decoded) => decoded.unwrap_or(body),
        Err(e) => {
            debug!("Keeping error body encoded: {e}");
            body
        }
    }
}

/// `None` when the body is left as it is
fn undo_codings(codings: &[String], body: &[u8]) -> Result<Option<Vec<u8>>> {
    if body.is_empty() || codings.iter().all(|c| c == "identity") {
        return Ok(None);
    }
    if let Some(unknown) = codings.iter().find(|c| !is_known_coding(c)) {
        debug!("Leaving body encoded: unsupported content coding {unknown}");
        return Ok(None);
    }

    let mut data: Option<Vec<u8>> = None;
    for coding in codings.iter().rev() {
        let input = data.as_deref().unwrap_or(body);
        data = match coding.as_str() {
            "gzip" | "x-gzip" => Some(gunzip(input)?),
            "deflate" => Some(inflate(input)?),
            _ => continue,
        };
    }
    Ok(data)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiGzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| OpenError::Protocol(format!("invalid gzip body: {e}")))?;
    Ok(out)
}

/// `deflate` is meant to be zlib-wrapped, but raw deflate streams are
/// common enough to accept as well
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| OpenError::Protocol(format!("invalid deflate body: {e}")))?;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::connect_tcp;
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
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

    #[tokio::test]
    async fn test_chunked_body_with_extensions_and_trailers() {
        let mut conn = serve(b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\n").await;
        let body = read_body(&mut conn, Framing::Chunked, &mut ProgressReporter::silent())
            .await
            .unwrap();
        assert_eq!(body, b"Wikipedia");
    }

    #[tokio::test]
    async fn test_chunked_progress_reports_unknown_total() {
        let mut conn = serve(b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n").await;

        let totals = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&totals);
        let length: crate::progress::ContentLengthProc = Arc::new(move |v| t.lock().unwrap().push(v));
        let mut reporter = ProgressReporter::new(Some(&length), None);

        read_body(&mut conn, Framing::Chunked, &mut reporter).await.unwrap();
        assert_eq!(*totals.lock().unwrap(), vec![None]);
        assert_eq!(reporter.received(), 5);
    }

    #[tokio::test]
    async fn test_truncated_length_body() {
        let mut conn = serve(b"abc").await;
        let err = read_body(&mut conn, Framing::Length(10), &mut ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_bad_chunk_size() {
        let mut conn = serve(b"zz\r\n").await;
        let err = read_body(&mut conn, Framing::Chunked, &mut ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let mut conn = serve(b"ffffffffffff\r\nabc").await;
        let err = read_body(&mut conn, Framing::Chunked, &mut ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Protocol(ref m) if m.contains("exceeds")));
    }

    #[test]
    fn test_chunk_size_syntax() {
        assert_eq!(parse_chunk_size("1A ; name=value").unwrap(), 26);
        assert_eq!(parse_chunk_size("0").unwrap(), 0);
        assert!(parse_chunk_size("+5").is_err());
        assert!(parse_chunk_size("").is_err());
        assert!(parse_chunk_size("40000001").is_err());
        assert!(parse_chunk_size("fffffffffffffffffffff").is_err());
    }

    #[tokio::test]
    async fn test_until_close() {
        let mut conn = serve(b"all of it").await;
        let body = read_body(&mut conn, Framing::UntilClose, &mut ProgressReporter::silent())
            .await
            .unwrap();
        assert_eq!(body, b"all of it");
    }

    #[test]
    fn test_decode_gzip_and_deflate() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"hello gzip").unwrap();
        let gz = gz.finish().unwrap();
        assert_eq!(decode_content(&["gzip".to_string()], gz.clone()).unwrap(), b"hello gzip");
        assert_eq!(decode_content(&["x-gzip".to_string()], gz).unwrap(), b"hello gzip");

        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        z.write_all(b"hello zlib").unwrap();
        let z = z.finish().unwrap();
        assert_eq!(decode_content(&["deflate".to_string()], z).unwrap(), b"hello zlib");
    }

    #[test]
    fn test_unknown_coding_passes_through() {
        let body = b"\x00\x01opaque".to_vec();
        let codings = vec!["gzip".to_string(), "br".to_string()];
        assert_eq!(decode_content(&codings, body.clone()).unwrap(), body);
    }

    #[test]
    fn test_corrupt_gzip_is_protocol_error() {
        let err = decode_content(&["gzip".to_string()], b"not gzip".to_vec()).unwrap_err();
        assert!(matches!(err, OpenError::Protocol(_)));
    }

    #[test]
    fn test_undecodable_error_body_kept() {
        let gzip = vec!["gzip".to_string()];
        assert_eq!(decode_content_or_raw(&gzip, b"not found".to_vec()), b"not found");

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"gone").unwrap();
        assert_eq!(decode_content_or_raw(&gzip, gz.finish().unwrap()), b"gone");
    }
}
