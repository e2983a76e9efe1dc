//! The opened resource

use chrono::{DateTime, Utc};
use std::io::{self, BufRead, Cursor, Read, Seek, SeekFrom};
use url::Url;

use crate::meta::{Meta, StatusLine};

/// A fully received resource: decoded body bytes plus response metadata.
///
/// Reads start at the beginning of the body. The connection that produced
/// it is already closed.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    meta: Meta,
    body: Cursor<Vec<u8>>,
}

impl ResourceHandle {
    pub fn new(meta: Meta, body: Vec<u8>) -> Self {
        Self {
            meta,
            body: Cursor::new(body),
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn status(&self) -> &StatusLine {
        self.meta.status()
    }

    pub fn base_uri(&self) -> Option<&Url> {
        self.meta.base_uri()
    }

    pub fn content_type(&self) -> &str {
        self.meta.content_type()
    }

    pub fn charset(&self) -> String {
        self.meta.charset()
    }

    pub fn content_encoding(&self) -> Vec<String> {
        self.meta.content_encoding()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.meta.last_modified()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta.header(name)
    }

    /// The whole body, independent of the read position
    pub fn bytes(&self) -> &[u8] {
        self.body.get_ref()
    }

    pub fn len(&self) -> usize {
        self.body.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.get_ref().is_empty()
    }

    /// Remaining body as a string, replacing invalid UTF-8
    pub fn read_to_string_lossy(&mut self) -> String {
        let pos = self.position();
        let rest = &self.body.get_ref()[pos..];
        let out = String::from_utf8_lossy(rest).into_owned();
        self.body.set_position(self.body.get_ref().len() as u64);
        out
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.body.into_inner()
    }

    pub fn into_parts(self) -> (Meta, Vec<u8>) {
        (self.meta, self.body.into_inner())
    }

    fn position(&self) -> usize {
        usize::try_from(self.body.position())
            .unwrap_or(usize::MAX)
            .min(self.body.get_ref().len())
    }
}

impl Read for ResourceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

impl BufRead for ResourceHandle {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.body.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.body.consume(amt);
    }
}

impl Seek for ResourceHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.body.seek(pos)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn handle(body: &[u8]) -> ResourceHandle {
        let mut meta = Meta::new(StatusLine::default(), None);
        meta.add_field("Content-Type", "text/plain; charset=UTF-8");
        ResourceHandle::new(meta, body.to_vec())
    }

    #[test]
    fn test_read_lines_and_rewind() {
        let mut h = handle(b"one\ntwo\n");
        let mut line = String::new();
        h.read_line(&mut line).unwrap();
        assert_eq!(line, "one\n");
        assert_eq!(h.read_to_string_lossy(), "two\n");

        h.rewind().unwrap();
        let mut all = Vec::new();
        h.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"one\ntwo\n");
        assert_eq!(ResourceHandle::bytes(&h), b"one\ntwo\n");
    }

    #[test]
    fn test_metadata_accessors() {
        let h = handle(b"");
        assert!(h.is_empty());
        assert_eq!(h.status().code(), "200");
        assert_eq!(h.content_type(), "text/plain");
        assert_eq!(h.charset(), "utf-8");
        assert!(h.content_encoding().is_empty());
    }
}
