//! Download progress reporting
//!
//! The content-length callback fires once, before the first body byte, with
//! the expected size or `None` when it cannot be known (chunked responses,
//! FTP servers refusing SIZE). The progress callback then receives the
//! cumulative byte count after every read.

use std::sync::Arc;

/// Called once with the expected total size, `None` if unknown
pub type ContentLengthProc = Arc<dyn Fn(Option<u64>) + Send + Sync>;

/// Called with the cumulative number of bytes received so far
pub type ProgressProc = Arc<dyn Fn(u64) + Send + Sync>;

/// Drives the caller's callbacks for one transfer
pub struct ProgressReporter<'a> {
    content_length: Option<&'a ContentLengthProc>,
    progress: Option<&'a ProgressProc>,
    received: u64,
    started: bool,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(
        content_length: Option<&'a ContentLengthProc>,
        progress: Option<&'a ProgressProc>,
    ) -> Self {
        Self {
            content_length,
            progress,
            received: 0,
            started: false,
        }
    }

    /// A reporter with no callbacks attached
    pub fn silent() -> Self {
        Self::new(None, None)
    }

    /// Announce the expected size. Only the first call has an effect.
    pub fn start(&mut self, total: Option<u64>) {
        if self.started {
            return;
        }
        self.started = true;
        if let Some(cb) = self.content_length {
            cb(total);
        }
    }

    /// Account for `n` more bytes received
    pub fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.received += n as u64;
        if let Some(cb) = self.progress {
            cb(self.received);
        }
    }

    /// Bytes received so far
    pub fn received(&self) -> u64 {
        self.received
    }
}
