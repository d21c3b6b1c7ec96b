//! Progress reporting for conversions.
//!
//! A [`ProgressReporter`] is built from the total number of bytes to copy
//! and an optional [`ProgressCallback`]. It brackets the copy with
//! [`start`](ProgressReporter::start) / [`finish`](ProgressReporter::finish)
//! and wraps the source reader so every read reports cumulative progress.

use std::io::{self, Read};

/// Phase of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertPhase {
    /// Opening the source and checking preconditions.
    Inspecting,
    /// Copying image data.
    Copying,
    /// Growing the destination to the requested size.
    Resizing,
    /// Conversion complete.
    Complete,
}

impl std::fmt::Display for ConvertPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertPhase::Inspecting => write!(f, "Inspecting"),
            ConvertPhase::Copying => write!(f, "Copying"),
            ConvertPhase::Resizing => write!(f, "Resizing"),
            ConvertPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Progress information for a conversion.
#[derive(Debug, Clone)]
pub struct ConvertProgress {
    /// Current phase.
    pub phase: ConvertPhase,
    /// Bytes read from the source so far.
    pub bytes_processed: u64,
    /// Total bytes to read.
    pub bytes_total: u64,
}

impl ConvertProgress {
    /// Create new progress information.
    pub fn new(phase: ConvertPhase, bytes_total: u64) -> Self {
        Self {
            phase,
            bytes_processed: 0,
            bytes_total,
        }
    }

    /// Calculate overall percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return match self.phase {
                ConvertPhase::Complete => 100.0,
                _ => 0.0,
            };
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ConvertProgress) + Send>;

/// Reports byte-level progress of a single copy.
pub struct ProgressReporter<'a> {
    total: u64,
    callback: Option<&'a ProgressCallback>,
}

impl<'a> ProgressReporter<'a> {
    /// Create a reporter for a copy of `total` bytes.
    pub fn new(total: u64, callback: Option<&'a ProgressCallback>) -> Self {
        Self { total, callback }
    }

    /// Announce the start of the copy.
    pub fn start(&self) {
        self.report(ConvertProgress::new(ConvertPhase::Copying, self.total));
    }

    /// Wrap `reader` so that every read reports cumulative progress.
    pub fn wrap_read<R: Read>(&self, reader: R) -> ProgressReader<'a, R> {
        ProgressReader {
            inner: reader,
            total: self.total,
            processed: 0,
            callback: self.callback,
        }
    }

    /// Announce that the copy has ended.
    pub fn finish(&self) {
        let mut progress = ConvertProgress::new(ConvertPhase::Copying, self.total);
        progress.bytes_processed = self.total;
        self.report(progress);
    }

    fn report(&self, progress: ConvertProgress) {
        if let Some(callback) = self.callback {
            callback(progress);
        }
    }
}

/// Reader proxy created by [`ProgressReporter::wrap_read`].
pub struct ProgressReader<'a, R> {
    inner: R,
    total: u64,
    processed: u64,
    callback: Option<&'a ProgressCallback>,
}

impl<R> ProgressReader<'_, R> {
    /// Bytes read through this proxy so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.processed += n as u64;
            if let Some(callback) = self.callback {
                callback(ConvertProgress {
                    phase: ConvertPhase::Copying,
                    bytes_processed: self.processed,
                    bytes_total: self.total,
                });
            }
        }
        Ok(n)
    }
}
