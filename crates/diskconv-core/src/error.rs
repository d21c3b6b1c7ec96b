//! Error types for the diskconv core library.

use std::path::PathBuf;

/// The main error type for diskconv operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The requested size is smaller than the source image.
    #[error("specified size {requested} is smaller than the original image size ({actual}) of '{}'", path.display())]
    SizeTooSmall {
        requested: u64,
        actual: u64,
        path: PathBuf,
    },

    /// The decoder cannot read the image.
    #[error("image '{}' is not readable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// A qcow2 image references a backing file and the caller did not opt in.
    #[error("qcow2 image '{}' has an unexpected backing file: '{backing_file}'", path.display())]
    BackingFileNotAllowed {
        path: PathBuf,
        backing_file: String,
    },

    /// The image format could not be detected.
    #[error("failed to detect the format of '{}': {source}", path.display())]
    Detect {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// Structurally invalid or unsupported image contents.
    #[error("image format error: {message}")]
    Format { message: String },

    /// A positioned write stored fewer bytes than requested.
    #[error("read {expected}, but wrote {written} bytes at offset {offset}")]
    ShortWrite {
        offset: u64,
        expected: usize,
        written: usize,
    },

    /// The sparse copy aborted part way through.
    #[error("sparse copy failed, block_size={block_size}, copied={copied}: {source}")]
    SparseCopy {
        block_size: usize,
        copied: u64,
        #[source]
        source: Box<Error>,
    },
}

/// A specialized Result type for diskconv operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an image format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Returns true for errors raised by a failed precondition, before any
    /// file was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::SizeTooSmall { .. } | Self::Unreadable { .. } | Self::BackingFileNotAllowed { .. }
        )
    }

    /// Returns the number of bytes a failed sparse copy had advanced, if any.
    pub fn copied_bytes(&self) -> Option<u64> {
        match self {
            Self::SparseCopy { copied, .. } => Some(*copied),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
