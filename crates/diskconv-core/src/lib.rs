//! diskconv Core Library
//!
//! This crate converts virtual machine disk images (qcow2 or raw) into sparse
//! raw images without calling out to `qemu-img`.
//!
//! # Overview
//!
//! The main entry point is [`convert_to_raw`], or a [`Converter`] when
//! logging and progress reporting should be wired in. Source and destination
//! may be the same path; the destination is replaced atomically.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`image`] - Format detection and decoding (raw, qcow2)
//! - [`sparse`] - Copying that leaves zero blocks as holes
//! - [`resize`] - Growing raw images
//! - [`convert`] - Conversion orchestrator
//! - [`progress`] - Progress reporting
//! - [`logger`] - Injected leveled logging
//! - [`units`] - Human-readable sizes
//! - [`ioutil`] - Small I/O helpers
//!
//! # Quick Start
//!
//! ```no_run
//! use diskconv_core::convert_to_raw;
//! use std::path::Path;
//!
//! let source = Path::new("/path/to/disk.qcow2");
//! let dest = Path::new("/path/to/disk.img");
//!
//! convert_to_raw(source, dest, Some(20 * 1024 * 1024 * 1024), false).unwrap();
//! ```

pub mod convert;
pub mod error;
pub mod image;
pub mod ioutil;
pub mod logger;
pub mod progress;
pub mod resize;
pub mod sparse;
pub mod units;

pub use error::{Error, Result};

// Re-export the conversion API for convenience
pub use convert::{
    convert_to_raw, inspect_image, ConvertOptions, Converter, ImageInfo, TEMP_FILE_MARKER,
};
pub use image::{detect_format, open_image, Image, ImageReader, ImageType};
pub use logger::{Logger, NoopLogger, TracingLogger};
pub use progress::{ConvertPhase, ConvertProgress, ProgressCallback, ProgressReporter};
pub use sparse::{copy_sparse, make_sparse, PositionedWrite, DEFAULT_BLOCK_SIZE};
