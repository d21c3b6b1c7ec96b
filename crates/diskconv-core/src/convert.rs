//! Conversion orchestrator.
//!
//! This module turns a raw or qcow2 source into a sparse raw image:
//! 1. Open the source and detect its format
//! 2. Check preconditions (requested size, readability, backing file)
//! 3. Copy the data, either by cloning a raw file or by decoding the image
//!    block by block into a sparse temporary file
//! 4. Optionally grow the result, then rename it over the destination
//!
//! Source and destination may be the same path.
//!
//! # Example
//!
//! ```no_run
//! use diskconv_core::convert::{ConvertOptions, Converter};
//! use std::path::Path;
//!
//! let options = ConvertOptions::new(Some(20 * 1024 * 1024 * 1024), false);
//! Converter::new(options)
//!     .convert_to_raw(Path::new("disk.qcow2"), Path::new("disk.img"))
//!     .unwrap();
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{Builder, NamedTempFile};

use crate::error::{Error, Result};
use crate::image::{open_image, Image, ImageReader, ImageType};
use crate::logger::{Logger, NoopLogger, TracingLogger};
use crate::progress::{ConvertPhase, ConvertProgress, ProgressCallback, ProgressReporter};
use crate::resize::expand;
use crate::sparse::{copy_sparse, DEFAULT_BLOCK_SIZE};

/// Marker placed in temporary file names, `<dest>.diskconv-XXXXXX.tmp`.
pub const TEMP_FILE_MARKER: &str = "diskconv";

/// Options for a conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Final size of the raw image. Must not be smaller than the source.
    pub size: Option<u64>,
    /// Accept qcow2 sources that reference a backing file.
    pub allow_backing_file: bool,
    /// Size of the blocks read from the source and checked for zeros.
    pub block_size: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            size: None,
            allow_backing_file: false,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ConvertOptions {
    /// Create new options with the default block size.
    pub fn new(size: Option<u64>, allow_backing_file: bool) -> Self {
        Self {
            size,
            allow_backing_file,
            ..Self::default()
        }
    }

    /// Use a different copy block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }
}

/// Converts disk images to raw.
///
/// A converter logs through an injected [`Logger`] (silent by default) and
/// reports progress through an optional [`ProgressCallback`].
pub struct Converter {
    options: ConvertOptions,
    logger: Arc<dyn Logger>,
    progress_callback: Option<ProgressCallback>,
}

impl Converter {
    /// Create a converter with the given options and no logging.
    pub fn new(options: ConvertOptions) -> Self {
        Self {
            options,
            logger: Arc::new(NoopLogger),
            progress_callback: None,
        }
    }

    /// Log through `logger`.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Report progress through `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Convert `source` into a raw image at `dest`.
    ///
    /// `dest` is only ever replaced by an atomic rename of a fully written
    /// temporary file next to it, except when `source` and `dest` are the
    /// same raw file: then nothing is copied and the file is grown in place
    /// if a size was requested.
    ///
    /// # Errors
    ///
    /// - [`Error::SizeTooSmall`] if the requested size is below the source size
    /// - [`Error::Unreadable`] if the decoder cannot read the source
    /// - [`Error::BackingFileNotAllowed`] for a qcow2 source with a backing
    ///   file, unless `allow_backing_file` is set
    /// - I/O errors from copying, resizing or renaming
    pub fn convert_to_raw(&self, source: &Path, dest: &Path) -> Result<()> {
        self.report(ConvertPhase::Inspecting, 0);

        let image = open_image(source).map_err(|e| match e {
            Error::Io { .. } => e,
            other => Error::Detect {
                path: source.to_path_buf(),
                source: Box::new(other),
            },
        })?;

        if let Some(size) = self.options.size {
            if size < image.size() {
                return Err(Error::SizeTooSmall {
                    requested: size,
                    actual: image.size(),
                    path: source.to_path_buf(),
                });
            }
        }
        image.readable().map_err(|e| Error::Unreadable {
            path: source.to_path_buf(),
            source: Box::new(e),
        })?;

        let image_type = image.image_type();
        self.logger.info(&format!(
            "Converting '{}' ({}) to a raw disk '{}'",
            source.display(),
            image_type,
            dest.display()
        ));

        match image_type {
            ImageType::Raw => {
                // Release the map before the file is cloned or grown.
                drop(image);
                self.convert_raw_to_raw(source, dest)?;
            }
            ImageType::Qcow2 => {
                if !self.options.allow_backing_file {
                    if let Some(backing_file) = image.backing_file().filter(|b| !b.is_empty()) {
                        return Err(Error::BackingFileNotAllowed {
                            path: source.to_path_buf(),
                            backing_file: backing_file.to_string(),
                        });
                    }
                }
                self.convert_image_to_raw(image.as_ref(), dest)?;
            }
            // Only reachable once another format gets a decoder; today every
            // other type fails `readable()` above.
            other => {
                self.logger.warn(&format!(
                    "image '{}' has an unexpected format: '{}'",
                    source.display(),
                    other
                ));
                self.convert_image_to_raw(image.as_ref(), dest)?;
            }
        }

        let final_size = fs::metadata(dest).map_err(|e| Error::io(e, dest))?.len();
        let mut progress = ConvertProgress::new(ConvertPhase::Complete, final_size);
        progress.bytes_processed = final_size;
        if let Some(callback) = &self.progress_callback {
            callback(progress);
        }
        Ok(())
    }

    /// Decode `image` into a sparse temporary file and rename it onto `dest`.
    fn convert_image_to_raw(&self, image: &dyn Image, dest: &Path) -> Result<()> {
        // Source and dest can be the same file, so always go through a temp file.
        let dest_tmp = temp_file_beside(dest)?;
        let size = image.size();

        // Zero blocks are skipped, not written, so the file needs its final
        // length before the copy starts.
        dest_tmp
            .as_file()
            .set_len(size)
            .map_err(|e| Error::io(e, dest_tmp.path()))?;

        let block_size = self.options.block_size;
        let reporter = ProgressReporter::new(size, self.progress_callback.as_ref());
        reporter.start();
        let mut reader = reporter.wrap_read(ImageReader::new(image));
        let copied = copy_sparse(dest_tmp.as_file(), &mut reader, block_size);
        reporter.finish();
        let copied = copied?;
        tracing::debug!(copied, block_size, "Copied image data");

        let dest_tmp = dest_tmp.into_temp_path();

        if let Some(target) = self.options.size {
            self.report(ConvertPhase::Resizing, target);
            expand(&dest_tmp, target, self.logger.as_ref())?;
        }

        dest_tmp.persist(dest).map_err(|e| Error::io(e.error, dest))?;
        Ok(())
    }

    /// Copy a raw file, cloning it when the filesystem supports it.
    fn convert_raw_to_raw(&self, source: &Path, dest: &Path) -> Result<()> {
        if is_same_file(source, dest) {
            if let Some(target) = self.options.size {
                self.report(ConvertPhase::Resizing, target);
                expand(dest, target, self.logger.as_ref())?;
            }
            return Ok(());
        }

        let dir = parent_dir(dest);
        let dest_tmp = Builder::new()
            .prefix(&temp_prefix(dest))
            .suffix(".tmp")
            .make_in(&dir, |path| reflink_copy::reflink_or_copy(source, path))
            .map_err(|e| Error::io(e, source))?
            .into_temp_path();

        if let Some(target) = self.options.size {
            self.report(ConvertPhase::Resizing, target);
            expand(&dest_tmp, target, self.logger.as_ref())?;
        }

        dest_tmp.persist(dest).map_err(|e| Error::io(e.error, dest))?;
        Ok(())
    }

    fn report(&self, phase: ConvertPhase, bytes_total: u64) {
        if let Some(callback) = &self.progress_callback {
            callback(ConvertProgress::new(phase, bytes_total));
        }
    }
}

/// Convert `source` into a raw image at `dest`, logging through `tracing`.
///
/// `source` and `dest` may be the same. This is a no-op when they are and
/// the source is already raw and no resize is requested.
pub fn convert_to_raw(
    source: &Path,
    dest: &Path,
    size: Option<u64>,
    allow_backing_file: bool,
) -> Result<()> {
    Converter::new(ConvertOptions::new(size, allow_backing_file))
        .with_logger(Arc::new(TracingLogger))
        .convert_to_raw(source, dest)
}

/// Summary information about an image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Path of the image.
    pub path: PathBuf,
    /// Detected format.
    pub format: ImageType,
    /// Size of the virtual disk in bytes.
    pub virtual_size: u64,
    /// Size of the image file in bytes.
    pub file_size: u64,
    /// Backing file name, if any.
    pub backing_file: Option<String>,
    /// Backing file format, if recorded.
    pub backing_file_format: Option<String>,
    /// Why the image cannot be converted, if it cannot.
    pub unreadable_reason: Option<String>,
}

impl ImageInfo {
    /// Returns true if the image can be decoded.
    pub fn is_readable(&self) -> bool {
        self.unreadable_reason.is_none()
    }
}

/// Get information about an image without converting it.
pub fn inspect_image(path: &Path) -> Result<ImageInfo> {
    let image = open_image(path)?;
    let file_size = fs::metadata(path).map_err(|e| Error::io(e, path))?.len();

    Ok(ImageInfo {
        path: path.to_path_buf(),
        format: image.image_type(),
        virtual_size: image.size(),
        file_size,
        backing_file: image.backing_file().map(str::to_string),
        backing_file_format: image.backing_file_format().map(str::to_string),
        unreadable_reason: image.readable().err().map(|e| e.to_string()),
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Prefix of temporary files for `dest`.
fn temp_prefix(dest: &Path) -> String {
    let base = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    format!("{}.{}-", base, TEMP_FILE_MARKER)
}

/// Create a temp file in the directory of `dest`, so the final rename stays
/// on one filesystem.
fn temp_file_beside(dest: &Path) -> Result<NamedTempFile> {
    let dir = parent_dir(dest);
    Builder::new()
        .prefix(&temp_prefix(dest))
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| Error::io(e, &dir))
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
