//! Disk image decoding.
//!
//! [`open_image`] sniffs the format of a file and returns a boxed [`Image`].
//! Raw and qcow2 images are decoded; other well-known formats are detected
//! so they can be reported, but [`Image::readable`] rejects them.

pub mod qcow2;
pub mod raw;

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{Error, Result};
use crate::ioutil::read_at_most;

pub use qcow2::Qcow2Image;
pub use raw::RawImage;

/// Number of header bytes inspected by [`detect_format`].
pub const PROBE_LEN: u64 = 512;

/// Maximum depth of a qcow2 backing chain.
pub const MAX_BACKING_DEPTH: usize = 16;

/// Format of a disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Raw,
    Qcow2,
    Vmdk,
    Vhdx,
    Vpc,
    Parallels,
    Vdi,
}

impl ImageType {
    /// Lower-case format name, as used by qemu.
    pub fn name(&self) -> &'static str {
        match self {
            ImageType::Raw => "raw",
            ImageType::Qcow2 => "qcow2",
            ImageType::Vmdk => "vmdk",
            ImageType::Vhdx => "vhdx",
            ImageType::Vpc => "vpc",
            ImageType::Parallels => "parallels",
            ImageType::Vdi => "vdi",
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded disk image.
///
/// The image is closed when dropped.
pub trait Image: Send {
    /// Virtual size of the disk in bytes.
    fn size(&self) -> u64;

    /// Format of the image.
    fn image_type(&self) -> ImageType;

    /// Checks that every feature the image uses can be decoded.
    fn readable(&self) -> Result<()>;

    /// Reads guest data at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at the end of
    /// the virtual disk.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Name of the backing file, if the format has one and it is set.
    fn backing_file(&self) -> Option<&str> {
        None
    }

    /// Format of the backing file, when the image records it.
    fn backing_file_format(&self) -> Option<&str> {
        None
    }
}

/// Detects the format of the image at `path` from its first bytes.
pub fn detect_format(path: &Path) -> Result<ImageType> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let header = read_at_most(file, PROBE_LEN).map_err(|e| Error::io(e, path))?;
    Ok(detect_from_header(&header))
}

fn detect_from_header(header: &[u8]) -> ImageType {
    if header.starts_with(&qcow2::QCOW2_MAGIC) {
        ImageType::Qcow2
    } else if header.starts_with(b"KDMV") {
        ImageType::Vmdk
    } else if header.starts_with(b"vhdxfile") {
        ImageType::Vhdx
    } else if header.starts_with(b"conectix") {
        ImageType::Vpc
    } else if header.starts_with(b"WithoutFreeSpace") || header.starts_with(b"WithouFreSpacExt") {
        ImageType::Parallels
    } else if header.len() >= 0x44
        && u32::from_le_bytes([header[0x40], header[0x41], header[0x42], header[0x43]])
            == 0xBEDA_107F
    {
        ImageType::Vdi
    } else {
        ImageType::Raw
    }
}

/// Opens the image at `path`, detecting its format.
pub fn open_image(path: &Path) -> Result<Box<dyn Image>> {
    open_image_at_depth(path, 0)
}

pub(crate) fn open_image_at_depth(path: &Path, depth: usize) -> Result<Box<dyn Image>> {
    let image_type = detect_format(path)?;
    let image: Box<dyn Image> = match image_type {
        ImageType::Raw => Box::new(RawImage::open(path)?),
        ImageType::Qcow2 => Box::new(Qcow2Image::open_at_depth(path, depth)?),
        other => Box::new(UnsupportedImage::open(path, other)?),
    };
    Ok(image)
}

/// A detected format that cannot be decoded.
pub struct UnsupportedImage {
    image_type: ImageType,
    file_size: u64,
}

impl UnsupportedImage {
    fn open(path: &Path, image_type: ImageType) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| Error::io(e, path))?;
        Ok(Self {
            image_type,
            file_size: metadata.len(),
        })
    }
}

impl Image for UnsupportedImage {
    // The virtual size is unknown without a decoder; report the file size.
    fn size(&self) -> u64 {
        self.file_size
    }

    fn image_type(&self) -> ImageType {
        self.image_type
    }

    fn readable(&self) -> Result<()> {
        Err(Error::format(format!(
            "unsupported image format: {}",
            self.image_type
        )))
    }

    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot read {} images", self.image_type),
        ))
    }
}

/// Sequential reader over the whole virtual disk of an image.
pub struct ImageReader<'a> {
    image: &'a dyn Image,
    offset: u64,
    size: u64,
}

impl<'a> ImageReader<'a> {
    /// Creates a reader over `[0, image.size())`.
    pub fn new(image: &'a dyn Image) -> Self {
        Self {
            image,
            offset: 0,
            size: image.size(),
        }
    }
}

impl Read for ImageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let remaining = self.size - self.offset;
        let len = std::cmp::min(remaining, buf.len() as u64) as usize;
        let n = self.image.read_at(&mut buf[..len], self.offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("image ended at offset {} before its size {}", self.offset, self.size),
            ));
        }
        self.offset += n as u64;
        Ok(n)
    }
}
