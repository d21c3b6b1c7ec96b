//! Raw images, read through a memory map.

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;

use super::{Image, ImageType};
use crate::error::{Error, Result};

/// A memory-mapped raw disk image.
///
/// The virtual size of a raw image is simply the file length.
pub struct RawImage {
    mmap: Mmap,
    size: u64,
}

impl RawImage {
    /// Opens a raw image.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        // Safety: the map is read-only and lives no longer than the image.
        // Concurrent truncation of the file by another process is not supported.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self { mmap, size })
    }
}

impl Image for RawImage {
    #[inline]
    fn size(&self) -> u64 {
        self.size
    }

    fn image_type(&self) -> ImageType {
        ImageType::Raw
    }

    fn readable(&self) -> Result<()> {
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let start = offset as usize;
        let len = std::cmp::min(buf.len() as u64, self.size - offset) as usize;
        buf[..len].copy_from_slice(&self.mmap[start..start + len]);
        Ok(len)
    }
}
