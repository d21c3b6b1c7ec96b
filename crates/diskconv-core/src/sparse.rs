//! Sparse copying.
//!
//! [`copy_sparse`] streams a source into a destination that has already been
//! sized to its final length. Blocks made entirely of zero bytes are skipped
//! instead of written, so they stay holes on filesystems that support them.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::ioutil::read_full;

/// Default block size used when copying image data (1 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Destination that accepts writes at an absolute offset.
pub trait PositionedWrite {
    /// Writes `buf` at `offset`, returning how many bytes were stored.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

impl PositionedWrite for File {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }
}

/// Copies `src` into `dest`, skipping all-zero blocks.
///
/// `dest` must already be at least as long as the data in `src`, so that the
/// skipped regions read back as zero. Returns the number of bytes the write
/// offset advanced, which equals the number of bytes read from `src`.
///
/// # Errors
///
/// Any read or write failure aborts the copy with [`Error::SparseCopy`],
/// which carries the number of bytes advanced before the failure. A write
/// that stores fewer bytes than requested is reported as
/// [`Error::ShortWrite`] inside it.
pub fn copy_sparse<W, R>(dest: &W, src: &mut R, block_size: usize) -> Result<u64>
where
    W: PositionedWrite + ?Sized,
    R: Read + ?Sized,
{
    if block_size == 0 {
        return Err(Error::format("block size must not be zero"));
    }

    let zero_buf = vec![0u8; block_size];
    let mut buf = vec![0u8; block_size];
    let mut copied = 0u64;

    let fail = |copied: u64, source: Error| Error::SparseCopy {
        block_size,
        copied,
        source: Box::new(source),
    };

    loop {
        let read = read_full(src, &mut buf).map_err(|e| fail(copied, Error::io_simple(e)))?;
        if read == 0 {
            break;
        }

        let block = &buf[..read];
        if block == &zero_buf[..read] {
            copied += read as u64;
            continue;
        }

        let written = dest
            .write_at(block, copied)
            .map_err(|e| fail(copied, Error::io_simple(e)))?;
        if written != read {
            let offset = copied;
            copied += written as u64;
            return Err(fail(
                copied,
                Error::ShortWrite {
                    offset,
                    expected: read,
                    written,
                },
            ));
        }
        copied += written as u64;
    }

    Ok(copied)
}

/// Makes `file` exactly `len` bytes long, leaving the handle positioned at
/// `len`. Growing this way leaves a hole rather than allocating zeros.
pub fn make_sparse(file: &mut File, len: u64) -> Result<()> {
    file.seek(SeekFrom::Start(len))?;
    file.set_len(len)?;
    Ok(())
}
