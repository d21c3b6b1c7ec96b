//! Small I/O helpers.

use std::io::{self, Read};

/// Reads at most `limit` bytes from `reader`.
///
/// Returns fewer bytes when the reader hits end-of-file first. Any read
/// error other than `Interrupted` is returned as is.
pub fn read_at_most<R: Read>(reader: R, limit: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(limit).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Fills `buf` from `reader` until it is full or the reader is exhausted.
///
/// Returns the number of bytes placed in `buf`.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
