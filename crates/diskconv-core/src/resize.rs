//! Growing raw images.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::units::format_bytes;

/// Grows the raw image at `path` to `size` bytes.
///
/// The file is truncated upwards, so the new tail is a hole that reads back
/// as zero. Callers must not pass a size smaller than the current length;
/// the conversion entry points check this before anything is written.
pub fn expand(path: &Path, size: u64, logger: &dyn Logger) -> Result<()> {
    logger.info(&format!("Expanding to {}", format_bytes(size)));

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(e, path))?;
    file.set_len(size).map_err(|e| Error::io(e, path))?;
    file.sync_all().map_err(|e| Error::io(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_expand_grows_with_zeros() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xEE; 100]).unwrap();
        file.flush().unwrap();

        expand(file.path(), 4096, &NoopLogger).unwrap();

        let data = std::fs::read(file.path()).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data[..100].iter().all(|&b| b == 0xEE));
        assert!(data[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_expand_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.img");
        let err = expand(&missing, 10, &NoopLogger).unwrap_err();
        assert!(err.to_string().contains("nope.img"));
        assert!(!missing.exists());
    }
}
