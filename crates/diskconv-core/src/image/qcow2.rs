//! qcow2 image reader.
//!
//! This module decodes qcow2 version 2 and 3 images through a memory map.
//! Guest clusters are resolved through the two-level L1/L2 table; clusters
//! that are not allocated are read from the backing image, or as zeros when
//! there is none. Compressed clusters are raw DEFLATE streams.
//!
//! Writing qcow2 is not supported.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::DeflateDecoder;
use memmap2::Mmap;

use super::{open_image_at_depth, Image, ImageType, RawImage, MAX_BACKING_DEPTH};
use crate::error::{Error, Result};

/// qcow2 magic number ("QFI\xfb").
pub const QCOW2_MAGIC: [u8; 4] = [b'Q', b'F', b'I', 0xFB];

/// Length of a version 2 header.
const HEADER_V2_LEN: usize = 72;

/// Minimum length of a version 3 header.
const HEADER_V3_MIN_LEN: usize = 104;

/// Smallest and largest cluster sizes qemu accepts (512 B and 2 MiB).
const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;

/// Longest backing file name qemu writes.
const MAX_BACKING_FILE_NAME: u32 = 1023;

/// Incompatible feature bits.
const INCOMPAT_DIRTY: u64 = 1 << 0;
const INCOMPAT_CORRUPT: u64 = 1 << 1;
const INCOMPAT_EXTERNAL_DATA: u64 = 1 << 2;
const INCOMPAT_COMPRESSION: u64 = 1 << 3;
const INCOMPAT_EXTENDED_L2: u64 = 1 << 4;
const INCOMPAT_KNOWN: u64 = INCOMPAT_DIRTY
    | INCOMPAT_CORRUPT
    | INCOMPAT_EXTERNAL_DATA
    | INCOMPAT_COMPRESSION
    | INCOMPAT_EXTENDED_L2;

/// Host offset bits of L1 and standard L2 entries.
const OFFSET_MASK: u64 = 0x00FF_FFFF_FFFF_FE00;

/// L2 entry flags.
const L2_COMPRESSED: u64 = 1 << 62;
const L2_ZERO: u64 = 1;

/// Header extension types.
const EXT_END: u32 = 0;
const EXT_BACKING_FORMAT: u32 = 0xE279_2ACA;

const SECTOR_SIZE: u64 = 512;

#[inline]
fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn be_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Parsed qcow2 header.
#[derive(Debug, Clone)]
pub struct Qcow2Header {
    pub version: u32,
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,
    pub compression_type: u8,
}

impl Qcow2Header {
    /// Parse a header from the start of an image.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_V2_LEN {
            return Err(Error::format("qcow2 header too short"));
        }
        if data[..4] != QCOW2_MAGIC {
            return Err(Error::format("invalid qcow2 magic"));
        }

        let version = be_u32(data, 4);
        if version != 2 && version != 3 {
            return Err(Error::format(format!(
                "unsupported qcow2 version: {}",
                version
            )));
        }

        let mut header = Self {
            version,
            backing_file_offset: be_u64(data, 8),
            backing_file_size: be_u32(data, 16),
            cluster_bits: be_u32(data, 20),
            size: be_u64(data, 24),
            crypt_method: be_u32(data, 32),
            l1_size: be_u32(data, 36),
            l1_table_offset: be_u64(data, 40),
            refcount_table_offset: be_u64(data, 48),
            refcount_table_clusters: be_u32(data, 56),
            nb_snapshots: be_u32(data, 60),
            snapshots_offset: be_u64(data, 64),
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: 4,
            header_length: HEADER_V2_LEN as u32,
            compression_type: 0,
        };

        if version >= 3 {
            if data.len() < HEADER_V3_MIN_LEN {
                return Err(Error::format("qcow2 v3 header too short"));
            }
            header.incompatible_features = be_u64(data, 72);
            header.compatible_features = be_u64(data, 80);
            header.autoclear_features = be_u64(data, 88);
            header.refcount_order = be_u32(data, 96);
            header.header_length = be_u32(data, 100);

            let header_length = header.header_length as usize;
            if header_length < HEADER_V3_MIN_LEN {
                return Err(Error::format(format!(
                    "qcow2 header length {} is too small",
                    header_length
                )));
            }
            if header_length > HEADER_V3_MIN_LEN {
                if data.len() <= HEADER_V3_MIN_LEN {
                    return Err(Error::format("qcow2 header extends beyond file"));
                }
                header.compression_type = data[HEADER_V3_MIN_LEN];
            }
        }

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&header.cluster_bits) {
            return Err(Error::format(format!(
                "unsupported qcow2 cluster bits: {}",
                header.cluster_bits
            )));
        }
        if header.header_length as u64 > header.cluster_size() {
            return Err(Error::format("qcow2 header does not fit in the first cluster"));
        }

        Ok(header)
    }

    /// Cluster size in bytes.
    #[inline]
    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    /// Number of entries in one L2 table.
    #[inline]
    fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }
}

/// A memory-mapped qcow2 image.
pub struct Qcow2Image {
    mmap: Mmap,
    header: Qcow2Header,
    backing_file: Option<String>,
    backing_file_format: Option<String>,
    backing: Option<Box<dyn Image>>,
    /// Why the backing image could not be opened.
    backing_error: Option<String>,
}

impl Qcow2Image {
    /// Opens a qcow2 image and, if it has one, its backing image.
    ///
    /// Relative backing file names are resolved against the directory of
    /// `path`. A backing image that cannot be opened does not fail the open;
    /// it is reported by [`Image::readable`].
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_at_depth(path, 0)
    }

    pub(crate) fn open_at_depth(path: &Path, depth: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        // Safety: the map is read-only and lives no longer than the image.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        let header = Qcow2Header::from_bytes(&mmap)?;
        let first_cluster = std::cmp::min(header.cluster_size(), mmap.len() as u64) as usize;

        let backing_file = read_backing_file_name(&mmap, &header, first_cluster)?;
        let backing_file_format = read_backing_format(&mmap, &header, first_cluster)?;

        let mut image = Self {
            mmap,
            header,
            backing_file,
            backing_file_format,
            backing: None,
            backing_error: None,
        };

        if let Some(name) = image.backing_file.clone() {
            let backing_path = resolve_backing_path(path, &name);
            if depth + 1 >= MAX_BACKING_DEPTH {
                image.backing_error = Some(format!(
                    "backing chain is deeper than {} images",
                    MAX_BACKING_DEPTH
                ));
            } else {
                tracing::debug!(
                    image = %path.display(),
                    backing = %backing_path.display(),
                    "Opening qcow2 backing file"
                );
                match open_backing(&backing_path, image.backing_file_format.as_deref(), depth + 1)
                {
                    Ok(backing) => image.backing = Some(backing),
                    Err(e) => image.backing_error = Some(e.to_string()),
                }
            }
        }

        Ok(image)
    }

    /// Returns the parsed header.
    pub fn header(&self) -> &Qcow2Header {
        &self.header
    }

    fn slice(&self, offset: u64, len: usize) -> io::Result<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.mmap.len() as u64)
            .ok_or_else(|| {
                invalid_data(format!(
                    "qcow2 data at offset {} (+{}) extends beyond file",
                    offset, len
                ))
            })?;
        Ok(&self.mmap[offset as usize..end as usize])
    }

    /// Looks up the L2 entry of a guest cluster. `None` means the L2 table
    /// itself is not allocated.
    fn l2_entry(&self, cluster_index: u64) -> io::Result<Option<u64>> {
        let l2_entries = self.header.l2_entries();
        let l1_index = cluster_index / l2_entries;
        if l1_index >= self.header.l1_size as u64 {
            return Ok(None);
        }

        let l1_entry = be_u64(
            self.slice(self.header.l1_table_offset + l1_index * 8, 8)?,
            0,
        );
        let l2_offset = l1_entry & OFFSET_MASK;
        if l2_offset == 0 {
            return Ok(None);
        }

        let l2_index = cluster_index % l2_entries;
        Ok(Some(be_u64(self.slice(l2_offset + l2_index * 8, 8)?, 0)))
    }

    /// Fills `buf` with guest data of one cluster, starting `in_cluster`
    /// bytes into it.
    fn read_cluster(&self, cluster_index: u64, in_cluster: u64, buf: &mut [u8]) -> io::Result<()> {
        let entry = match self.l2_entry(cluster_index)? {
            Some(entry) => entry,
            None => return self.read_unallocated(cluster_index, in_cluster, buf),
        };

        if entry & L2_COMPRESSED != 0 {
            let cluster = self.decompress_cluster(entry)?;
            let start = in_cluster as usize;
            buf.copy_from_slice(&cluster[start..start + buf.len()]);
            return Ok(());
        }

        // The zero flag only exists from version 3 on.
        if self.header.version >= 3 && entry & L2_ZERO != 0 {
            buf.fill(0);
            return Ok(());
        }

        let host_offset = entry & OFFSET_MASK;
        if host_offset == 0 {
            return self.read_unallocated(cluster_index, in_cluster, buf);
        }

        buf.copy_from_slice(self.slice(host_offset + in_cluster, buf.len())?);
        Ok(())
    }

    fn read_unallocated(&self, cluster_index: u64, in_cluster: u64, buf: &mut [u8]) -> io::Result<()> {
        let backing = match &self.backing {
            Some(backing) => backing,
            None => {
                buf.fill(0);
                return Ok(());
            }
        };

        let guest_offset = (cluster_index << self.header.cluster_bits) + in_cluster;
        let mut filled = 0;
        while filled < buf.len() {
            let n = backing.read_at(&mut buf[filled..], guest_offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // A backing image smaller than this one reads as zero past its end.
        buf[filled..].fill(0);
        Ok(())
    }

    fn decompress_cluster(&self, entry: u64) -> io::Result<Vec<u8>> {
        let cluster_bits = self.header.cluster_bits;
        let offset_bits = 62 - (cluster_bits - 8);
        let host_offset = entry & ((1u64 << offset_bits) - 1);
        let sectors = (entry >> offset_bits) & ((1u64 << (cluster_bits - 8)) - 1);
        let compressed_len = (sectors + 1) * SECTOR_SIZE - (host_offset & (SECTOR_SIZE - 1));

        let file_len = self.mmap.len() as u64;
        if host_offset >= file_len {
            return Err(invalid_data(format!(
                "compressed cluster at offset {} is beyond end of file",
                host_offset
            )));
        }
        // The sector count is rounded up, so the last cluster may run past EOF.
        let end = std::cmp::min(host_offset + compressed_len, file_len);
        let compressed = &self.mmap[host_offset as usize..end as usize];

        let mut cluster = vec![0u8; self.header.cluster_size() as usize];
        DeflateDecoder::new(compressed)
            .read_exact(&mut cluster)
            .map_err(|e| {
                invalid_data(format!(
                    "failed to decompress cluster at offset {}: {}",
                    host_offset, e
                ))
            })?;
        Ok(cluster)
    }
}

impl Image for Qcow2Image {
    fn size(&self) -> u64 {
        self.header.size
    }

    fn image_type(&self) -> ImageType {
        ImageType::Qcow2
    }

    fn readable(&self) -> Result<()> {
        let header = &self.header;

        if header.crypt_method != 0 {
            return Err(Error::format("encrypted images are not supported"));
        }

        let incompatible = header.incompatible_features;
        if incompatible & INCOMPAT_CORRUPT != 0 {
            return Err(Error::format("image is marked as corrupt"));
        }
        if incompatible & INCOMPAT_EXTERNAL_DATA != 0 {
            return Err(Error::format("external data files are not supported"));
        }
        if incompatible & INCOMPAT_EXTENDED_L2 != 0 {
            return Err(Error::format("extended L2 entries are not supported"));
        }
        if incompatible & INCOMPAT_COMPRESSION != 0 && header.compression_type != 0 {
            return Err(Error::format(format!(
                "compression type {} is not supported",
                header.compression_type
            )));
        }
        if incompatible & !INCOMPAT_KNOWN != 0 {
            return Err(Error::format(format!(
                "unknown incompatible features: 0x{:x}",
                incompatible & !INCOMPAT_KNOWN
            )));
        }

        let guest_per_l1_entry = header.l2_entries() * header.cluster_size();
        let needed_l1 = header.size.div_ceil(guest_per_l1_entry);
        if (header.l1_size as u64) < needed_l1 {
            return Err(Error::format(format!(
                "L1 table has {} entries, {} needed",
                header.l1_size, needed_l1
            )));
        }
        if header.l1_size > 0 {
            self.slice(header.l1_table_offset, header.l1_size as usize * 8)
                .map_err(|e| Error::format(format!("L1 table: {}", e)))?;
        }

        if let Some(reason) = &self.backing_error {
            return Err(Error::format(format!(
                "backing file '{}' cannot be opened: {}",
                self.backing_file.as_deref().unwrap_or_default(),
                reason
            )));
        }
        if let Some(backing) = &self.backing {
            backing.readable().map_err(|e| {
                Error::format(format!(
                    "backing file '{}' is not readable: {}",
                    self.backing_file.as_deref().unwrap_or_default(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let size = self.header.size;
        if offset >= size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        let cluster_size = self.header.cluster_size();

        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let cluster_index = pos >> self.header.cluster_bits;
            let in_cluster = pos & (cluster_size - 1);
            let n = std::cmp::min((len - done) as u64, cluster_size - in_cluster) as usize;
            self.read_cluster(cluster_index, in_cluster, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(len)
    }

    fn backing_file(&self) -> Option<&str> {
        self.backing_file.as_deref()
    }

    fn backing_file_format(&self) -> Option<&str> {
        self.backing_file_format.as_deref()
    }
}

fn read_backing_file_name(
    data: &[u8],
    header: &Qcow2Header,
    first_cluster: usize,
) -> Result<Option<String>> {
    if header.backing_file_offset == 0 || header.backing_file_size == 0 {
        return Ok(None);
    }
    if header.backing_file_size > MAX_BACKING_FILE_NAME {
        return Err(Error::format(format!(
            "backing file name is too long ({} bytes)",
            header.backing_file_size
        )));
    }

    let start = header.backing_file_offset;
    let end = match start.checked_add(header.backing_file_size as u64) {
        Some(end) if end <= first_cluster as u64 => end,
        _ => {
            return Err(Error::format(
                "backing file name extends beyond the first cluster",
            ))
        }
    };

    let name = std::str::from_utf8(&data[start as usize..end as usize])
        .map_err(|_| Error::format("backing file name is not valid UTF-8"))?;
    Ok(Some(name.to_string()))
}

/// Walks the header extensions looking for the backing format.
fn read_backing_format(
    data: &[u8],
    header: &Qcow2Header,
    first_cluster: usize,
) -> Result<Option<String>> {
    let mut pos = header.header_length as usize;
    while pos + 8 <= first_cluster {
        let ext_type = be_u32(data, pos);
        let ext_len = be_u32(data, pos + 4) as usize;
        if ext_type == EXT_END {
            break;
        }

        let start = pos + 8;
        let end = start + ext_len;
        if end > first_cluster {
            return Err(Error::format(format!(
                "header extension 0x{:08x} extends beyond the first cluster",
                ext_type
            )));
        }
        if ext_type == EXT_BACKING_FORMAT {
            let format = std::str::from_utf8(&data[start..end])
                .map_err(|_| Error::format("backing format is not valid UTF-8"))?;
            return Ok(Some(format.to_string()));
        }

        pos = start + ext_len.next_multiple_of(8);
    }
    Ok(None)
}

fn resolve_backing_path(image_path: &Path, name: &str) -> PathBuf {
    let backing = Path::new(name);
    if backing.is_absolute() {
        return backing.to_path_buf();
    }
    match image_path.parent() {
        Some(dir) => dir.join(backing),
        None => backing.to_path_buf(),
    }
}

fn open_backing(path: &Path, format: Option<&str>, depth: usize) -> Result<Box<dyn Image>> {
    // An explicit format wins over sniffing, so a raw backing file that
    // happens to start with a qcow2 magic is still read as raw.
    match format {
        Some("raw") => Ok(Box::new(RawImage::open(path)?)),
        Some("qcow2") => Ok(Box::new(Qcow2Image::open_at_depth(path, depth)?)),
        _ => open_image_at_depth(path, depth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v3_header(cluster_bits: u32, size: u64) -> Vec<u8> {
        let mut data = vec![0u8; 1 << cluster_bits];
        data[..4].copy_from_slice(&QCOW2_MAGIC);
        data[4..8].copy_from_slice(&3u32.to_be_bytes());
        data[20..24].copy_from_slice(&cluster_bits.to_be_bytes());
        data[24..32].copy_from_slice(&size.to_be_bytes());
        data[96..100].copy_from_slice(&4u32.to_be_bytes());
        data[100..104].copy_from_slice(&104u32.to_be_bytes());
        data
    }

    #[test]
    fn test_header_from_bytes() {
        let mut data = v3_header(16, 1 << 30);
        data[36..40].copy_from_slice(&2u32.to_be_bytes());
        data[40..48].copy_from_slice(&65536u64.to_be_bytes());

        let header = Qcow2Header::from_bytes(&data).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.cluster_bits, 16);
        assert_eq!(header.cluster_size(), 65536);
        assert_eq!(header.size, 1 << 30);
        assert_eq!(header.l1_size, 2);
        assert_eq!(header.l1_table_offset, 65536);
        assert_eq!(header.l2_entries(), 8192);
    }

    #[test]
    fn test_invalid_magic() {
        let data = vec![0u8; 512];
        assert!(Qcow2Header::from_bytes(&data).is_err());
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = v3_header(16, 0);
        data[4..8].copy_from_slice(&1u32.to_be_bytes());
        let err = Qcow2Header::from_bytes(&data).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_bad_cluster_bits() {
        let mut data = v3_header(16, 0);
        data[20..24].copy_from_slice(&30u32.to_be_bytes());
        assert!(Qcow2Header::from_bytes(&data).is_err());
    }

    #[test]
    fn test_backing_format_extension() {
        let mut data = v3_header(16, 0);
        data[104..108].copy_from_slice(&EXT_BACKING_FORMAT.to_be_bytes());
        data[108..112].copy_from_slice(&3u32.to_be_bytes());
        data[112..115].copy_from_slice(b"raw");
        let header = Qcow2Header::from_bytes(&data).unwrap();
        let format = read_backing_format(&data, &header, data.len()).unwrap();
        assert_eq!(format.as_deref(), Some("raw"));
    }

    #[test]
    fn test_backing_name_too_long() {
        let mut data = v3_header(16, 0);
        data[8..16].copy_from_slice(&512u64.to_be_bytes());
        data[16..20].copy_from_slice(&2000u32.to_be_bytes());
        let header = Qcow2Header::from_bytes(&data).unwrap();
        assert!(read_backing_file_name(&data, &header, data.len()).is_err());
    }

    #[test]
    fn test_resolve_backing_path() {
        let image = Path::new("/vm/disks/child.qcow2");
        assert_eq!(
            resolve_backing_path(image, "base.img"),
            PathBuf::from("/vm/disks/base.img")
        );
        assert_eq!(
            resolve_backing_path(image, "/abs/base.img"),
            PathBuf::from("/abs/base.img")
        );
    }
}
