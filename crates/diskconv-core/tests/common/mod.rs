//! Shared fixtures for integration tests.
//!
//! [`Qcow2Builder`] writes small but valid qcow2 images with 64 KiB clusters,
//! enough to exercise data, zero, compressed and unallocated clusters as
//! well as backing files.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::DeflateEncoder;
use flate2::Compression;

pub const CLUSTER_BITS: u32 = 16;
pub const CLUSTER_SIZE: usize = 1 << CLUSTER_BITS;
pub const ONE_MB: usize = 1024 * 1024;

const L2_ENTRIES: u64 = (CLUSTER_SIZE / 8) as u64;
const COPIED: u64 = 1 << 63;
const COMPRESSED: u64 = 1 << 62;
const BACKING_NAME_OFFSET: usize = 512;

/// Deterministic non-zero data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 31 + seed as u64) % 251) as u8 + 1)
        .collect()
}

/// Names of leftover temporary files in `dir`.
pub fn temp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("Failed to list directory")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".diskconv-"))
        .collect()
}

enum Cluster {
    Data(Vec<u8>),
    Zero,
    Compressed(Vec<u8>),
    RawEntry(u64),
}

/// Builds qcow2 images in memory.
pub struct Qcow2Builder {
    version: u32,
    size: u64,
    backing_file: Option<String>,
    backing_format: Option<String>,
    crypt_method: u32,
    incompatible_features: u64,
    clusters: BTreeMap<u64, Cluster>,
}

impl Qcow2Builder {
    pub fn new(size: u64) -> Self {
        Self {
            version: 3,
            size,
            backing_file: None,
            backing_format: None,
            crypt_method: 0,
            incompatible_features: 0,
            clusters: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn backing_file(mut self, name: &str) -> Self {
        self.backing_file = Some(name.to_string());
        self
    }

    pub fn backing_format(mut self, format: &str) -> Self {
        self.backing_format = Some(format.to_string());
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.crypt_method = 1;
        self
    }

    pub fn incompatible_features(mut self, bits: u64) -> Self {
        self.incompatible_features = bits;
        self
    }

    /// Store `data` (at most one cluster) at guest cluster `index`.
    pub fn data(mut self, index: u64, data: Vec<u8>) -> Self {
        assert!(data.len() <= CLUSTER_SIZE);
        self.clusters.insert(index, Cluster::Data(data));
        self
    }

    /// Mark guest cluster `index` as reading zero.
    pub fn zero(mut self, index: u64) -> Self {
        self.clusters.insert(index, Cluster::Zero);
        self
    }

    /// Store `data` compressed at guest cluster `index`.
    pub fn compressed(mut self, index: u64, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), CLUSTER_SIZE);
        self.clusters.insert(index, Cluster::Compressed(data));
        self
    }

    /// Put an arbitrary L2 entry at guest cluster `index`.
    pub fn raw_entry(mut self, index: u64, entry: u64) -> Self {
        self.clusters.insert(index, Cluster::RawEntry(entry));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let guest_per_l2 = L2_ENTRIES * CLUSTER_SIZE as u64;
        let l1_size = self.size.div_ceil(guest_per_l2);
        let l1_offset = CLUSTER_SIZE;

        let mut image = vec![0u8; 2 * CLUSTER_SIZE];
        self.write_header(&mut image, l1_size, l1_offset as u64);

        // Allocate one L2 table per L1 entry in use.
        let mut l2_tables = BTreeMap::new();
        for &index in self.clusters.keys() {
            let l1_index = index / L2_ENTRIES;
            l2_tables.entry(l1_index).or_insert_with(|| {
                let offset = image.len();
                image.resize(offset + CLUSTER_SIZE, 0);
                let entry = offset as u64 | COPIED;
                let slot = l1_offset + l1_index as usize * 8;
                image[slot..slot + 8].copy_from_slice(&entry.to_be_bytes());
                offset
            });
        }

        for (&index, cluster) in &self.clusters {
            let entry = match cluster {
                Cluster::Data(data) => {
                    let offset = image.len();
                    image.resize(offset + CLUSTER_SIZE, 0);
                    image[offset..offset + data.len()].copy_from_slice(data);
                    offset as u64 | COPIED
                }
                Cluster::Zero => 1,
                Cluster::Compressed(data) => {
                    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                    encoder.write_all(data).unwrap();
                    let compressed = encoder.finish().unwrap();

                    let offset = image.len();
                    let clusters = compressed.len().div_ceil(CLUSTER_SIZE);
                    image.resize(offset + clusters * CLUSTER_SIZE, 0);
                    image[offset..offset + compressed.len()].copy_from_slice(&compressed);

                    let offset_bits = 62 - (CLUSTER_BITS - 8);
                    let sectors = compressed.len().div_ceil(512) as u64 - 1;
                    COMPRESSED | (sectors << offset_bits) | offset as u64
                }
                Cluster::RawEntry(entry) => *entry,
            };

            let l2_offset = l2_tables[&(index / L2_ENTRIES)];
            let slot = l2_offset + (index % L2_ENTRIES) as usize * 8;
            image[slot..slot + 8].copy_from_slice(&entry.to_be_bytes());
        }

        image
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        std::fs::write(path, self.build()).expect("Failed to write qcow2 image");
        path.to_path_buf()
    }

    fn write_header(&self, image: &mut [u8], l1_size: u64, l1_offset: u64) {
        image[..4].copy_from_slice(b"QFI\xfb");
        image[4..8].copy_from_slice(&self.version.to_be_bytes());
        image[20..24].copy_from_slice(&CLUSTER_BITS.to_be_bytes());
        image[24..32].copy_from_slice(&self.size.to_be_bytes());
        image[32..36].copy_from_slice(&self.crypt_method.to_be_bytes());
        image[36..40].copy_from_slice(&(l1_size as u32).to_be_bytes());
        image[40..48].copy_from_slice(&l1_offset.to_be_bytes());

        let mut ext_offset = 72;
        if self.version >= 3 {
            image[72..80].copy_from_slice(&self.incompatible_features.to_be_bytes());
            image[96..100].copy_from_slice(&4u32.to_be_bytes());
            image[100..104].copy_from_slice(&104u32.to_be_bytes());
            ext_offset = 104;
        }

        if let Some(format) = &self.backing_format {
            image[ext_offset..ext_offset + 4].copy_from_slice(&0xE279_2ACAu32.to_be_bytes());
            image[ext_offset + 4..ext_offset + 8]
                .copy_from_slice(&(format.len() as u32).to_be_bytes());
            image[ext_offset + 8..ext_offset + 8 + format.len()].copy_from_slice(format.as_bytes());
        }

        if let Some(name) = &self.backing_file {
            let start = BACKING_NAME_OFFSET;
            image[start..start + name.len()].copy_from_slice(name.as_bytes());
            image[8..16].copy_from_slice(&(start as u64).to_be_bytes());
            image[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
        }
    }
}
