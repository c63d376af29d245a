// SPDX-License-Identifier: MPL-2.0

//! Builder for small synthetic exFAT volume images used by the tests.
//!
//! Geometry: 512-byte sectors, one sector per cluster, 64 heap clusters.
//! The boot regions live in sectors 0..24, the FAT at sector 24 and the
//! cluster heap at sector 32. Cluster 2 holds the allocation bitmap,
//! cluster 3 the upcase table and cluster 4 the root directory.

use exfat_fsck::{
    dentry::{build_file_dentry_set, DentrySet, StreamDentry, StreamFlags, DENTRY_SIZE},
    super_block::boot_calc_checksum,
    upcase_table::UpcaseTable,
    utils::calc_checksum_32,
};

pub const SECTOR_SIZE: usize = 512;
pub const CLUSTER_SIZE: usize = 512;
pub const CLUSTER_COUNT: u32 = 64;
pub const FAT_SECTOR: usize = 24;
pub const HEAP_SECTOR: usize = 32;
pub const NUM_SECTORS: usize = 96;

pub const BITMAP_CLUSTER: u32 = 2;
pub const UPCASE_CLUSTER: u32 = 3;
pub const ROOT_CLUSTER: u32 = 4;

pub const EOC: u32 = 0xFFFF_FFFF;

pub const ATTR_DIRECTORY: u16 = 0x0010;
pub const ATTR_ARCHIVE: u16 = 0x0020;

/// Byte offset of a heap cluster inside the image.
pub fn cluster_off(cluster: u32) -> usize {
    HEAP_SECTOR * SECTOR_SIZE + (cluster as usize - 2) * CLUSTER_SIZE
}

/// Byte offset of the FAT entry of `cluster`.
pub fn fat_entry_off(cluster: u32) -> usize {
    FAT_SECTOR * SECTOR_SIZE + cluster as usize * 4
}

pub fn read_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(image[offset..offset + 2].try_into().unwrap())
}

pub fn read_u32(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
}

pub struct ImageBuilder {
    image: Vec<u8>,
    /// Entries used so far in the root directory.
    root_entries: usize,
    upcase: UpcaseTable,
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut builder = ImageBuilder {
            image: vec![0u8; NUM_SECTORS * SECTOR_SIZE],
            root_entries: 0,
            upcase: UpcaseTable::identity(),
        };
        builder.write_boot_sector();

        // Media descriptor entries and the three mandatory clusters.
        builder.set_fat(0, 0xFFFF_FFF8);
        builder.set_fat(1, EOC);
        builder.set_fat(BITMAP_CLUSTER, EOC);
        builder.set_fat(UPCASE_CLUSTER, EOC);
        builder.set_fat(ROOT_CLUSTER, EOC);
        builder.mark_bitmap(BITMAP_CLUSTER);
        builder.mark_bitmap(UPCASE_CLUSTER);
        builder.mark_bitmap(ROOT_CLUSTER);

        // Identity upcase table: one 0xFFFF run marker.
        let upcase_data = [0xFFu8, 0xFF, 0xFF, 0xFF];
        let off = cluster_off(UPCASE_CLUSTER);
        builder.image[off..off + upcase_data.len()].copy_from_slice(&upcase_data);
        let upcase_checksum = calc_checksum_32(&upcase_data, 0..0, 0);

        // Root: volume label, bitmap dentry, upcase dentry.
        let mut label = [0u8; DENTRY_SIZE];
        label[0] = 0x83;
        label[1] = 7;
        for (i, unit) in "TESTVOL".encode_utf16().enumerate() {
            label[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        builder.push_root_entries(&label);

        let mut bitmap = [0u8; DENTRY_SIZE];
        bitmap[0] = 0x81;
        bitmap[20..24].copy_from_slice(&BITMAP_CLUSTER.to_le_bytes());
        bitmap[24..32].copy_from_slice(&(CLUSTER_COUNT as u64).div_ceil(8).to_le_bytes());
        builder.push_root_entries(&bitmap);

        let mut upcase = [0u8; DENTRY_SIZE];
        upcase[0] = 0x82;
        upcase[4..8].copy_from_slice(&upcase_checksum.to_le_bytes());
        upcase[20..24].copy_from_slice(&UPCASE_CLUSTER.to_le_bytes());
        upcase[24..32].copy_from_slice(&(upcase_data.len() as u64).to_le_bytes());
        builder.push_root_entries(&upcase);

        builder
    }

    fn write_boot_sector(&mut self) {
        let bs = &mut self.image[..SECTOR_SIZE];
        bs[0] = 0xEB;
        bs[1] = 0x76;
        bs[2] = 0x90;
        bs[3..11].copy_from_slice(b"EXFAT   ");
        bs[72..80].copy_from_slice(&(NUM_SECTORS as u64).to_le_bytes());
        bs[80..84].copy_from_slice(&(FAT_SECTOR as u32).to_le_bytes());
        bs[84..88].copy_from_slice(&4u32.to_le_bytes()); // fat_length
        bs[88..92].copy_from_slice(&(HEAP_SECTOR as u32).to_le_bytes());
        bs[92..96].copy_from_slice(&CLUSTER_COUNT.to_le_bytes());
        bs[96..100].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        bs[100..104].copy_from_slice(&0xC0DE_CAFEu32.to_le_bytes());
        bs[104] = 0; // fs_version minor
        bs[105] = 1; // fs_version major
        bs[108] = 9; // sect_size_bits
        bs[109] = 0; // sect_per_clus_bits
        bs[110] = 1; // num_fats
        bs[111] = 0x80; // drv_sel
        bs[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
    }

    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        let off = fat_entry_off(cluster);
        self.image[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Mark `cluster` allocated in the stored bitmap.
    pub fn mark_bitmap(&mut self, cluster: u32) {
        let bit = (cluster - 2) as usize;
        self.image[cluster_off(BITMAP_CLUSTER) + bit / 8] |= 1 << (bit % 8);
    }

    /// Append raw dentries to the root directory, returning the device
    /// offset of the first one.
    pub fn push_root_entries(&mut self, bytes: &[u8]) -> usize {
        let offset = cluster_off(ROOT_CLUSTER) + self.root_entries * DENTRY_SIZE;
        assert!(
            self.root_entries * DENTRY_SIZE + bytes.len() <= CLUSTER_SIZE,
            "root cluster overflow; grow the root first"
        );
        self.image[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.root_entries += bytes.len() / DENTRY_SIZE;
        offset
    }

    /// Chain a second cluster behind the root so it can hold 32 entries.
    /// Entries pushed after the first 16 land in `extra`.
    pub fn grow_root(&mut self, extra: u32) {
        self.set_fat(ROOT_CLUSTER, extra);
        self.set_fat(extra, EOC);
        self.mark_bitmap(extra);
    }

    /// Append raw dentries at `entry_index` of the (grown) root, allowing
    /// sets that cross the cluster boundary.
    pub fn push_root_entries_spanning(&mut self, extra: u32, bytes: &[u8]) -> usize {
        let start = self.root_entries;
        let offset = |index: usize| {
            if index < CLUSTER_SIZE / DENTRY_SIZE {
                cluster_off(ROOT_CLUSTER) + index * DENTRY_SIZE
            } else {
                cluster_off(extra) + (index - CLUSTER_SIZE / DENTRY_SIZE) * DENTRY_SIZE
            }
        };
        for (i, entry) in bytes.chunks(DENTRY_SIZE).enumerate() {
            let off = offset(start + i);
            self.image[off..off + DENTRY_SIZE].copy_from_slice(entry);
        }
        self.root_entries += bytes.len() / DENTRY_SIZE;
        offset(start)
    }

    /// Build a dentry set for a file with the given chain. The FAT and the
    /// stored bitmap are updated to match; `size` is taken as given so
    /// tests can construct inconsistent files.
    pub fn file_dentry_set(
        &mut self,
        name: &str,
        attr: u16,
        chain: &[u32],
        size: u64,
        contiguous: bool,
    ) -> DentrySet {
        let mut dset = build_file_dentry_set(&self.upcase, name, attr).unwrap();
        let mut stream = dset.stream();
        stream.size = size;
        stream.valid_size = size;
        stream.start_clu = chain.first().copied().unwrap_or(0);
        if contiguous {
            stream.flags |= StreamFlags::NO_FAT_CHAIN.bits();
        }
        stream.emit(dset.entry_mut(DentrySet::ES_IDX_STREAM));
        dset.update_checksum();

        for (i, &cluster) in chain.iter().enumerate() {
            if !contiguous {
                let next = chain.get(i + 1).copied().unwrap_or(EOC);
                self.set_fat(cluster, next);
            }
            self.mark_bitmap(cluster);
        }
        dset
    }

    /// Add a file to the root directory, returning the device offset of
    /// its file dentry.
    pub fn add_root_file(
        &mut self,
        name: &str,
        attr: u16,
        chain: &[u32],
        size: u64,
        contiguous: bool,
    ) -> usize {
        let dset = self.file_dentry_set(name, attr, chain, size, contiguous);
        let bytes = dset.as_bytes().to_vec();
        self.push_root_entries(&bytes)
    }

    pub fn image_mut(&mut self) -> &mut Vec<u8> {
        &mut self.image
    }

    /// Compute the boot checksum, fill the checksum sector and mirror the
    /// main boot region into the backup slot.
    pub fn finish(mut self) -> Vec<u8> {
        let mut checksum = 0u32;
        for sector in 0..11 {
            let off = sector * SECTOR_SIZE;
            boot_calc_checksum(
                &self.image[off..off + SECTOR_SIZE],
                sector == 0,
                &mut checksum,
            );
        }
        for i in 0..SECTOR_SIZE / 4 {
            let off = 11 * SECTOR_SIZE + i * 4;
            self.image[off..off + 4].copy_from_slice(&checksum.to_le_bytes());
        }

        let (main, backup) = self.image.split_at_mut(12 * SECTOR_SIZE);
        backup[..12 * SECTOR_SIZE].copy_from_slice(main);

        self.image
    }
}

/// A `StreamDentry` view of the raw set bytes stored at `offset`.
pub fn stream_at(image: &[u8], set_offset: usize) -> StreamDentry {
    StreamDentry::parse(&image[set_offset + DENTRY_SIZE..set_offset + 2 * DENTRY_SIZE])
}
