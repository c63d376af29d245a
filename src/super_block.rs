// SPDX-License-Identifier: MPL-2.0

use log::error;

use crate::{
    constants::*,
    dev::BlockDev,
    error::{FsckError, Result},
    fat::ClusterId,
    repair::{ProblemCode, Repair},
};

/// Size of the boot sector structure. The sector itself may be larger, the
/// trailing part holds only boot code padding.
pub const PBR_SIZE: usize = 512;

const OEM_NAME_RANGE: std::ops::Range<usize> = 3..11;
const MUST_BE_ZERO_RANGE: std::ops::Range<usize> = 11..64;
pub const VOL_FLAGS_OFFSET: usize = 106;
const PERCENT_IN_USE_OFFSET: usize = 112;

fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(raw[offset..offset + 2].try_into().unwrap())
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap())
}

/// The fields of the main (or backup) boot sector, decoded from the raw
/// little-endian layout.
#[derive(Clone, Copy, Debug)]
pub struct BootSector {
    pub oem_name: [u8; 8],
    pub partition_offset: u64,
    pub vol_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub clu_offset: u32,
    pub clu_count: u32,
    pub root_cluster: u32,
    pub vol_serial: u32,
    pub fs_version: [u8; 2],
    pub vol_flags: u16,
    pub sect_size_bits: u8,
    pub sect_per_clus_bits: u8,
    pub num_fats: u8,
    pub drv_sel: u8,
    pub percent_in_use: u8,
    pub signature: u16,
}

impl BootSector {
    pub fn parse(raw: &[u8]) -> Self {
        let mut oem_name = [0u8; 8];
        oem_name.copy_from_slice(&raw[OEM_NAME_RANGE]);
        BootSector {
            oem_name,
            partition_offset: read_u64(raw, 64),
            vol_length: read_u64(raw, 72),
            fat_offset: read_u32(raw, 80),
            fat_length: read_u32(raw, 84),
            clu_offset: read_u32(raw, 88),
            clu_count: read_u32(raw, 92),
            root_cluster: read_u32(raw, 96),
            vol_serial: read_u32(raw, 100),
            fs_version: [raw[104], raw[105]],
            vol_flags: read_u16(raw, VOL_FLAGS_OFFSET),
            sect_size_bits: raw[108],
            sect_per_clus_bits: raw[109],
            num_fats: raw[110],
            drv_sel: raw[111],
            percent_in_use: raw[PERCENT_IN_USE_OFFSET],
            signature: read_u16(raw, 510),
        }
    }

    pub fn sector_size(&self) -> u32 {
        1 << self.sect_size_bits
    }

    pub fn cluster_size(&self) -> u32 {
        1 << (self.sect_size_bits as u32 + self.sect_per_clus_bits as u32)
    }
}

/// The in-memory superblock info derived from a validated boot sector.
#[derive(Clone, Copy, Debug, Default)]
pub struct SuperBlock {
    /// num of sectors in volume
    pub num_sectors: u64,
    /// num of clusters in the cluster heap
    pub num_clusters: u32,
    /// sector size in bytes
    pub sector_size: u32,
    pub sector_size_bits: u32,
    /// cluster size in bytes
    pub cluster_size: u32,
    pub cluster_size_bits: u32,
    pub sect_per_cluster_bits: u32,
    /// FAT start sector
    pub fat_start_sector: u64,
    /// number of FAT sectors
    pub num_fat_sectors: u32,
    /// data area start sector
    pub data_start_sector: u64,
    /// root dir cluster
    pub root_dir: ClusterId,
    /// volume flags
    pub vol_flags: u16,
}

impl From<&BootSector> for SuperBlock {
    fn from(sector: &BootSector) -> SuperBlock {
        SuperBlock {
            num_sectors: sector.vol_length,
            num_clusters: sector.clu_count,
            sector_size: sector.sector_size(),
            sector_size_bits: sector.sect_size_bits as u32,
            cluster_size: sector.cluster_size(),
            cluster_size_bits: sector.sect_size_bits as u32 + sector.sect_per_clus_bits as u32,
            sect_per_cluster_bits: sector.sect_per_clus_bits as u32,
            fat_start_sector: sector.fat_offset as u64,
            num_fat_sectors: sector.fat_length,
            data_start_sector: sector.clu_offset as u64,
            root_dir: sector.root_cluster,
            vol_flags: sector.vol_flags,
        }
    }
}

impl SuperBlock {
    /// Byte offset of a sector.
    pub fn s2o(&self, sector: u64) -> u64 {
        sector << self.sector_size_bits
    }

    /// Byte offset of a cluster in the cluster heap.
    pub fn c2o(&self, cluster: ClusterId) -> u64 {
        self.s2o(self.data_start_sector)
            + (((cluster - EXFAT_FIRST_CLUSTER) as u64) << self.cluster_size_bits)
    }

    pub fn is_valid_cluster(&self, cluster: ClusterId) -> bool {
        cluster >= EXFAT_FIRST_CLUSTER
            && (cluster - EXFAT_FIRST_CLUSTER) < self.num_clusters
    }

    /// Size of the cluster heap in bytes.
    pub fn heap_size(&self) -> u64 {
        self.num_clusters as u64 * self.cluster_size as u64
    }
}

/// Accumulate the boot region checksum over one sector. The `vol_flags` and
/// `percent_in_use` fields of the boot sector itself are excluded so that
/// runtime flag updates do not invalidate the region.
pub fn boot_calc_checksum(sector: &[u8], is_boot_sec: bool, checksum: &mut u32) {
    for (index, &value) in sector.iter().enumerate() {
        if is_boot_sec
            && (index == VOL_FLAGS_OFFSET
                || index == VOL_FLAGS_OFFSET + 1
                || index == PERCENT_IN_USE_OFFSET)
        {
            continue;
        }
        *checksum = checksum.rotate_right(1).wrapping_add(value as u32);
    }
}

fn boot_region_checksum(dev: &dyn BlockDev, bs_sector: u64) -> Result<()> {
    let size = dev.sector_size() as usize;
    let mut sect = vec![0u8; size];

    let mut checksum = 0u32;
    for i in 0..11 {
        dev.read_at(&mut sect, (bs_sector + i) * size as u64)?;
        boot_calc_checksum(&sect, i == 0, &mut checksum);
    }

    dev.read_at(&mut sect, (bs_sector + 11) * size as u64)?;
    for chunk in sect.chunks_exact(4) {
        let stored = u32::from_le_bytes(chunk.try_into().unwrap());
        if stored != checksum {
            return Err(FsckError::InvalidFormat(format!(
                "checksum of boot region is not correct. {:#x}, but expected {:#x}",
                stored, checksum
            )));
        }
    }
    Ok(())
}

/// Read and validate one copy of the boot region. Returns the raw boot
/// sector together with the decoded fields.
pub fn read_boot_region(dev: &dyn BlockDev, bs_sector: u64) -> Result<(Vec<u8>, BootSector)> {
    let mut raw = vec![0u8; PBR_SIZE];
    dev.read_at(&mut raw, bs_sector * dev.sector_size() as u64)?;

    let bs = BootSector::parse(&raw);

    if &bs.oem_name != STR_EXFAT.as_bytes() {
        return Err(FsckError::InvalidFormat(
            "failed to find exfat file system".to_string(),
        ));
    }
    if raw[MUST_BE_ZERO_RANGE].iter().any(|&x| x != 0) {
        return Err(FsckError::InvalidFormat(
            "must_be_zero field must be filled with zero".to_string(),
        ));
    }
    if bs.signature != BOOT_SIGNATURE {
        return Err(FsckError::InvalidFormat(
            "invalid boot record signature".to_string(),
        ));
    }

    boot_region_checksum(dev, bs_sector)?;

    if bs.sect_size_bits < EXFAT_MIN_SECT_SIZE_BITS || bs.sect_size_bits > EXFAT_MAX_SECT_SIZE_BITS
    {
        return Err(FsckError::InvalidFormat(format!(
            "too small or big sector size: {}",
            bs.sector_size()
        )));
    }
    if bs.cluster_size() > 32 * 1024 * 1024 {
        return Err(FsckError::InvalidFormat(format!(
            "too big cluster size: {}",
            bs.cluster_size()
        )));
    }
    if bs.fs_version[1] != 1 || bs.fs_version[0] != 0 {
        return Err(FsckError::InvalidFormat(format!(
            "unsupported exfat version: {}.{}",
            bs.fs_version[1], bs.fs_version[0]
        )));
    }
    if bs.num_fats != 1 {
        return Err(FsckError::InvalidFormat(format!(
            "unsupported FAT count: {}",
            bs.num_fats
        )));
    }
    if bs.vol_length * bs.sector_size() as u64 > dev.size() {
        return Err(FsckError::InvalidFormat(format!(
            "too large sector count: {}",
            bs.vol_length
        )));
    }
    if bs.clu_count as u64 * bs.cluster_size() as u64 > dev.size() {
        return Err(FsckError::InvalidFormat(format!(
            "too large cluster count: {}",
            bs.clu_count
        )));
    }

    Ok((raw, bs))
}

/// Rewrite the main boot region from the backup copy, marking
/// `percent_in_use` unknown.
fn restore_boot_region(dev: &dyn BlockDev) -> Result<()> {
    let size = dev.sector_size() as usize;
    let mut sector = vec![0u8; size];

    for i in 0..12u64 {
        dev.read_at(&mut sector, (BACKUP_BOOT_SEC_IDX + i) * size as u64)?;
        if i == 0 {
            sector[PERCENT_IN_USE_OFFSET] = 0xFF;
        }
        dev.write_at(&sector, (BOOT_SEC_IDX + i) * size as u64)?;
    }

    dev.fsync()
}

/// Validate the main boot region; on corruption, offer to restore it from
/// the backup region.
pub fn boot_region_check(
    dev: &dyn BlockDev,
    repair: &mut Repair,
) -> Result<(Vec<u8>, BootSector)> {
    match read_boot_region(dev, BOOT_SEC_IDX) {
        Ok(region) => Ok(region),
        Err(err) if err.is_corruption() => {
            if !repair.ask(
                ProblemCode::BsBootRegion,
                "boot region is corrupted. try to restore the region from backup",
            ) {
                return Err(err);
            }
            let (mut raw, mut bs) = read_boot_region(dev, BACKUP_BOOT_SEC_IDX).map_err(|e| {
                error!("backup boot region is also corrupted");
                e
            })?;
            restore_boot_region(dev)?;
            raw[PERCENT_IN_USE_OFFSET] = 0xFF;
            bs.percent_in_use = 0xFF;
            Ok((raw, bs))
        }
        Err(err) => Err(err),
    }
}
