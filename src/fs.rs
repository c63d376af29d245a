// SPDX-License-Identifier: MPL-2.0

use std::{collections::VecDeque, sync::Arc};

use crate::{
    bitmap::ClusterBitmap,
    constants::VOLUME_DIRTY,
    de_iter::DeIter,
    dev::BlockDev,
    error::Result,
    fat::{self, ClusterId, FatValue},
    inode::{ExfatInode, InodeArena, InodeId},
    super_block::{BootSector, SuperBlock, VOL_FLAGS_OFFSET},
    upcase_table::UpcaseTable,
};

/// Shared state for one volume under check.
pub struct Exfat {
    dev: Arc<dyn BlockDev>,
    sb: SuperBlock,
    /// Raw main boot sector, rewritten when the volume-dirty flag toggles.
    bs: Vec<u8>,

    /// What this checker thinks is allocated.
    pub alloc_bitmap: ClusterBitmap,
    /// Snapshot of the allocation bitmap stored on the volume.
    pub disk_bitmap: ClusterBitmap,
    pub disk_bitmap_clus: ClusterId,
    pub disk_bitmap_size: u64,

    pub upcase_table: UpcaseTable,
    pub volume_label: String,

    pub arena: InodeArena,
    pub root: Option<InodeId>,
    /// Directories pending traversal, oldest first.
    pub dir_list: VecDeque<InodeId>,

    /// Where the next free-cluster search starts.
    pub start_clu: Option<ClusterId>,
    zero_cluster: Vec<u8>,
}

impl Exfat {
    pub fn new(dev: Arc<dyn BlockDev>, bs_raw: Vec<u8>, bs: &BootSector) -> Self {
        let sb = SuperBlock::from(bs);
        let num_clusters = sb.num_clusters;
        let cluster_size = sb.cluster_size as usize;
        Exfat {
            dev,
            sb,
            bs: bs_raw,
            alloc_bitmap: ClusterBitmap::new(num_clusters),
            disk_bitmap: ClusterBitmap::new(num_clusters),
            disk_bitmap_clus: 0,
            disk_bitmap_size: 0,
            upcase_table: UpcaseTable::identity(),
            volume_label: String::new(),
            arena: InodeArena::new(),
            root: None,
            dir_list: VecDeque::new(),
            start_clu: None,
            zero_cluster: vec![0u8; cluster_size],
        }
    }

    pub fn dev(&self) -> &dyn BlockDev {
        self.dev.as_ref()
    }

    pub fn dev_arc(&self) -> Arc<dyn BlockDev> {
        self.dev.clone()
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn sector_size(&self) -> u32 {
        self.sb.sector_size
    }

    pub fn cluster_size(&self) -> u32 {
        self.sb.cluster_size
    }

    pub fn num_clusters(&self) -> u32 {
        self.sb.num_clusters
    }

    pub fn root_cluster(&self) -> ClusterId {
        self.sb.root_dir
    }

    pub fn c2o(&self, cluster: ClusterId) -> u64 {
        self.sb.c2o(cluster)
    }

    pub fn is_valid_cluster(&self, cluster: ClusterId) -> bool {
        self.sb.is_valid_cluster(cluster)
    }

    pub fn zero_cluster(&self) -> &[u8] {
        &self.zero_cluster
    }

    pub fn next_cluster(&self, cluster: ClusterId) -> Result<FatValue> {
        fat::next_cluster(self.dev(), &self.sb, cluster)
    }

    pub fn next_inode_cluster(&self, node: &ExfatInode, cluster: ClusterId) -> Result<FatValue> {
        fat::next_inode_cluster(self.dev(), &self.sb, node.is_contiguous, cluster)
    }

    pub fn set_fat(&self, cluster: ClusterId, value: FatValue) -> Result<()> {
        fat::set_fat(self.dev(), &self.sb, cluster, value)
    }

    /// A windowed iterator over the dentries of `dir`, or `None` for an
    /// empty directory.
    pub fn de_iter(&self, dir: &ExfatInode) -> Result<Option<DeIter>> {
        DeIter::new(self.dev_arc(), self.sb, dir)
    }

    /// Toggle bit 1 of the volume flags and persist the boot sector. The bit
    /// stays asserted while metadata mutations are in progress.
    pub fn mark_volume_dirty(&mut self, dirty: bool) -> Result<()> {
        let mut flags = u16::from_le_bytes([
            self.bs[VOL_FLAGS_OFFSET],
            self.bs[VOL_FLAGS_OFFSET + 1],
        ]);
        if dirty {
            flags |= VOLUME_DIRTY;
        } else {
            flags &= !VOLUME_DIRTY;
        }
        self.bs[VOL_FLAGS_OFFSET..VOL_FLAGS_OFFSET + 2].copy_from_slice(&flags.to_le_bytes());

        self.dev.write_at(&self.bs, 0)?;
        self.dev.fsync()
    }
}
