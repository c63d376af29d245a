// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use log::{debug, error, info};

use crate::{
    bitmap::ClusterBitmap,
    constants::{
        EXFAT_FIRST_CLUSTER, EXFAT_RESERVED_CLUSTERS, EXFAT_UPCASE_TABLE_CHARS,
        VOLUME_LABEL_MAX_LEN,
    },
    de_iter::DeIter,
    dentry::{
        is_deleted, BitmapDentry, DentrySet, FileDentry, NameDentry, StreamDentry, StreamFlags,
        UpcaseDentry, VolumeDentry, DENTRY_SIZE, EXFAT_BITMAP, EXFAT_FILE, EXFAT_NAME,
        EXFAT_STREAM, EXFAT_UNUSED, EXFAT_UPCASE, EXFAT_VOLUME,
    },
    dev::BlockDev,
    error::{FsckError, Result},
    fat::{ClusterId, FatValue, FAT_ENTRY_SIZE},
    fs::Exfat,
    inode::{resolve_path, resolve_path_parent, ExfatInode, FatAttr, InodeId},
    lookup::{lookup_dentry_set, Lookup},
    repair::{ProblemCode, Repair, RepairMode},
    super_block::boot_region_check,
    upcase_table::UpcaseTable,
    utils::{bytes_to_human_readable, calc_checksum_16, calc_checksum_32},
};

pub const FSCK_EXIT_NO_ERRORS: i32 = 0x00;
pub const FSCK_EXIT_CORRECTED: i32 = 0x01;
pub const FSCK_EXIT_NEED_REBOOT: i32 = 0x02;
pub const FSCK_EXIT_ERRORS_LEFT: i32 = 0x04;
pub const FSCK_EXIT_OPERATION_ERROR: i32 = 0x08;
pub const FSCK_EXIT_SYNTAX_ERROR: i32 = 0x10;
pub const FSCK_EXIT_USER_CANCEL: i32 = 0x20;
pub const FSCK_EXIT_LIBRARY_ERROR: i32 = 0x80;

#[derive(Debug, Default, Clone, Copy)]
pub struct FsckStats {
    pub dir_count: u64,
    pub file_count: u64,
    pub error_count: u64,
    pub fixed_count: u64,
}

/// One checking run over one volume.
pub struct Fsck {
    pub exfat: Exfat,
    pub repair: Repair,
    pub stats: FsckStats,
}

impl Fsck {
    pub fn new(exfat: Exfat, repair: Repair) -> Self {
        Fsck {
            exfat,
            repair,
            stats: FsckStats::default(),
        }
    }

    fn fsck_err(&self, parent: InodeId, node: &ExfatInode, message: &str) {
        error!(
            "ERROR: {}: {}",
            resolve_path_parent(&self.exfat.arena, parent, node),
            message
        );
    }

    fn repair_file_ask(
        &mut self,
        parent: InodeId,
        node: &ExfatInode,
        code: ProblemCode,
        message: &str,
    ) -> bool {
        let description = format!(
            "ERROR: {}: {}",
            resolve_path_parent(&self.exfat.arena, parent, node),
            message
        );
        self.repair.ask(code, &description)
    }

    /// Rewrite the stream dentry of the current set so that the file ends
    /// after `count` clusters, the last kept one being `prev`.
    fn truncate_file(
        &mut self,
        iter: &mut DeIter,
        node: &mut ExfatInode,
        count: u64,
        prev: Option<ClusterId>,
    ) -> Result<bool> {
        let cluster_size = self.exfat.cluster_size() as u64;
        let prev_valid = prev.is_some_and(|cluster| self.exfat.is_valid_cluster(cluster));

        node.size = count * cluster_size;
        if !prev_valid {
            node.first_clus = 0;
        }

        let raw = iter.get_dirty(DentrySet::ES_IDX_STREAM)?;
        let mut stream = StreamDentry::parse(raw);
        if node.size < stream.valid_size {
            stream.valid_size = node.size;
        }
        if !prev_valid {
            stream.start_clu = 0;
        }
        stream.size = node.size;
        stream.emit(raw);

        // The clusters cut off stay out of the allocation bitmap and are
        // freed when the FAT is reconciled with it.
        if !node.is_contiguous && prev_valid {
            if let Some(prev) = prev {
                self.exfat.set_fat(prev, FatValue::EndOfChain)?;
            }
        }
        Ok(true)
    }

    /// Walk the cluster chain of `node`, marking every visited cluster
    /// allocated and offering to truncate the file on any inconsistency.
    fn check_clus_chain(
        &mut self,
        iter: &mut DeIter,
        parent: InodeId,
        node: &mut ExfatInode,
    ) -> Result<bool> {
        let cluster_size = self.exfat.cluster_size() as u64;
        let max_count = node.size.div_ceil(cluster_size);
        let mut count = 0u64;
        let mut prev: Option<ClusterId> = None;

        if node.size == 0 && node.first_clus == 0 {
            return Ok(false);
        }

        /* the first cluster is wrong */
        if (node.size == 0 && node.first_clus != 0)
            || (node.size > 0 && !self.exfat.is_valid_cluster(node.first_clus))
        {
            if self.repair_file_ask(parent, node, ProblemCode::FileFirstClus, "first cluster is wrong")
            {
                return self.truncate_file(iter, node, count, prev);
            }
            return Err(FsckError::Corrupt("first cluster is wrong".to_string()));
        }

        let mut clus = FatValue::Next(node.first_clus);
        while let FatValue::Next(cluster) = clus {
            if count >= max_count {
                if node.is_contiguous {
                    break;
                }
                if self.repair_file_ask(
                    parent,
                    node,
                    ProblemCode::FileSmallerSize,
                    &format!(
                        "more clusters are allocated. truncate to {} bytes",
                        count * cluster_size
                    ),
                ) {
                    return self.truncate_file(iter, node, count, prev);
                }
                return Err(FsckError::Corrupt("more clusters are allocated".to_string()));
            }

            /*
             * This cluster is already allocated. it may be shared with
             * the other file, or there is a loop in cluster chain.
             */
            if self.exfat.alloc_bitmap.get(cluster) {
                if self.repair_file_ask(
                    parent,
                    node,
                    ProblemCode::FileDuplicatedClus,
                    &format!(
                        "cluster is already allocated for the other file. truncated to {} bytes",
                        count * cluster_size
                    ),
                ) {
                    return self.truncate_file(iter, node, count, prev);
                }
                return Err(FsckError::Corrupt("cluster is already allocated".to_string()));
            }

            if !self.exfat.disk_bitmap.get(cluster) {
                if self.repair_file_ask(
                    parent,
                    node,
                    ProblemCode::FileInvalidClus,
                    &format!(
                        "cluster is marked as free. truncate to {} bytes",
                        count * cluster_size
                    ),
                ) {
                    return self.truncate_file(iter, node, count, prev);
                }
                return Err(FsckError::Corrupt("cluster is marked as free".to_string()));
            }

            let next = match self.exfat.next_inode_cluster(node, cluster) {
                Ok(next) => next,
                Err(_) => return self.truncate_file(iter, node, count, prev),
            };
            if !node.is_contiguous {
                let broken = match next {
                    FatValue::Next(next_clus) => !self.exfat.is_valid_cluster(next_clus),
                    FatValue::EndOfChain => false,
                    _ => true,
                };
                if broken {
                    if self.repair_file_ask(
                        parent,
                        node,
                        ProblemCode::FileInvalidClus,
                        &format!(
                            "broken cluster chain. truncate to {} bytes",
                            count * cluster_size
                        ),
                    ) {
                        return self.truncate_file(iter, node, count, prev);
                    }
                    return Err(FsckError::Corrupt("broken cluster chain".to_string()));
                }
            }

            count += 1;
            self.exfat.alloc_bitmap.set(cluster);
            prev = Some(cluster);
            clus = next;
        }

        if count < max_count {
            if self.repair_file_ask(
                parent,
                node,
                ProblemCode::FileLargerSize,
                &format!(
                    "less clusters are allocated. truncates to {} bytes",
                    count * cluster_size
                ),
            ) {
                return self.truncate_file(iter, node, count, prev);
            }
            return Err(FsckError::Corrupt("less clusters are allocated".to_string()));
        }

        Ok(false)
    }

    fn file_calc_checksum(&mut self, iter: &mut DeIter, num_ext: u8) -> Result<u16> {
        let file_raw = iter
            .get_raw(0)?
            .ok_or_else(|| FsckError::Corrupt("failed to get file dentry".to_string()))?;
        let mut checksum = calc_checksum_16(&file_raw, 2..4, 0);
        for i in 1..=num_ext as usize {
            let raw = iter
                .get_raw(i)?
                .ok_or_else(|| FsckError::Corrupt("dentry set runs past the directory".to_string()))?;
            checksum = calc_checksum_16(&raw, 0..0, checksum);
        }
        Ok(checksum)
    }

    /// Per-file invariants beyond the chain walk. Returns whether something
    /// was repaired; unrepaired findings fail the file.
    fn check_inode(
        &mut self,
        iter: &mut DeIter,
        parent: InodeId,
        node: &mut ExfatInode,
    ) -> Result<bool> {
        let mut fixed = self.check_clus_chain(iter, parent, node)?;
        let mut valid = true;
        let cluster_size = self.exfat.cluster_size() as u64;

        if node.size > self.exfat.super_block().heap_size() {
            self.fsck_err(
                parent,
                node,
                &format!("size {} is greater than cluster heap", node.size),
            );
            valid = false;
        }

        if node.size == 0 && node.is_contiguous {
            if self.repair_file_ask(
                parent,
                node,
                ProblemCode::FileZeroNoFat,
                "empty, but has no Fat chain",
            ) {
                let raw = iter.get_dirty(DentrySet::ES_IDX_STREAM)?;
                let mut stream = StreamDentry::parse(raw);
                stream.flags &= !StreamFlags::NO_FAT_CHAIN.bits();
                stream.emit(raw);
                fixed = true;
            } else {
                valid = false;
            }
        }

        if node.is_dir() && node.size % cluster_size != 0 {
            self.fsck_err(
                parent,
                node,
                &format!(
                    "directory size {} is not divisible by {}",
                    node.size, cluster_size
                ),
            );
            valid = false;
        }

        let file_raw = iter
            .get_raw(0)?
            .ok_or_else(|| FsckError::Corrupt("failed to get file dentry".to_string()))?;
        let file = FileDentry::parse(&file_raw);
        let checksum = self.file_calc_checksum(iter, file.num_ext)?;
        if checksum != file.checksum {
            if self.repair_file_ask(
                parent,
                node,
                ProblemCode::DeChecksum,
                "the checksum of a file is wrong",
            ) {
                let raw = iter.get_dirty(0)?;
                let mut file = FileDentry::parse(raw);
                file.checksum = checksum;
                file.emit(raw);
                fixed = true;
            } else {
                valid = false;
            }
        }

        if valid {
            Ok(fixed)
        } else {
            Err(FsckError::Corrupt("the file has uncorrected errors".to_string()))
        }
    }

    /// Read the file, stream and name dentries at the window start into a
    /// fresh inode. Returns the inode and the entry count of the set.
    fn read_file_dentries(
        &mut self,
        iter: &mut DeIter,
        parent: InodeId,
    ) -> Result<(ExfatInode, usize)> {
        let file_raw = match iter.get_raw(0)? {
            Some(raw) if raw[0] == EXFAT_FILE => raw,
            _ => {
                error!("failed to get file dentry");
                return Err(FsckError::Corrupt("failed to get file dentry".to_string()));
            }
        };
        let file = FileDentry::parse(&file_raw);

        let stream_raw = match iter.get_raw(1)? {
            Some(raw) if raw[0] == EXFAT_STREAM => raw,
            _ => {
                error!("failed to get stream dentry");
                return Err(FsckError::Corrupt("failed to get stream dentry".to_string()));
            }
        };
        let stream = StreamDentry::parse(&stream_raw);

        if file.num_ext < 2 {
            error!("too few secondary count. {}", file.num_ext);
            return Err(FsckError::Corrupt("too few secondary count".to_string()));
        }

        let mut node = ExfatInode::new(FatAttr::from_bits_truncate(file.attr));
        for i in 2..=file.num_ext as usize {
            let name_raw = match iter.get_raw(i) {
                Ok(Some(raw)) if raw[0] == EXFAT_NAME => raw,
                Ok(_) | Err(FsckError::OutOfRange) => {
                    error!("failed to get name dentry");
                    return Err(FsckError::Corrupt("failed to get name dentry".to_string()));
                }
                Err(err) => return Err(err),
            };
            node.name.extend(NameDentry::parse(&name_raw).unicode_0_14);
        }
        if let Some(pos) = node.name.iter().position(|&unit| unit == 0) {
            node.name.truncate(pos);
        }

        node.first_clus = stream.start_clu;
        node.is_contiguous = stream.is_contiguous();
        node.size = stream.size;

        if node.size < stream.valid_size {
            if self.repair_file_ask(
                parent,
                &node,
                ProblemCode::FileValidSize,
                &format!(
                    "valid size {} greater than size {}",
                    stream.valid_size, node.size
                ),
            ) {
                let raw = iter.get_dirty(DentrySet::ES_IDX_STREAM)?;
                let mut stream = StreamDentry::parse(raw);
                stream.valid_size = stream.size;
                stream.emit(raw);
            } else {
                return Err(FsckError::Corrupt(
                    "valid size greater than size".to_string(),
                ));
            }
        }

        Ok((node, file.num_ext as usize + 1))
    }

    /// Returns the checked inode, how many dentries its set spans and
    /// whether anything was repaired.
    fn read_file(&mut self, iter: &mut DeIter, parent: InodeId) -> Result<(ExfatInode, usize, bool)> {
        let (mut node, dentry_count) = self.read_file_dentries(iter, parent)?;
        let fixed = self.check_inode(iter, parent, &mut node)?;

        if node.is_dir() {
            self.stats.dir_count += 1;
        } else {
            self.stats.file_count += 1;
        }
        Ok((node, dentry_count, fixed))
    }

    fn read_volume_label(&mut self, iter: &mut DeIter) -> Result<bool> {
        let Some(raw) = iter.get_raw(0)? else {
            return Ok(false);
        };
        let dentry = VolumeDentry::parse(&raw);

        if dentry.char_cnt == 0 {
            return Ok(true);
        }
        if dentry.char_cnt as usize > VOLUME_LABEL_MAX_LEN {
            error!("too long label. {}", dentry.char_cnt);
            return Ok(false);
        }

        match String::from_utf16(&dentry.label[..dentry.char_cnt as usize]) {
            Ok(label) => {
                info!("volume label [{}]", label);
                self.exfat.volume_label = label;
                Ok(true)
            }
            Err(_) => {
                error!("failed to decode volume label");
                Ok(false)
            }
        }
    }

    fn scan_dir(&mut self, iter: &mut DeIter, dir_id: InodeId) -> Result<()> {
        loop {
            let Some(raw) = iter.get_raw(0)? else {
                break;
            };

            let mut dentry_count = 1;
            match raw[0] {
                EXFAT_FILE => match self.read_file(iter, dir_id) {
                    Ok((node, count, fixed)) => {
                        dentry_count = count;
                        if fixed {
                            self.stats.error_count += 1;
                            self.stats.fixed_count += 1;
                        }
                        if node.is_dir() && node.size > 0 {
                            self.queue_directory(iter, dir_id, node, count)?;
                        }
                    }
                    Err(_) => {
                        self.stats.error_count += 1;
                    }
                },
                EXFAT_VOLUME => {
                    if !self.read_volume_label(iter)? {
                        error!("failed to verify volume label");
                        return Err(FsckError::Corrupt(
                            "failed to verify volume label".to_string(),
                        ));
                    }
                }
                EXFAT_BITMAP | EXFAT_UPCASE => {}
                EXFAT_UNUSED => break,
                t if is_deleted(t) => {}
                t => {
                    error!("unknown entry type. {:#x}", t);
                }
            }

            iter.advance(dentry_count)?;
        }
        Ok(())
    }

    /// Remember a subdirectory for traversal, with a copy of its (possibly
    /// just repaired) dentry set so its own chain can be grown later.
    fn queue_directory(
        &mut self,
        iter: &mut DeIter,
        parent: InodeId,
        mut node: ExfatInode,
        dentry_count: usize,
    ) -> Result<()> {
        let mut bytes = Vec::with_capacity(dentry_count * DENTRY_SIZE);
        for i in 0..dentry_count {
            let raw = iter
                .get_raw(i)?
                .ok_or_else(|| FsckError::Corrupt("dentry set runs past the directory".to_string()))?;
            bytes.extend_from_slice(&raw);
        }
        node.dentry_set = Some(DentrySet::from_bytes(bytes)?);
        node.dev_offset = Some(iter.device_offset()?);

        let id = self.exfat.arena.insert(node, Some(parent));
        self.exfat.dir_list.push_back(id);
        Ok(())
    }

    /// Check every dentry set of one directory.
    fn read_children(&mut self, dir_id: InodeId) -> Result<()> {
        let dir = self.exfat.arena.get(dir_id);
        let Some(mut iter) = self.exfat.de_iter(dir)? else {
            return Ok(());
        };

        match self.scan_dir(&mut iter, dir_id) {
            Ok(()) => {
                iter.flush()?;
                Ok(())
            }
            Err(err) => {
                // Abort the subtree: the children queued so far are dropped.
                let children = std::mem::take(&mut self.exfat.arena.get_mut(dir_id).children);
                for child in children {
                    self.exfat.dir_list.retain(|&pending| pending != child);
                }
                iter.flush()?;
                Err(err)
            }
        }
    }

    /// Walk the root chain counting clusters. The root never uses the
    /// contiguous fast path; every cluster is marked allocated on the way,
    /// which doubles as loop detection.
    fn root_get_clus_count(&mut self, root: &ExfatInode) -> Result<u32> {
        let mut cluster = root.first_clus;
        let mut count = 0u32;

        loop {
            if !self.exfat.is_valid_cluster(cluster) {
                error!("/: bad cluster. {:#x}", cluster);
                return Err(FsckError::InvalidChain(format!(
                    "bad cluster {:#x} in the root chain",
                    cluster
                )));
            }
            if self.exfat.alloc_bitmap.get(cluster) {
                error!("/: cluster is already allocated, or there is a loop in cluster chain");
                return Err(FsckError::InvalidChain(
                    "loop in the root cluster chain".to_string(),
                ));
            }
            self.exfat.alloc_bitmap.set(cluster);
            count += 1;

            match self.exfat.next_inode_cluster(root, cluster) {
                Ok(FatValue::Next(next)) => cluster = next,
                Ok(FatValue::EndOfChain) => break,
                Ok(_) | Err(_) => {
                    error!("/: broken cluster chain");
                    return Err(FsckError::InvalidChain(
                        "broken root cluster chain".to_string(),
                    ));
                }
            }
        }
        Ok(count)
    }

    /// Locate the allocation bitmap from the root directory and read the
    /// stored copy.
    fn read_bitmap(&mut self) -> Result<()> {
        let root_id = self
            .exfat
            .root
            .ok_or_else(|| FsckError::Corrupt("root is missing".to_string()))?;

        let lookup = lookup_dentry_set(
            &self.exfat,
            self.exfat.arena.get(root_id),
            EXFAT_BITMAP,
            None,
        )?;
        let Lookup::Found { dentry_set, .. } = lookup else {
            return Err(FsckError::InvalidFormat(
                "no allocation bitmap found in the root directory".to_string(),
            ));
        };

        let dentry = BitmapDentry::parse(dentry_set.entry(0));
        debug!(
            "allocation bitmap: start cluster {:#x}, size {:#x}",
            dentry.start_clu, dentry.size
        );

        let num_clusters = self.exfat.num_clusters();
        let bitmap_size = (num_clusters as u64).div_ceil(8);
        if dentry.size < bitmap_size {
            error!("invalid size of allocation bitmap. {:#x}", dentry.size);
            return Err(FsckError::InvalidFormat(
                "invalid size of the allocation bitmap".to_string(),
            ));
        }
        if !self.exfat.is_valid_cluster(dentry.start_clu) {
            error!("invalid start cluster of allocate bitmap. {:#x}", dentry.start_clu);
            return Err(FsckError::InvalidFormat(
                "invalid start cluster of the allocation bitmap".to_string(),
            ));
        }

        self.exfat.disk_bitmap_clus = dentry.start_clu;
        self.exfat.disk_bitmap_size = bitmap_size;

        let cluster_size = self.exfat.cluster_size() as u64;
        self.exfat.alloc_bitmap.set_range(
            dentry.start_clu,
            bitmap_size.div_ceil(cluster_size) as u32,
        );

        let mut buf = vec![0u8; bitmap_size as usize];
        self.exfat
            .dev()
            .read_at(&mut buf, self.exfat.c2o(dentry.start_clu))?;
        self.exfat.disk_bitmap = ClusterBitmap::from_bytes(&buf, num_clusters);
        Ok(())
    }

    /// Locate, verify and decompress the upcase table from the root
    /// directory.
    fn read_upcase_table(&mut self) -> Result<()> {
        let root_id = self
            .exfat
            .root
            .ok_or_else(|| FsckError::Corrupt("root is missing".to_string()))?;

        let lookup = lookup_dentry_set(
            &self.exfat,
            self.exfat.arena.get(root_id),
            EXFAT_UPCASE,
            None,
        )?;
        let Lookup::Found { dentry_set, .. } = lookup else {
            return Err(FsckError::InvalidFormat(
                "no upcase table found in the root directory".to_string(),
            ));
        };

        let dentry = UpcaseDentry::parse(dentry_set.entry(0));
        if !self.exfat.is_valid_cluster(dentry.start_clu) {
            error!("invalid start cluster of upcase table. {:#x}", dentry.start_clu);
            return Err(FsckError::InvalidFormat(
                "invalid start cluster of the upcase table".to_string(),
            ));
        }
        if dentry.size == 0
            || dentry.size % 2 != 0
            || dentry.size > (EXFAT_UPCASE_TABLE_CHARS * 2) as u64
        {
            error!("invalid size of upcase table. {:#x}", dentry.size);
            return Err(FsckError::InvalidFormat(
                "invalid size of the upcase table".to_string(),
            ));
        }

        let mut buf = vec![0u8; dentry.size as usize];
        self.exfat
            .dev()
            .read_at(&mut buf, self.exfat.c2o(dentry.start_clu))?;

        let checksum = calc_checksum_32(&buf, 0..0, 0);
        if checksum != dentry.checksum {
            error!(
                "corrupted upcase table {:#x} (expected: {:#x})",
                checksum, dentry.checksum
            );
            return Err(FsckError::InvalidFormat(
                "corrupted upcase table".to_string(),
            ));
        }

        let cluster_size = self.exfat.cluster_size() as u64;
        self.exfat
            .alloc_bitmap
            .set_range(dentry.start_clu, dentry.size.div_ceil(cluster_size) as u32);

        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.exfat.upcase_table = UpcaseTable::decompress(&units);
        Ok(())
    }

    /// Validate the root chain and load the bitmap and upcase table the
    /// root directory points at.
    pub fn root_dir_check(&mut self) -> Result<()> {
        let mut root = ExfatInode::new(FatAttr::DIRECTORY);
        root.first_clus = self.exfat.root_cluster();

        let clus_count = self.root_get_clus_count(&root).map_err(|err| {
            error!("failed to follow the cluster chain of root");
            err
        })?;
        root.size = clus_count as u64 * self.exfat.cluster_size() as u64;

        debug!(
            "root directory: start cluster[{:#x}] size[{:#x}]",
            root.first_clus, root.size
        );

        let root_id = self.exfat.arena.insert(root, None);
        self.exfat.root = Some(root_id);
        self.stats.dir_count += 1;

        self.read_bitmap().map_err(|err| {
            error!("failed to read bitmap");
            err
        })?;
        self.read_upcase_table().map_err(|err| {
            error!("failed to read upcase table");
            err
        })?;
        Ok(())
    }

    /// Breadth-first traversal over every directory discovered, followed by
    /// the reclamation pass if any repair touched the FAT.
    pub fn filesystem_check(&mut self) -> Result<()> {
        let Some(root_id) = self.exfat.root else {
            error!("root is NULL");
            return Err(FsckError::Corrupt("root is missing".to_string()));
        };
        self.exfat.dir_list.push_back(root_id);

        let mut result = Ok(());
        while let Some(dir_id) = self.exfat.dir_list.pop_front() {
            if !self.exfat.arena.get(dir_id).is_dir() {
                error!(
                    "ERROR: {}: failed to travel directories. the node is not directory",
                    resolve_path(&self.exfat.arena, dir_id)
                );
                result = Err(FsckError::Corrupt(
                    "a non-directory node in the directory list".to_string(),
                ));
                break;
            }

            if let Err(err) = self.read_children(dir_id) {
                debug!(
                    "failed to check dentries: {}",
                    resolve_path(&self.exfat.arena, dir_id)
                );
                result = Err(err);
            }

            self.exfat.arena.release_ancestors(dir_id);
        }

        self.exfat.root = None;
        if self.repair.dirty_fat {
            self.reclaim_free_clusters()?;
        }
        result
    }

    /// Free every FAT entry whose cluster the traversal did not claim.
    fn write_dirty_fat(&self) -> Result<()> {
        let read_size = self.exfat.cluster_size() as usize;
        let write_size = self.exfat.sector_size() as usize;
        let sb = *self.exfat.super_block();
        let last_clus = (sb.num_clusters + EXFAT_RESERVED_CLUSTERS) as u64;

        let mut buffers = [vec![0u8; read_size], vec![0u8; read_size]];
        let mut dirty = [
            vec![false; read_size / write_size],
            vec![false; read_size / write_size],
        ];
        let mut idx = 0usize;
        let mut clus = 0u64;
        let mut offset = sb.s2o(sb.fat_start_sector);

        while clus < last_clus {
            let clus_count = ((read_size / FAT_ENTRY_SIZE) as u64).min(last_clus - clus);
            let len = clus_count as usize * FAT_ENTRY_SIZE;
            self.exfat.dev().read_at(&mut buffers[idx][..len], offset)?;

            let begin = if clus == 0 {
                EXFAT_FIRST_CLUSTER as u64
            } else {
                clus
            };
            for i in begin..clus + clus_count {
                let pos = (i - clus) as usize * FAT_ENTRY_SIZE;
                let entry =
                    u32::from_le_bytes(buffers[idx][pos..pos + FAT_ENTRY_SIZE].try_into().unwrap());
                if !self.exfat.alloc_bitmap.get(i as ClusterId)
                    && FatValue::from(entry) != FatValue::Free
                {
                    buffers[idx][pos..pos + FAT_ENTRY_SIZE]
                        .copy_from_slice(&ClusterId::from(FatValue::Free).to_le_bytes());
                    dirty[idx][pos / write_size] = true;
                }
            }

            for sector in 0..len.div_ceil(write_size) {
                if dirty[idx][sector] {
                    let start = sector * write_size;
                    let end = (start + write_size).min(len);
                    self.exfat
                        .dev()
                        .write_at(&buffers[idx][start..end], offset + start as u64)?;
                    dirty[idx][sector] = false;
                }
            }

            idx ^= 0x01;
            clus += clus_count;
            offset += len as u64;
        }
        Ok(())
    }

    /// Write the in-memory allocation bitmap over every stored sector that
    /// differs from it.
    fn write_dirty_bitmap(&self) -> Result<()> {
        let read_size = self.exfat.cluster_size() as usize;
        let write_size = self.exfat.sector_size() as usize;

        let mut offset = self.exfat.c2o(self.exfat.disk_bitmap_clus);
        let last_offset = offset + self.exfat.disk_bitmap_size;
        let mut bitmap_offset = 0usize;
        let alloc_bytes = self.exfat.alloc_bitmap.as_bytes();

        let mut buffers = [vec![0u8; read_size], vec![0u8; read_size]];
        let mut idx = 0usize;

        while offset < last_offset {
            let len = (read_size as u64).min(last_offset - offset) as usize;
            self.exfat.dev().read_at(&mut buffers[idx][..len], offset)?;

            for start in (0..len).step_by(write_size) {
                let end = (start + write_size).min(len);
                let stored = &buffers[idx][start..end];
                let wanted = &alloc_bytes[bitmap_offset + start..bitmap_offset + end];
                if stored != wanted {
                    self.exfat.dev().write_at(wanted, offset + start as u64)?;
                }
            }

            idx ^= 0x01;
            offset += len as u64;
            bitmap_offset += len;
        }
        Ok(())
    }

    fn reclaim_free_clusters(&self) -> Result<()> {
        if let Err(err) = self.write_dirty_fat() {
            error!("failed to write fat entries");
            return Err(err);
        }
        if let Err(err) = self.write_dirty_bitmap() {
            error!("failed to write bitmap");
            return Err(err);
        }
        Ok(())
    }

    /// The whole checking flow after the boot region has been validated.
    pub fn check(&mut self) -> Result<()> {
        if self.repair.mode.can_write() {
            self.exfat.mark_volume_dirty(true)?;
        }

        debug!("verifying root directory...");
        self.root_dir_check().map_err(|err| {
            error!("failed to verify root directory.");
            err
        })?;

        debug!("verifying directory entries...");
        self.filesystem_check()?;

        if self.repair.mode.can_write() {
            self.exfat.dev().fsync()?;
            self.exfat.mark_volume_dirty(false)?;
        }
        Ok(())
    }

    pub fn show_info(&self, dev_name: &str, errors: bool) {
        info!(
            "sector size:  {}",
            bytes_to_human_readable(self.exfat.sector_size() as u64)
        );
        info!(
            "cluster size: {}",
            bytes_to_human_readable(self.exfat.cluster_size() as u64)
        );
        info!(
            "volume size:  {}",
            bytes_to_human_readable(self.exfat.dev().size())
        );

        println!(
            "{}: {}. directories {}, files {}",
            dev_name,
            if errors { "checking stopped" } else { "clean" },
            self.stats.dir_count,
            self.stats.file_count
        );
        if errors || self.repair.dirty {
            println!(
                "{}: files corrupted {}, files fixed {}",
                dev_name, self.stats.error_count, self.stats.fixed_count
            );
        }
    }
}

fn exit_code_of(err: &FsckError) -> i32 {
    if err.is_corruption() {
        FSCK_EXIT_ERRORS_LEFT
    } else {
        FSCK_EXIT_OPERATION_ERROR
    }
}

/// Check `dev` in `mode` and return the taxonomic exit code.
pub fn run_fsck(dev: Arc<dyn BlockDev>, dev_name: &str, mode: RepairMode) -> i32 {
    let mut repair = Repair::new(mode);

    let (bs_raw, bs) = match boot_region_check(dev.as_ref(), &mut repair) {
        Ok(region) => region,
        Err(err) => {
            error!("{}", err);
            return exit_code_of(&err);
        }
    };

    let mut fsck = Fsck::new(Exfat::new(dev, bs_raw, &bs), repair);
    let result = fsck.check();
    if let Err(ref err) = result {
        error!("{}", err);
    }
    fsck.show_info(dev_name, result.is_err());

    match result {
        Err(err) => exit_code_of(&err),
        Ok(()) => {
            if fsck.stats.error_count > fsck.stats.fixed_count {
                FSCK_EXIT_ERRORS_LEFT
            } else if fsck.repair.dirty {
                FSCK_EXIT_CORRECTED
            } else {
                FSCK_EXIT_NO_ERRORS
            }
        }
    }
}
