// SPDX-License-Identifier: MPL-2.0

use log::error;

use crate::{
    constants::EXFAT_FIRST_CLUSTER,
    dentry::{self, DentrySet, DENTRY_SIZE},
    error::{FsckError, Result},
    fat::{ClusterId, FatValue},
    fs::Exfat,
    inode::{ExfatInode, InodeId},
    lookup::{lookup_file, Lookup},
};

/// Where a dentry set is (or will be) placed inside a directory.
pub struct DentryLoc {
    pub parent: InodeId,
    pub file_offset: u64,
    pub dev_offset: u64,
}

/// Find a cluster that is free both in the checker's view and in the stored
/// bitmap, wrapping around the heap once.
fn find_empty_cluster(exfat: &Exfat, start: ClusterId) -> Result<ClusterId> {
    let mut cursor = start;
    while let Some(cluster) = exfat.alloc_bitmap.find_zero_from(cursor) {
        if !exfat.disk_bitmap.get(cluster) {
            return Ok(cluster);
        }
        cursor = cluster + 1;
    }

    let end = cursor;
    cursor = EXFAT_FIRST_CLUSTER;
    while cursor < end {
        match exfat.alloc_bitmap.find_zero_from(cursor) {
            Some(cluster) if cluster < end => {
                if !exfat.disk_bitmap.get(cluster) {
                    return Ok(cluster);
                }
                cursor = cluster + 1;
            }
            _ => break,
        }
    }

    Err(FsckError::NoSpace)
}

/// Walk the chain of `inode` to the cluster backing `offset`; `None` maps
/// the last cluster of the file.
pub fn map_cluster(exfat: &Exfat, inode: &ExfatInode, offset: Option<u64>) -> Result<ClusterId> {
    if !exfat.is_valid_cluster(inode.first_clus) {
        return Err(FsckError::InvalidChain(format!(
            "invalid start cluster. {:#x}",
            inode.first_clus
        )));
    }

    let cluster_size = exfat.cluster_size() as u64;
    let last_count = match offset {
        Some(offset) => offset.div_ceil(cluster_size),
        None => inode.size.div_ceil(cluster_size),
    };

    let mut cluster = inode.first_clus;
    let mut count = 1u64;
    loop {
        if count * cluster_size > inode.size {
            return Err(FsckError::InvalidChain(
                "offset beyond the end of the chain".to_string(),
            ));
        }
        if count == last_count {
            return Ok(cluster);
        }

        match exfat.next_inode_cluster(inode, cluster)? {
            FatValue::Next(next) if exfat.is_valid_cluster(next) => cluster = next,
            value => {
                return Err(FsckError::InvalidChain(format!(
                    "chain ends early. {:?}",
                    value
                )))
            }
        }
        count += 1;
    }
}

/// Grow `inode` by one cluster: pick a free cluster, terminate it in the
/// FAT, link it behind the current tail and refresh the stored dentry set.
pub fn alloc_cluster(exfat: &mut Exfat, inode_id: InodeId, zero_fill: bool) -> Result<ClusterId> {
    let need_dset = exfat.root != Some(inode_id);

    let node = exfat.arena.get(inode_id);
    if need_dset && (node.dentry_set.is_none() || node.dev_offset.is_none()) {
        return Err(FsckError::InvalidFormat(
            "no dentry set is attached to the inode".to_string(),
        ));
    }
    let inode_size = node.size;
    let cluster_size = exfat.cluster_size();

    let start = exfat.start_clu.unwrap_or(EXFAT_FIRST_CLUSTER);
    let new_clu = find_empty_cluster(exfat, start).map_err(|err| {
        error!("failed to find an empty cluster: No space");
        err
    })?;
    exfat.start_clu = Some(new_clu);

    exfat.set_fat(new_clu, FatValue::EndOfChain)?;
    if zero_fill {
        exfat
            .dev()
            .write_at(exfat.zero_cluster(), exfat.c2o(new_clu))?;
    }

    let cluster_count;
    let start_clu_update;
    if inode_size > 0 {
        let last_clu = map_cluster(exfat, exfat.arena.get(inode_id), None)?;
        exfat.set_fat(last_clu, FatValue::Next(new_clu))?;
        cluster_count = (inode_size.div_ceil(cluster_size as u64) + 1) as u32;
        start_clu_update = 0;
    } else {
        cluster_count = 1;
        start_clu_update = new_clu;
    }

    if need_dset {
        let node = exfat.arena.get(inode_id);
        let mut dset = match node.dentry_set.clone() {
            Some(dset) => dset,
            None => {
                return Err(FsckError::InvalidFormat(
                    "no dentry set is attached to the inode".to_string(),
                ))
            }
        };
        let Some(dev_offset) = node.dev_offset else {
            return Err(FsckError::InvalidFormat(
                "the dentry set location is unknown".to_string(),
            ));
        };

        dentry::update_file_dentry_set(
            &exfat.upcase_table,
            &mut dset,
            None,
            start_clu_update,
            cluster_count,
            cluster_size,
        )?;
        exfat.dev().write_at(dset.as_bytes(), dev_offset)?;
        exfat.arena.get_mut(inode_id).dentry_set = Some(dset);
    }

    exfat.alloc_bitmap.set(new_clu);
    let node = exfat.arena.get_mut(inode_id);
    if node.size == 0 {
        node.first_clus = new_clu;
    }
    node.size += cluster_size as u64;
    Ok(new_clu)
}

/// Write a dentry set at `loc` inside its parent directory, growing the
/// directory and splitting the write at the cluster boundary when the set
/// does not fit in the space left.
pub fn add_dentry_set(
    exfat: &mut Exfat,
    loc: &mut DentryLoc,
    dset: &DentrySet,
    need_next_loc: bool,
) -> Result<()> {
    let parent = exfat.arena.get(loc.parent);
    if exfat.root != Some(loc.parent)
        && (parent.dentry_set.is_none() || parent.dev_offset.is_none())
    {
        return Err(FsckError::InvalidFormat(
            "the parent dentry set has not been read".to_string(),
        ));
    }

    let cluster_size = exfat.cluster_size() as u64;
    let bytes = dset.as_bytes();
    let total = bytes.len() as u64;

    let end_dev_offset;
    if loc.file_offset + total >= exfat.arena.get(loc.parent).size {
        let new_clu = alloc_cluster(exfat, loc.parent, true).map_err(|err| {
            error!("failed to allocate a cluster");
            err
        })?;

        let mut written = 0u64;
        if loc.file_offset % cluster_size != 0 {
            written = (cluster_size - loc.file_offset % cluster_size).min(total);
            if written % DENTRY_SIZE as u64 != 0 {
                return Err(FsckError::InvalidFormat(
                    "unaligned dentry location".to_string(),
                ));
            }
            exfat
                .dev()
                .write_at(&bytes[..written as usize], loc.dev_offset)?;
        }

        let tail = &bytes[written as usize..];
        if tail.is_empty() {
            end_dev_offset = loc.dev_offset + total;
        } else {
            exfat.dev().write_at(tail, exfat.c2o(new_clu))?;
            end_dev_offset = exfat.c2o(new_clu) + tail.len() as u64;
        }
    } else {
        exfat.dev().write_at(bytes, loc.dev_offset)?;
        end_dev_offset = loc.dev_offset + total;
    }

    if need_next_loc {
        loc.file_offset += total;
        loc.dev_offset = end_dev_offset;
    }
    Ok(())
}

/// Find `name` under `parent`, creating a fresh entry set when it does not
/// exist yet. Returns the set and the device offset of its primary.
pub fn create_file(
    exfat: &mut Exfat,
    parent: InodeId,
    name: &str,
    attr: u16,
) -> Result<(DentrySet, u64)> {
    match lookup_file(exfat, exfat.arena.get(parent), name)? {
        Lookup::Found {
            dentry_set,
            dev_offset,
            ..
        } => {
            if (dentry_set.file().attr & attr) != attr {
                return Err(FsckError::InvalidFormat(format!(
                    "{} already exists with different attributes",
                    name
                )));
            }
            Ok((dentry_set, dev_offset))
        }
        Lookup::NotFound {
            free_dev_offset,
            free_file_offset,
        } => {
            let dset = dentry::build_file_dentry_set(&exfat.upcase_table, name, attr)?;

            let (file_offset, dev_offset) = match (free_file_offset, free_dev_offset) {
                (Some(file_offset), Some(dev_offset)) => (file_offset, dev_offset),
                // No free slot: append past the last cluster.
                _ => (exfat.arena.get(parent).size, 0),
            };
            let mut loc = DentryLoc {
                parent,
                file_offset,
                dev_offset,
            };
            add_dentry_set(exfat, &mut loc, &dset, true)?;
            let set_size = dset.as_bytes().len() as u64;
            Ok((dset, loc.dev_offset - set_size))
        }
    }
}
