// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use crate::{
    dentry::{ExfatDentry, DENTRY_SIZE},
    dev::BlockDev,
    error::{FsckError, Result},
    fat::{self, ClusterId, FatValue},
    inode::ExfatInode,
    super_block::SuperBlock,
};

/// One cluster-sized buffer of the iterator window, with a dirty bit per
/// sector for partial writeback.
struct BufferDesc {
    /// Physical cluster mirrored by the buffer; 0 while the buffer is empty.
    p_clus: ClusterId,
    /// File offset of the buffer base.
    offset: u64,
    buffer: Vec<u8>,
    dirty: Vec<bool>,
}

impl BufferDesc {
    fn new(read_size: usize, write_size: usize) -> Self {
        BufferDesc {
            p_clus: 0,
            offset: 0,
            buffer: vec![0u8; read_size],
            dirty: vec![false; read_size / write_size],
        }
    }
}

/// A sliding window over the dentries of one directory. Two cluster buffers
/// are streamed along the directory's cluster chain; index 0 is the current
/// entry and higher indices may be peeked as long as they stay inside the
/// double-buffer window. This is the only writer of directory data in the
/// common path.
pub struct DeIter {
    dev: Arc<dyn BlockDev>,
    sb: SuperBlock,

    dir_size: u64,
    dir_is_contiguous: bool,

    bufs: [BufferDesc; 2],
    /// File offset of the entry at index 0.
    de_file_offset: u64,
    /// File offset of the first cluster not yet loaded.
    next_read_offset: u64,
    /// FAT value backing the cluster at `next_read_offset`.
    ra_next_clus: FatValue,
    /// Number of dentries addressable without advancing.
    max_skip_dentries: usize,

    read_size: usize,
    write_size: usize,
}

impl DeIter {
    /// Position a fresh window at the first dentry of `dir`. An empty
    /// directory yields no iterator.
    pub fn new(dev: Arc<dyn BlockDev>, sb: SuperBlock, dir: &ExfatInode) -> Result<Option<Self>> {
        if dir.size == 0 {
            return Ok(None);
        }
        if !sb.is_valid_cluster(dir.first_clus) {
            return Err(FsckError::InvalidChain(format!(
                "invalid start cluster of a directory. {:#x}",
                dir.first_clus
            )));
        }

        let read_size = sb.cluster_size as usize;
        let write_size = sb.sector_size as usize;

        let mut iter = DeIter {
            dev,
            sb,
            dir_size: dir.size,
            dir_is_contiguous: dir.is_contiguous,
            bufs: [
                BufferDesc::new(read_size, write_size),
                BufferDesc::new(read_size, write_size),
            ],
            de_file_offset: 0,
            next_read_offset: read_size as u64,
            ra_next_clus: FatValue::EndOfChain,
            max_skip_dentries: 2 * read_size / DENTRY_SIZE,
            read_size,
            write_size,
        };

        iter.dev
            .read_at(&mut iter.bufs[0].buffer, iter.sb.c2o(dir.first_clus))?;
        iter.bufs[0].p_clus = dir.first_clus;
        iter.bufs[0].offset = 0;
        iter.ra_next_clus = fat::next_inode_cluster(
            iter.dev.as_ref(),
            &iter.sb,
            iter.dir_is_contiguous,
            dir.first_clus,
        )?;

        Ok(Some(iter))
    }

    /// Locate dentry `ith` of the window, loading the next cluster of the
    /// chain when the entry lies past the loaded part. Returns the buffer
    /// index and the byte offset inside it, or `None` past the end of the
    /// directory.
    fn peek(&mut self, ith: usize) -> Result<Option<(usize, usize)>> {
        let offset = self.de_file_offset + (ith * DENTRY_SIZE) as u64;
        if offset + DENTRY_SIZE as u64 > self.dir_size {
            return Ok(None);
        }

        let window_base = self.de_file_offset - self.de_file_offset % self.read_size as u64;
        if ith >= self.max_skip_dentries
            || offset + DENTRY_SIZE as u64 > window_base + 2 * self.read_size as u64
        {
            return Err(FsckError::OutOfRange);
        }

        while offset + DENTRY_SIZE as u64 > self.next_read_offset {
            if !self.load_next_cluster()? {
                return Ok(None);
            }
        }

        let idx = ((offset / self.read_size as u64) & 1) as usize;
        Ok(Some((idx, (offset % self.read_size as u64) as usize)))
    }

    /// Replace the stale buffer with the next cluster of the chain. The
    /// leaving buffer's dirty sectors are flushed before it is reused.
    fn load_next_cluster(&mut self) -> Result<bool> {
        let cluster = match self.ra_next_clus {
            FatValue::Next(cluster) if self.sb.is_valid_cluster(cluster) => cluster,
            FatValue::EndOfChain => return Ok(false),
            value => {
                return Err(FsckError::InvalidChain(format!(
                    "broken cluster chain in a directory. {:?}",
                    value
                )))
            }
        };

        let idx = ((self.next_read_offset / self.read_size as u64) & 1) as usize;
        self.flush_buffer(idx)?;

        self.dev
            .read_at(&mut self.bufs[idx].buffer, self.sb.c2o(cluster))?;
        self.bufs[idx].p_clus = cluster;
        self.bufs[idx].offset = self.next_read_offset;

        self.ra_next_clus =
            fat::next_inode_cluster(self.dev.as_ref(), &self.sb, self.dir_is_contiguous, cluster)?;
        self.next_read_offset += self.read_size as u64;
        Ok(true)
    }

    fn flush_buffer(&mut self, idx: usize) -> Result<()> {
        let desc = &mut self.bufs[idx];
        if desc.p_clus == 0 {
            return Ok(());
        }
        let base = self.sb.c2o(desc.p_clus);
        for sector in 0..desc.dirty.len() {
            if !desc.dirty[sector] {
                continue;
            }
            let start = sector * self.write_size;
            self.dev.write_at(
                &desc.buffer[start..start + self.write_size],
                base + start as u64,
            )?;
            desc.dirty[sector] = false;
        }
        Ok(())
    }

    /// The decoded dentry at window index `ith`.
    pub fn get(&mut self, ith: usize) -> Result<Option<ExfatDentry>> {
        Ok(self
            .get_raw(ith)?
            .map(|raw| ExfatDentry::parse(&raw)))
    }

    /// The raw bytes of the dentry at window index `ith`.
    pub fn get_raw(&mut self, ith: usize) -> Result<Option<[u8; DENTRY_SIZE]>> {
        match self.peek(ith)? {
            Some((idx, offset)) => {
                let mut raw = [0u8; DENTRY_SIZE];
                raw.copy_from_slice(&self.bufs[idx].buffer[offset..offset + DENTRY_SIZE]);
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    /// Mutable access to the dentry at window index `ith`. The sector the
    /// entry lives in is marked dirty and written back on flush.
    pub fn get_dirty(&mut self, ith: usize) -> Result<&mut [u8]> {
        let (idx, offset) = self.peek(ith)?.ok_or(FsckError::OutOfRange)?;
        let desc = &mut self.bufs[idx];
        desc.dirty[offset / self.write_size] = true;
        Ok(&mut desc.buffer[offset..offset + DENTRY_SIZE])
    }

    /// Move the window start by `skip_dentries` entries.
    pub fn advance(&mut self, skip_dentries: usize) -> Result<()> {
        if skip_dentries > self.max_skip_dentries {
            return Err(FsckError::OutOfRange);
        }
        self.de_file_offset += (skip_dentries * DENTRY_SIZE) as u64;
        Ok(())
    }

    /// Write out every dirty sector of both buffers. Idempotent.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer(0)?;
        self.flush_buffer(1)
    }

    /// Device offset of the current entry.
    pub fn device_offset(&self) -> Result<u64> {
        let idx = ((self.de_file_offset / self.read_size as u64) & 1) as usize;
        let desc = &self.bufs[idx];
        let base = self.de_file_offset - self.de_file_offset % self.read_size as u64;
        if desc.p_clus == 0 || desc.offset != base {
            return Err(FsckError::OutOfRange);
        }
        Ok(self.sb.c2o(desc.p_clus) + self.de_file_offset % self.read_size as u64)
    }

    /// File offset of the current entry inside the directory.
    pub fn file_offset(&self) -> u64 {
        self.de_file_offset
    }
}
