// SPDX-License-Identifier: MPL-2.0

use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::{FsckError, Result};

/// A block device accessed with positional reads and writes. There is no
/// shared cursor; every call carries its own offset.
pub trait BlockDev {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
    fn fsync(&self) -> Result<()>;

    /// Total device size in bytes.
    fn size(&self) -> u64;
    /// Logical sector size reported by the device.
    fn sector_size(&self) -> u32;
}

/// A device backed by a file or a raw block special file.
pub struct FileDev {
    file: File,
    size: u64,
    sector_size: u32,
    writeable: bool,
}

impl FileDev {
    pub fn open(path: &Path, writeable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writeable)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(FileDev {
            file,
            size,
            // Regular image files do not report a sector size; 512 is the
            // smallest one exFAT permits.
            sector_size: 512,
            writeable,
        })
    }
}

impl BlockDev for FileDev {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        if !self.writeable {
            return Err(FsckError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device is opened read-only",
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn fsync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

/// A device backed by an in-memory image. Used by the tests and for checking
/// volume images that were loaded into memory.
pub struct RamDev {
    image: RefCell<Vec<u8>>,
    sector_size: u32,
    writes: AtomicU64,
}

impl RamDev {
    pub fn new(image: Vec<u8>, sector_size: u32) -> Self {
        RamDev {
            image: RefCell::new(image),
            sector_size,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `write_at` calls served so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image.into_inner()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.image.borrow().clone()
    }
}

impl BlockDev for RamDev {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let image = self.image.borrow();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= image.len())
            .ok_or_else(|| {
                FsckError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read beyond end of image",
                ))
            })?;
        buf.copy_from_slice(&image[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut image = self.image.borrow_mut();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= image.len())
            .ok_or_else(|| {
                FsckError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "write beyond end of image",
                ))
            })?;
        image[start..end].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fsync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.image.borrow().len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}
