// SPDX-License-Identifier: MPL-2.0

//! Consistency checker and repairer for the exFAT on-disk file system.
//!
//! The crate attaches to a raw block device (or an image held in memory),
//! validates the structural invariants of the volume and, depending on the
//! repair mode, rewrites the inconsistent metadata it finds.

pub mod bitmap;
pub mod constants;
pub mod create;
pub mod de_iter;
pub mod dentry;
pub mod dev;
pub mod error;
pub mod fat;
pub mod fs;
pub mod fsck;
pub mod inode;
pub mod lookup;
pub mod repair;
pub mod super_block;
pub mod upcase_table;
pub mod utils;

pub use error::{FsckError, Result};
pub use fsck::{Fsck, FsckStats};
pub use repair::RepairMode;
