// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

/// Failure taxonomy of the checker. Lookups that simply find nothing are not
/// failures and are reported as `Ok(None)` by the functions concerned.
#[derive(Debug, Error)]
pub enum FsckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid exFAT format: {0}")]
    InvalidFormat(String),

    #[error("invalid cluster chain: {0}")]
    InvalidChain(String),

    #[error("dentry index out of the iterator window")]
    OutOfRange,

    #[error("no free cluster available")]
    NoSpace,

    #[error("{0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, FsckError>;

impl FsckError {
    /// Whether the failure describes a structural inconsistency, as opposed
    /// to an operational one such as a short read.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FsckError::InvalidFormat(_) | FsckError::InvalidChain(_) | FsckError::Corrupt(_)
        )
    }
}
