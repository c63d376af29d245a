// SPDX-License-Identifier: MPL-2.0

use std::ops::Range;

use time::OffsetDateTime;

use crate::error::{FsckError, Result};

/// 32-bit rotate checksum used by the boot region and the upcase table.
/// Bytes whose index falls in `ignore` do not take part.
pub fn calc_checksum_32(data: &[u8], ignore: Range<usize>, prev_checksum: u32) -> u32 {
    let mut result = prev_checksum;
    for (pos, &value) in data.iter().enumerate() {
        if ignore.contains(&pos) {
            continue;
        }
        result = result.rotate_right(1).wrapping_add(value as u32);
    }
    result
}

/// 16-bit rotate checksum used by dentry sets and name hashes, ignoring
/// certain bytes in the range.
pub fn calc_checksum_16(data: &[u8], ignore: Range<usize>, prev_checksum: u16) -> u16 {
    let mut result = prev_checksum;
    for (pos, &value) in data.iter().enumerate() {
        // Ignore the checksum field
        if ignore.contains(&pos) {
            continue;
        }
        result = result.rotate_right(1).wrapping_add(value as u16);
    }
    result
}

const EXFAT_TIME_ZONE_VALID: u8 = 1 << 7;

/// An exFAT timestamp: a 16-bit date, a 16-bit time with double-second
/// granularity and a 10ms increment for the odd second.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosTimestamp {
    pub time: u16,
    pub date: u16,
    pub increment_10ms: u8,
    pub utc_offset: u8,
}

impl DosTimestamp {
    pub fn now() -> Result<Self> {
        Self::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn from_unix_timestamp(secs: i64) -> Result<Self> {
        let date_time = OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|_| FsckError::InvalidFormat("failed to convert timestamp".to_string()))?;

        let time = ((date_time.hour() as u16) << 11)
            | ((date_time.minute() as u16) << 5)
            | ((date_time.second() as u16) >> 1);
        let date = (((date_time.year() - 1980) as u16) << 9)
            | ((date_time.month() as u16) << 5)
            | (date_time.day() as u16);

        Ok(Self {
            time,
            date,
            increment_10ms: (date_time.second() & 1) * 100,
            utc_offset: EXFAT_TIME_ZONE_VALID,
        })
    }
}

/// Format a byte count with the customary binary unit suffix.
pub fn bytes_to_human_readable(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut shift = 0;
    let mut unit = 0;
    for i in 0..UNITS.len() {
        if bytes / (1u64 << (shift + 10)) == 0 {
            unit = i;
            break;
        }
        shift += 10;
        unit = i + 1;
    }
    let unit = unit.min(UNITS.len() - 1);

    let quoti = bytes >> shift;
    let mut remain = 0;
    if shift > 0 {
        remain = (bytes & ((1u64 << shift) - 1)) >> (shift - 10);
        remain = (remain * 100) / 1024;
    }
    format!("{}.{:02} {}", quoti, remain, UNITS[unit])
}
