// SPDX-License-Identifier: MPL-2.0

use std::ops::Range;

use bitflags::bitflags;

use crate::{
    constants::{EXFAT_FILE_NAME_LEN, MAX_NAME_LENGTH, VOLUME_LABEL_MAX_LEN},
    error::{FsckError, Result},
    fat::ClusterId,
    upcase_table::UpcaseTable,
    utils::{calc_checksum_16, DosTimestamp},
};

pub const DENTRY_SIZE: usize = 32; // directory entry size

pub const EXFAT_UNUSED: u8 = 0x00;
pub const EXFAT_BITMAP: u8 = 0x81;
pub const EXFAT_UPCASE: u8 = 0x82;
pub const EXFAT_VOLUME: u8 = 0x83;
pub const EXFAT_FILE: u8 = 0x85;
pub const EXFAT_STREAM: u8 = 0xC0;
pub const EXFAT_NAME: u8 = 0xC1;

/// A deleted entry keeps its type with the in-use bit (bit 7) cleared.
pub fn is_deleted(dentry_type: u8) -> bool {
    dentry_type != EXFAT_UNUSED && dentry_type & 0x80 == 0
}

bitflags! {
    pub struct StreamFlags: u8 {
        // An associated allocation of clusters is possible.
        const ALLOC_POSSIBLE = 0x01;
        // The allocated clusters are contiguous and the FAT is irrelevant.
        const NO_FAT_CHAIN = 0x02;
    }
}

fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(raw[offset..offset + 2].try_into().unwrap())
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap())
}

fn write_u16(raw: &mut [u8], offset: usize, value: u16) {
    raw[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(raw: &mut [u8], offset: usize, value: u32) {
    raw[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(raw: &mut [u8], offset: usize, value: u64) {
    raw[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// The decoded view of one 32-byte directory entry.
#[derive(Debug, Clone, Copy)]
pub enum ExfatDentry {
    File(FileDentry),
    Stream(StreamDentry),
    Name(NameDentry),
    Bitmap(BitmapDentry),
    Upcase(UpcaseDentry),
    Volume(VolumeDentry),
    Deleted,
    UnUsed,
    Unknown(u8),
}

impl ExfatDentry {
    pub fn parse(raw: &[u8]) -> Self {
        match raw[0] {
            EXFAT_FILE => ExfatDentry::File(FileDentry::parse(raw)),
            EXFAT_STREAM => ExfatDentry::Stream(StreamDentry::parse(raw)),
            EXFAT_NAME => ExfatDentry::Name(NameDentry::parse(raw)),
            EXFAT_BITMAP => ExfatDentry::Bitmap(BitmapDentry::parse(raw)),
            EXFAT_UPCASE => ExfatDentry::Upcase(UpcaseDentry::parse(raw)),
            EXFAT_VOLUME => ExfatDentry::Volume(VolumeDentry::parse(raw)),
            EXFAT_UNUSED => ExfatDentry::UnUsed,
            t if is_deleted(t) => ExfatDentry::Deleted,
            t => ExfatDentry::Unknown(t),
        }
    }
}

/// For files & directories
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDentry {
    // Number of secondary entries in the set (1 stream + name dentries).
    pub num_ext: u8,
    // Checksum over the whole set, excluding this field itself.
    pub checksum: u16,
    // bit0: read-only; bit1: hidden; bit2: system; bit4: directory; bit5: archive
    pub attr: u16,
    pub create_time: u16,
    pub create_date: u16,
    pub modify_time: u16,
    pub modify_date: u16,
    pub access_time: u16,
    pub access_date: u16,
    // High precision time in 10ms
    pub create_time_cs: u8,
    pub modify_time_cs: u8,
    // Timezone for the various times
    pub create_utc_offset: u8,
    pub modify_utc_offset: u8,
    pub access_utc_offset: u8,
}

impl FileDentry {
    pub fn parse(raw: &[u8]) -> Self {
        FileDentry {
            num_ext: raw[1],
            checksum: read_u16(raw, 2),
            attr: read_u16(raw, 4),
            create_time: read_u16(raw, 8),
            create_date: read_u16(raw, 10),
            modify_time: read_u16(raw, 12),
            modify_date: read_u16(raw, 14),
            access_time: read_u16(raw, 16),
            access_date: read_u16(raw, 18),
            create_time_cs: raw[20],
            modify_time_cs: raw[21],
            create_utc_offset: raw[22],
            modify_utc_offset: raw[23],
            access_utc_offset: raw[24],
        }
    }

    pub fn emit(&self, raw: &mut [u8]) {
        raw[0] = EXFAT_FILE;
        raw[1] = self.num_ext;
        write_u16(raw, 2, self.checksum);
        write_u16(raw, 4, self.attr);
        write_u16(raw, 8, self.create_time);
        write_u16(raw, 10, self.create_date);
        write_u16(raw, 12, self.modify_time);
        write_u16(raw, 14, self.modify_date);
        write_u16(raw, 16, self.access_time);
        write_u16(raw, 18, self.access_date);
        raw[20] = self.create_time_cs;
        raw[21] = self.modify_time_cs;
        raw[22] = self.create_utc_offset;
        raw[23] = self.modify_utc_offset;
        raw[24] = self.access_utc_offset;
    }
}

/// Must immediately follow the file dentry of a set.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamDentry {
    pub flags: u8,
    pub name_len: u8,
    pub name_hash: u16,
    pub valid_size: u64,
    pub start_clu: ClusterId,
    pub size: u64,
}

impl StreamDentry {
    pub fn parse(raw: &[u8]) -> Self {
        StreamDentry {
            flags: raw[1],
            name_len: raw[3],
            name_hash: read_u16(raw, 4),
            valid_size: read_u64(raw, 8),
            start_clu: read_u32(raw, 20),
            size: read_u64(raw, 24),
        }
    }

    pub fn emit(&self, raw: &mut [u8]) {
        raw[0] = EXFAT_STREAM;
        raw[1] = self.flags;
        raw[3] = self.name_len;
        write_u16(raw, 4, self.name_hash);
        write_u64(raw, 8, self.valid_size);
        write_u32(raw, 20, self.start_clu);
        write_u64(raw, 24, self.size);
    }

    pub fn is_contiguous(&self) -> bool {
        StreamFlags::from_bits_truncate(self.flags).contains(StreamFlags::NO_FAT_CHAIN)
    }
}

/// Carries 15 UTF-16 code units of the file name.
#[derive(Debug, Clone, Copy)]
pub struct NameDentry {
    pub flags: u8,
    pub unicode_0_14: [u16; EXFAT_FILE_NAME_LEN],
}

impl NameDentry {
    pub fn parse(raw: &[u8]) -> Self {
        let mut unicode = [0u16; EXFAT_FILE_NAME_LEN];
        for (i, unit) in unicode.iter_mut().enumerate() {
            *unit = read_u16(raw, 2 + i * 2);
        }
        NameDentry {
            flags: raw[1],
            unicode_0_14: unicode,
        }
    }

    pub fn emit(&self, raw: &mut [u8]) {
        raw[0] = EXFAT_NAME;
        raw[1] = self.flags;
        for (i, unit) in self.unicode_0_14.iter().enumerate() {
            write_u16(raw, 2 + i * 2, *unit);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BitmapDentry {
    pub flags: u8,
    pub start_clu: ClusterId,
    pub size: u64,
}

impl BitmapDentry {
    pub fn parse(raw: &[u8]) -> Self {
        BitmapDentry {
            flags: raw[1],
            start_clu: read_u32(raw, 20),
            size: read_u64(raw, 24),
        }
    }

    pub fn emit(&self, raw: &mut [u8]) {
        raw[0] = EXFAT_BITMAP;
        raw[1] = self.flags;
        write_u32(raw, 20, self.start_clu);
        write_u64(raw, 24, self.size);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpcaseDentry {
    pub checksum: u32,
    pub start_clu: ClusterId,
    pub size: u64,
}

impl UpcaseDentry {
    pub fn parse(raw: &[u8]) -> Self {
        UpcaseDentry {
            checksum: read_u32(raw, 4),
            start_clu: read_u32(raw, 20),
            size: read_u64(raw, 24),
        }
    }

    pub fn emit(&self, raw: &mut [u8]) {
        raw[0] = EXFAT_UPCASE;
        write_u32(raw, 4, self.checksum);
        write_u32(raw, 20, self.start_clu);
        write_u64(raw, 24, self.size);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeDentry {
    pub char_cnt: u8,
    pub label: [u16; VOLUME_LABEL_MAX_LEN],
}

impl VolumeDentry {
    pub fn parse(raw: &[u8]) -> Self {
        let mut label = [0u16; VOLUME_LABEL_MAX_LEN];
        for (i, unit) in label.iter_mut().enumerate() {
            *unit = read_u16(raw, 2 + i * 2);
        }
        VolumeDentry {
            char_cnt: raw[1],
            label,
        }
    }

    pub fn emit(&self, raw: &mut [u8]) {
        raw[0] = EXFAT_VOLUME;
        raw[1] = self.char_cnt;
        for (i, unit) in self.label.iter().enumerate() {
            write_u16(raw, 2 + i * 2, *unit);
        }
    }
}

/// Encode a file name, rejecting code points exFAT forbids in names.
pub fn encode_utf16_name(name: &str) -> Result<Vec<u16>> {
    let utf16: Vec<u16> = name.encode_utf16().collect();
    if utf16.is_empty() || utf16.len() > MAX_NAME_LENGTH {
        return Err(FsckError::InvalidFormat(format!(
            "invalid length of name: {}",
            utf16.len()
        )));
    }
    if utf16.iter().any(|&unit| !is_valid_name_char(unit)) {
        return Err(FsckError::InvalidFormat(format!(
            "invalid character in name: {}",
            name
        )));
    }
    Ok(utf16)
}

fn is_valid_name_char(value: u16) -> bool {
    match value {
        0x00..=0x1F => false, // Control Code
        0x22 => false,        // Quotation Mark
        0x2A => false,        // Asterisk
        0x2F => false,        // Forward slash
        0x3A => false,        // Colon
        0x3C => false,        // Less-than sign
        0x3E => false,        // Greater-than sign
        0x3F => false,        // Question mark
        0x5C => false,        // Back slash
        0x7C => false,        // Vertical bar
        _ => true,
    }
}

/// Hash of the upcased file name, as stored in the stream dentry.
pub fn calc_name_hash(upcase_table: &UpcaseTable, name: &[u16]) -> u16 {
    let mut checksum = 0u16;
    for &unit in name {
        let [low, high] = upcase_table.char_to_upcase(unit).to_le_bytes();
        checksum = checksum.rotate_right(1).wrapping_add(low as u16);
        checksum = checksum.rotate_right(1).wrapping_add(high as u16);
    }
    checksum
}

/// A contiguous run of dentries describing one file: the file dentry, its
/// stream dentry and the name dentries, kept in the raw on-disk form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentrySet {
    bytes: Vec<u8>,
}

impl DentrySet {
    /// File dentry index.
    pub const ES_IDX_FILE: usize = 0;
    /// Stream dentry index.
    pub const ES_IDX_STREAM: usize = 1;
    /// Index of the first name dentry.
    pub const ES_IDX_FIRST_FILENAME: usize = 2;

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % DENTRY_SIZE != 0 {
            return Err(FsckError::InvalidFormat(
                "dentry set size unaligned to dentry size".to_string(),
            ));
        }
        Ok(DentrySet { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / DENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry(&self, i: usize) -> &[u8] {
        &self.bytes[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE]
    }

    pub fn entry_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.bytes[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE]
    }

    pub fn file(&self) -> FileDentry {
        FileDentry::parse(self.entry(Self::ES_IDX_FILE))
    }

    pub fn stream(&self) -> StreamDentry {
        StreamDentry::parse(self.entry(Self::ES_IDX_STREAM))
    }

    pub fn set_file(&mut self, file: &FileDentry) {
        file.emit(self.entry_mut(Self::ES_IDX_FILE));
    }

    pub fn set_stream(&mut self, stream: &StreamDentry) {
        stream.emit(self.entry_mut(Self::ES_IDX_STREAM));
    }

    /// The UTF-16 name carried by the name dentries, cut at the first NUL.
    pub fn name(&self) -> Vec<u16> {
        let mut name = Vec::new();
        for i in Self::ES_IDX_FIRST_FILENAME..self.len() {
            let entry = self.entry(i);
            if entry[0] != EXFAT_NAME {
                break;
            }
            for unit in NameDentry::parse(entry).unicode_0_14 {
                if unit == 0 {
                    return name;
                }
                name.push(unit);
            }
        }
        name
    }

    /// Checksum over the whole set; the stored checksum bytes of the file
    /// dentry do not take part.
    pub fn calculate_checksum(&self) -> u16 {
        const CHECKSUM_BYTES_RANGE: Range<usize> = 2..4;
        const EMPTY_RANGE: Range<usize> = 0..0;

        let mut checksum = calc_checksum_16(self.entry(Self::ES_IDX_FILE), CHECKSUM_BYTES_RANGE, 0);
        for i in 1..self.len() {
            checksum = calc_checksum_16(self.entry(i), EMPTY_RANGE, checksum);
        }
        checksum
    }

    pub fn verify_checksum(&self) -> bool {
        self.file().checksum == self.calculate_checksum()
    }

    pub fn update_checksum(&mut self) {
        let checksum = self.calculate_checksum();
        let mut file = self.file();
        file.checksum = checksum;
        self.set_file(&file);
    }
}

/// Build a fresh dentry set for `name` with no clusters allocated yet. All
/// three timestamps are set from the current UTC wall clock.
pub fn build_file_dentry_set(
    upcase_table: &UpcaseTable,
    name: &str,
    attr: u16,
) -> Result<DentrySet> {
    let utf16_name = encode_utf16_name(name)?;
    let name_dentries = utf16_name.len().div_ceil(EXFAT_FILE_NAME_LEN);
    let dcount = 2 + name_dentries;

    let mut dset = DentrySet::from_bytes(vec![0u8; dcount * DENTRY_SIZE])?;

    let dos_time = DosTimestamp::now()?;
    let file = FileDentry {
        num_ext: (dcount - 1) as u8,
        checksum: 0,
        attr,
        create_time: dos_time.time,
        create_date: dos_time.date,
        modify_time: dos_time.time,
        modify_date: dos_time.date,
        access_time: dos_time.time,
        access_date: dos_time.date,
        create_time_cs: dos_time.increment_10ms,
        modify_time_cs: dos_time.increment_10ms,
        create_utc_offset: dos_time.utc_offset,
        modify_utc_offset: dos_time.utc_offset,
        access_utc_offset: dos_time.utc_offset,
    };
    file.emit(dset.entry_mut(DentrySet::ES_IDX_FILE));

    let stream = StreamDentry {
        flags: StreamFlags::ALLOC_POSSIBLE.bits(),
        name_len: utf16_name.len() as u8,
        name_hash: calc_name_hash(upcase_table, &utf16_name),
        valid_size: 0,
        start_clu: 0,
        size: 0,
    };
    stream.emit(dset.entry_mut(DentrySet::ES_IDX_STREAM));

    emit_name_dentries(&mut dset, &utf16_name);
    dset.update_checksum();
    Ok(dset)
}

/// In-place update of a dentry set: a new name, a new start cluster and the
/// cluster count backing `size`/`valid_size`.
pub fn update_file_dentry_set(
    upcase_table: &UpcaseTable,
    dset: &mut DentrySet,
    name: Option<&str>,
    start_clu: ClusterId,
    cluster_count: u32,
    cluster_size: u32,
) -> Result<()> {
    if dset.entry(DentrySet::ES_IDX_FILE)[0] != EXFAT_FILE || dset.len() < 3 {
        return Err(FsckError::InvalidFormat(
            "not a file dentry set".to_string(),
        ));
    }

    if let Some(name) = name {
        let utf16_name = encode_utf16_name(name)?;
        if dset.len() != 2 + utf16_name.len().div_ceil(EXFAT_FILE_NAME_LEN) {
            return Err(FsckError::InvalidFormat(
                "dentry count mismatched with the new name".to_string(),
            ));
        }

        let mut stream = dset.stream();
        stream.name_len = utf16_name.len() as u8;
        stream.name_hash = calc_name_hash(upcase_table, &utf16_name);
        dset.set_stream(&stream);

        emit_name_dentries(dset, &utf16_name);
    }

    let mut stream = dset.stream();
    stream.valid_size = cluster_count as u64 * cluster_size as u64;
    stream.size = stream.valid_size;
    if start_clu != 0 {
        stream.start_clu = start_clu;
    }
    dset.set_stream(&stream);

    dset.update_checksum();
    Ok(())
}

fn emit_name_dentries(dset: &mut DentrySet, utf16_name: &[u16]) {
    for (i, chunk) in utf16_name.chunks(EXFAT_FILE_NAME_LEN).enumerate() {
        let mut unicode = [0u16; EXFAT_FILE_NAME_LEN];
        unicode[..chunk.len()].copy_from_slice(chunk);
        let name_dentry = NameDentry {
            flags: 0,
            unicode_0_14: unicode,
        };
        name_dentry.emit(dset.entry_mut(DentrySet::ES_IDX_FIRST_FILENAME + i));
    }
}
