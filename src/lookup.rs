// SPDX-License-Identifier: MPL-2.0

use crate::{
    constants::EXFAT_FILE_NAME_LEN,
    de_iter::DeIter,
    dentry::{is_deleted, DentrySet, FileDentry, NameDentry, DENTRY_SIZE, EXFAT_FILE, EXFAT_NAME, EXFAT_UNUSED},
    error::{FsckError, Result},
    fs::Exfat,
    inode::ExfatInode,
};

/// A predicate run on every dentry whose type matched; returns the number of
/// entries the matching set spans, or `None` for no match.
pub type LookupPredicate<'a> = dyn FnMut(&mut DeIter) -> Result<Option<usize>> + 'a;

/// Outcome of scanning a directory for a dentry set.
pub enum Lookup {
    /// A copy of the matching set and where it was found.
    Found {
        dentry_set: DentrySet,
        dev_offset: u64,
        file_offset: u64,
    },
    /// No match; if the directory ended with a run of free slots, their
    /// start is reported as an insertion hint.
    NotFound {
        free_dev_offset: Option<u64>,
        free_file_offset: Option<u64>,
    },
}

/// Scan `parent` for the first dentry set whose primary has `dentry_type`
/// and satisfies `predicate`. The dentry set is not verified here.
pub fn lookup_dentry_set(
    exfat: &Exfat,
    parent: &ExfatInode,
    dentry_type: u8,
    mut predicate: Option<&mut LookupPredicate<'_>>,
) -> Result<Lookup> {
    let not_found = |free: Option<(u64, u64)>| Lookup::NotFound {
        free_dev_offset: free.map(|(dev, _)| dev),
        free_file_offset: free.map(|(_, file)| file),
    };

    let Some(mut iter) = exfat.de_iter(parent)? else {
        return Ok(not_found(None));
    };

    let mut free_offset: Option<(u64, u64)> = None;
    let mut last_is_free = false;

    loop {
        let Some(raw) = iter.get_raw(0)? else {
            break;
        };

        let dentry_type_here = raw[0];

        if dentry_type_here == dentry_type {
            let matched = match predicate.as_deref_mut() {
                Some(filter) => filter(&mut iter)?,
                None => Some(1),
            };
            if let Some(count) = matched {
                let mut bytes = Vec::with_capacity(count * DENTRY_SIZE);
                for i in 0..count {
                    let entry = iter.get_raw(i)?.ok_or_else(|| {
                        FsckError::Corrupt("dentry set runs past the directory".to_string())
                    })?;
                    bytes.extend_from_slice(&entry);
                }
                return Ok(Lookup::Found {
                    dentry_set: DentrySet::from_bytes(bytes)?,
                    dev_offset: iter.device_offset()?,
                    file_offset: iter.file_offset(),
                });
            }
            last_is_free = false;
        } else if dentry_type_here == EXFAT_UNUSED || is_deleted(dentry_type_here) {
            if !last_is_free {
                free_offset = Some((iter.device_offset()?, iter.file_offset()));
                last_is_free = true;
            }
        } else {
            last_is_free = false;
        }

        iter.advance(1)?;
    }

    Ok(not_found(if last_is_free { free_offset } else { None }))
}

/// Look `utf8_name` up in `parent` by comparing the stored UTF-16 name
/// dentries chunk by chunk.
pub fn lookup_file(exfat: &Exfat, parent: &ExfatInode, utf8_name: &str) -> Result<Lookup> {
    let utf16_name: Vec<u16> = utf8_name.encode_utf16().collect();

    let mut filter = |iter: &mut DeIter| filter_lookup_file(iter, &utf16_name);
    lookup_dentry_set(exfat, parent, EXFAT_FILE, Some(&mut filter))
}

fn filter_lookup_file(iter: &mut DeIter, utf16_name: &[u16]) -> Result<Option<usize>> {
    let Some(file_raw) = iter.get_raw(0)? else {
        return Ok(None);
    };
    if file_raw[0] != EXFAT_FILE {
        return Ok(None);
    }
    let file = FileDentry::parse(&file_raw);

    let name_dentries = utf16_name.len().div_ceil(EXFAT_FILE_NAME_LEN);
    if (file.num_ext as usize) < 1 + name_dentries {
        return Ok(None);
    }

    let mut remaining = utf16_name;
    let mut i = 2;
    while i <= file.num_ext as usize && !remaining.is_empty() {
        let name_raw = match iter.get_raw(i) {
            Ok(Some(raw)) => raw,
            _ => return Ok(None),
        };
        if name_raw[0] != EXFAT_NAME {
            return Ok(None);
        }

        let name_dentry = NameDentry::parse(&name_raw);
        let len = remaining.len().min(EXFAT_FILE_NAME_LEN);
        if name_dentry.unicode_0_14[..len] != remaining[..len] {
            return Ok(None);
        }

        remaining = &remaining[len..];
        i += 1;
    }

    Ok(Some(i))
}
