// SPDX-License-Identifier: MPL-2.0

mod common;

use std::sync::Arc;

use common::*;
use exfat_fsck::{
    create::{alloc_cluster, create_file},
    dev::RamDev,
    fs::Exfat,
    fsck::{
        run_fsck, Fsck, FSCK_EXIT_CORRECTED, FSCK_EXIT_ERRORS_LEFT, FSCK_EXIT_NO_ERRORS,
    },
    lookup::{lookup_file, Lookup},
    repair::Repair,
    super_block::boot_region_check,
    RepairMode,
};

fn ram(image: Vec<u8>) -> Arc<RamDev> {
    Arc::new(RamDev::new(image, SECTOR_SIZE as u32))
}

fn make_fsck(dev: &Arc<RamDev>, mode: RepairMode) -> Fsck {
    let mut repair = Repair::new(mode);
    let (bs_raw, bs) = boot_region_check(dev.as_ref(), &mut repair).unwrap();
    Fsck::new(Exfat::new(dev.clone(), bs_raw, &bs), repair)
}

#[test]
fn test_clean_empty_volume() {
    let dev = ram(ImageBuilder::new().finish());

    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.check().unwrap();

    // Exactly the bitmap, upcase and root clusters are allocated, and the
    // checker agrees with the stored bitmap.
    for cluster in 2..2 + CLUSTER_COUNT {
        let expected = matches!(cluster, BITMAP_CLUSTER | UPCASE_CLUSTER | ROOT_CLUSTER);
        assert_eq!(fsck.exfat.alloc_bitmap.get(cluster), expected, "{}", cluster);
    }
    assert_eq!(
        fsck.exfat.alloc_bitmap.as_bytes(),
        fsck.exfat.disk_bitmap.as_bytes()
    );
    assert!(!fsck.repair.dirty);
    assert!(!fsck.repair.dirty_fat);
    assert_eq!(fsck.exfat.volume_label, "TESTVOL");
    assert_eq!(dev.write_count(), 0);

    let dev = ram(ImageBuilder::new().finish());
    assert_eq!(
        run_fsck(dev, "test", RepairMode::No),
        FSCK_EXIT_NO_ERRORS
    );
}

#[test]
fn test_clean_volume_with_chained_file() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("DATA.BIN", ATTR_ARCHIVE, &[10, 11, 12], 3 * 512, false);
    let dev = ram(builder.finish());

    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.check().unwrap();

    for cluster in [BITMAP_CLUSTER, UPCASE_CLUSTER, ROOT_CLUSTER, 10, 11, 12] {
        assert!(fsck.exfat.alloc_bitmap.get(cluster), "{}", cluster);
    }
    assert!(!fsck.exfat.alloc_bitmap.get(13));
    assert_eq!(fsck.stats.file_count, 1);
    assert_eq!(fsck.stats.error_count, 0);
    assert_eq!(dev.write_count(), 0);
}

#[test]
fn test_contiguous_file_skips_the_fat() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("NOFAT.BIN", ATTR_ARCHIVE, &[20, 21, 22], 3 * 512, true);
    let dev = ram(builder.finish());

    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.check().unwrap();

    for cluster in [20, 21, 22] {
        assert!(fsck.exfat.alloc_bitmap.get(cluster));
        // No FAT chain was ever written for the file.
        assert_eq!(read_u32(&dev.snapshot(), fat_entry_off(cluster)), 0);
    }
    assert_eq!(fsck.stats.error_count, 0);
}

#[test]
fn test_checksum_repair() {
    let mut builder = ImageBuilder::new();
    let set_off = builder.add_root_file("HELLO.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let good = read_u16(builder.image_mut(), set_off + 2);
    let bad = good.wrapping_add(1);
    builder.image_mut()[set_off + 2..set_off + 4].copy_from_slice(&bad.to_le_bytes());
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );

    let image = dev.snapshot();
    assert_eq!(read_u16(&image, set_off + 2), good);
    // The volume-dirty flag was cleared on the way out.
    assert_eq!(read_u16(&image, 106) & 0x0002, 0);

    assert_eq!(
        run_fsck(dev, "test", RepairMode::No),
        FSCK_EXIT_NO_ERRORS
    );
}

#[test]
fn test_checksum_error_left_in_report_only_mode() {
    let mut builder = ImageBuilder::new();
    let set_off = builder.add_root_file("HELLO.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let good = read_u16(builder.image_mut(), set_off + 2);
    builder.image_mut()[set_off + 2..set_off + 4]
        .copy_from_slice(&good.wrapping_add(1).to_le_bytes());
    let image = builder.finish();
    let dev = ram(image.clone());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::No),
        FSCK_EXIT_ERRORS_LEFT
    );
    assert_eq!(dev.write_count(), 0);
    assert_eq!(dev.snapshot(), image);
}

#[test]
fn test_smaller_size_truncates_chain() {
    let mut builder = ImageBuilder::new();
    // size says 2 clusters, the chain has 4.
    let set_off = builder.add_root_file("BIG.BIN", ATTR_ARCHIVE, &[10, 11, 12, 13], 2 * 512, false);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );

    let image = dev.snapshot();
    assert_eq!(read_u32(&image, fat_entry_off(11)), EOC);
    assert_eq!(read_u32(&image, fat_entry_off(12)), 0);
    assert_eq!(read_u32(&image, fat_entry_off(13)), 0);

    let stream = stream_at(&image, set_off);
    assert_eq!(stream.size, 2 * 512);
    assert_eq!(stream.start_clu, 10);

    // Clusters 10..14 map to bits 8..12 of the stored bitmap; 12 and 13
    // went back to free.
    assert_eq!(image[cluster_off(BITMAP_CLUSTER) + 1], 0b0000_0011);

    assert_eq!(
        run_fsck(dev, "test", RepairMode::Yes),
        FSCK_EXIT_NO_ERRORS
    );
}

#[test]
fn test_duplicated_cluster_truncates_second_file() {
    let mut builder = ImageBuilder::new();
    let first_off = builder.add_root_file("A.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let second_off = builder.add_root_file("B.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );

    let image = dev.snapshot();
    let first = stream_at(&image, first_off);
    assert_eq!(first.size, 512);
    assert_eq!(first.start_clu, 10);

    let second = stream_at(&image, second_off);
    assert_eq!(second.size, 0);
    assert_eq!(second.valid_size, 0);
    assert_eq!(second.start_clu, 0);

    // The shared cluster still belongs to the first file.
    assert_eq!(read_u32(&image, fat_entry_off(10)), EOC);
    assert_eq!(image[cluster_off(BITMAP_CLUSTER) + 1] & 0x01, 0x01);
}

#[test]
fn test_boot_region_restored_from_backup() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("KEEP.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let mut image = builder.finish();
    // Corrupt the main boot sector only; the backup at sector 12 is intact.
    image[3..11].copy_from_slice(b"NOTFS   ");
    let dev = ram(image);

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );

    let image = dev.snapshot();
    assert_eq!(&image[3..11], b"EXFAT   ");
    assert_eq!(image[112], 0xFF);
}

#[test]
fn test_corrupted_boot_region_without_repair_fails() {
    let mut image = ImageBuilder::new().finish();
    image[3..11].copy_from_slice(b"NOTFS   ");
    let dev = ram(image);

    assert_eq!(
        run_fsck(dev, "test", RepairMode::No),
        FSCK_EXIT_ERRORS_LEFT
    );
}

#[test]
fn test_valid_size_above_size_is_lowered() {
    let mut builder = ImageBuilder::new();
    let mut dset = builder.file_dentry_set("V.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let mut stream = dset.stream();
    stream.valid_size = 1024;
    dset.set_stream(&stream);
    dset.update_checksum();
    let bytes = dset.as_bytes().to_vec();
    let set_off = builder.push_root_entries(&bytes);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );

    let stream = stream_at(&dev.snapshot(), set_off);
    assert_eq!(stream.valid_size, 512);
    assert_eq!(stream.size, 512);
}

#[test]
fn test_zero_size_nofat_flag_cleared() {
    let mut builder = ImageBuilder::new();
    let dset = builder.file_dentry_set("Z.TXT", ATTR_ARCHIVE, &[], 0, true);
    let bytes = dset.as_bytes().to_vec();
    let set_off = builder.push_root_entries(&bytes);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );

    let stream = stream_at(&dev.snapshot(), set_off);
    assert_eq!(stream.flags & 0x02, 0);
    assert!(!stream.is_contiguous());

    assert_eq!(
        run_fsck(dev, "test", RepairMode::No),
        FSCK_EXIT_NO_ERRORS
    );
}

#[test]
fn test_auto_mode_fixes_safe_errors_only() {
    // A checksum error is preen-safe, a bogus chain is not.
    let mut builder = ImageBuilder::new();
    let good_off = builder.add_root_file("OK.TXT", ATTR_ARCHIVE, &[10], 512, false);
    let good = read_u16(builder.image_mut(), good_off + 2);
    builder.image_mut()[good_off + 2..good_off + 4]
        .copy_from_slice(&good.wrapping_add(1).to_le_bytes());
    builder.add_root_file("BAD.BIN", ATTR_ARCHIVE, &[12, 13], 512, false);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Auto),
        FSCK_EXIT_ERRORS_LEFT
    );

    let image = dev.snapshot();
    // The checksum was fixed, the oversized chain was left alone.
    assert_eq!(read_u16(&image, good_off + 2), good);
    assert_eq!(read_u32(&image, fat_entry_off(12)), 13);
}

#[test]
fn test_directory_size_not_multiple_of_cluster() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("SUBDIR", ATTR_DIRECTORY, &[10, 11], 700, false);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev, "test", RepairMode::Yes),
        FSCK_EXIT_ERRORS_LEFT
    );
}

#[test]
fn test_root_chain_loop_detected() {
    let mut builder = ImageBuilder::new();
    builder.set_fat(ROOT_CLUSTER, ROOT_CLUSTER);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev, "test", RepairMode::No),
        FSCK_EXIT_ERRORS_LEFT
    );
}

#[test]
fn test_corrupted_upcase_table_fails_root_check() {
    let mut image = ImageBuilder::new().finish();
    image[cluster_off(UPCASE_CLUSTER)] ^= 0xFF;
    let dev = ram(image);

    assert_eq!(
        run_fsck(dev, "test", RepairMode::No),
        FSCK_EXIT_ERRORS_LEFT
    );
}

#[test]
fn test_subdirectory_traversal() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("SUB", ATTR_DIRECTORY, &[10], 512, false);
    // One file inside the subdirectory, occupying cluster 20.
    let dset = builder.file_dentry_set("INNER.TXT", ATTR_ARCHIVE, &[20], 512, false);
    let inner = dset.as_bytes().to_vec();
    let off = cluster_off(10);
    builder.image_mut()[off..off + inner.len()].copy_from_slice(&inner);
    let dev = ram(builder.finish());

    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.check().unwrap();

    assert_eq!(fsck.stats.dir_count, 2);
    assert_eq!(fsck.stats.file_count, 1);
    assert!(fsck.exfat.alloc_bitmap.get(10));
    assert!(fsck.exfat.alloc_bitmap.get(20));
    assert_eq!(fsck.stats.error_count, 0);
}

#[test]
fn test_directory_spanning_two_clusters() {
    let mut builder = ImageBuilder::new();
    builder.grow_root(5);
    for i in 0..9u32 {
        let dset = builder.file_dentry_set(
            &format!("FILE{}.TXT", i),
            ATTR_ARCHIVE,
            &[10 + i],
            512,
            false,
        );
        let bytes = dset.as_bytes().to_vec();
        builder.push_root_entries_spanning(5, &bytes);
    }
    let dev = ram(builder.finish());

    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.check().unwrap();
    assert_eq!(fsck.stats.file_count, 9);
    assert_eq!(fsck.stats.error_count, 0);
    for i in 0..9u32 {
        assert!(fsck.exfat.alloc_bitmap.get(10 + i));
    }

    // A fresh context for lookups; FILE4's set crosses the cluster
    // boundary, FILE7 lives entirely in the second cluster.
    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.root_dir_check().unwrap();
    let root = fsck.exfat.root.unwrap();

    for name in ["FILE4.TXT", "FILE7.TXT"] {
        match lookup_file(&fsck.exfat, fsck.exfat.arena.get(root), name).unwrap() {
            Lookup::Found { dentry_set, .. } => {
                assert_eq!(String::from_utf16_lossy(&dentry_set.name()), name);
            }
            Lookup::NotFound { .. } => panic!("{} not found", name),
        }
    }

    match lookup_file(&fsck.exfat, fsck.exfat.arena.get(root), "FILE7.TXT").unwrap() {
        Lookup::Found { dev_offset, .. } => {
            let second_cluster = cluster_off(5) as u64..(cluster_off(5) + CLUSTER_SIZE) as u64;
            assert!(second_cluster.contains(&dev_offset));
        }
        Lookup::NotFound { .. } => panic!("FILE7.TXT not found"),
    }
}

#[test]
fn test_lookup_reports_free_slot() {
    let dev = ram(ImageBuilder::new().finish());
    let mut fsck = make_fsck(&dev, RepairMode::No);
    fsck.root_dir_check().unwrap();
    let root = fsck.exfat.root.unwrap();

    match lookup_file(&fsck.exfat, fsck.exfat.arena.get(root), "NOPE.TXT").unwrap() {
        Lookup::Found { .. } => panic!("unexpected match"),
        Lookup::NotFound {
            free_dev_offset,
            free_file_offset,
        } => {
            // The free run starts right after label, bitmap and upcase.
            assert_eq!(free_dev_offset, Some((cluster_off(ROOT_CLUSTER) + 96) as u64));
            assert_eq!(free_file_offset, Some(96));
        }
    }
}

#[test]
fn test_create_file_in_root() {
    let dev = ram(ImageBuilder::new().finish());
    let mut fsck = make_fsck(&dev, RepairMode::Yes);
    fsck.root_dir_check().unwrap();
    let root = fsck.exfat.root.unwrap();

    let (dset, dev_offset) = create_file(&mut fsck.exfat, root, "NEW.TXT", ATTR_ARCHIVE).unwrap();
    assert_eq!(dev_offset, (cluster_off(ROOT_CLUSTER) + 96) as u64);
    assert!(dset.verify_checksum());

    let image = dev.snapshot();
    let start = dev_offset as usize;
    assert_eq!(&image[start..start + dset.as_bytes().len()], dset.as_bytes());

    // Creating the same file again finds the existing set.
    let (again, again_offset) =
        create_file(&mut fsck.exfat, root, "NEW.TXT", ATTR_ARCHIVE).unwrap();
    assert_eq!(again_offset, dev_offset);
    assert_eq!(again.as_bytes(), dset.as_bytes());
}

#[test]
fn test_alloc_cluster_wraps_around() {
    let dev = ram(ImageBuilder::new().finish());
    let mut fsck = make_fsck(&dev, RepairMode::Yes);
    fsck.root_dir_check().unwrap();
    let root = fsck.exfat.root.unwrap();

    // Everything from the hint to the end of the heap is taken; the search
    // must wrap to the low clusters.
    fsck.exfat.start_clu = Some(60);
    for cluster in 60..2 + CLUSTER_COUNT {
        fsck.exfat.alloc_bitmap.set(cluster);
    }

    let new_clu = alloc_cluster(&mut fsck.exfat, root, false).unwrap();
    assert_eq!(new_clu, 5);
    assert_eq!(fsck.exfat.start_clu, Some(5));
    assert!(fsck.exfat.alloc_bitmap.get(5));

    let image = dev.snapshot();
    assert_eq!(read_u32(&image, fat_entry_off(5)), EOC);
    // The root chain now links to the fresh cluster.
    assert_eq!(read_u32(&image, fat_entry_off(ROOT_CLUSTER)), 5);
    assert_eq!(fsck.exfat.arena.get(root).size, 2 * 512);
}

#[test]
fn test_add_dentry_set_splits_at_cluster_boundary() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("A.TXT", ATTR_ARCHIVE, &[10], 512, false);
    builder.add_root_file("LONGNAME_16CHARS", ATTR_ARCHIVE, &[11], 512, false);
    builder.add_root_file("LONGNAME_16CHAR2", ATTR_ARCHIVE, &[12], 512, false);
    let dev = ram(builder.finish());

    let mut fsck = make_fsck(&dev, RepairMode::Yes);
    fsck.root_dir_check().unwrap();
    let root = fsck.exfat.root.unwrap();

    // 14 of 16 root entries are used; a 3-entry set forces a split: two
    // entries in the old cluster, one in the freshly allocated one.
    let (dset, _) = create_file(&mut fsck.exfat, root, "SPLIT.TXT", ATTR_ARCHIVE).unwrap();
    let bytes = dset.as_bytes();

    let image = dev.snapshot();
    let head = cluster_off(ROOT_CLUSTER) + 14 * 32;
    assert_eq!(&image[head..head + 64], &bytes[..64]);
    let tail = cluster_off(5);
    assert_eq!(&image[tail..tail + 32], &bytes[64..]);
    assert_eq!(read_u32(&image, fat_entry_off(ROOT_CLUSTER)), 5);

    // The split set reads back as one contiguous entry stream.
    match lookup_file(&fsck.exfat, fsck.exfat.arena.get(root), "SPLIT.TXT").unwrap() {
        Lookup::Found { dentry_set, .. } => {
            assert_eq!(dentry_set.as_bytes(), bytes);
        }
        Lookup::NotFound { .. } => panic!("SPLIT.TXT not found"),
    }
}

#[test]
fn test_second_run_is_idempotent() {
    let mut builder = ImageBuilder::new();
    builder.add_root_file("BIG.BIN", ATTR_ARCHIVE, &[10, 11, 12, 13], 2 * 512, false);
    let dev = ram(builder.finish());

    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_CORRECTED
    );
    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::Yes),
        FSCK_EXIT_NO_ERRORS
    );

    // A report-only pass over the repaired volume writes nothing.
    let writes_before = dev.write_count();
    assert_eq!(
        run_fsck(dev.clone(), "test", RepairMode::No),
        FSCK_EXIT_NO_ERRORS
    );
    assert_eq!(dev.write_count(), writes_before);
}
