//! End-to-end tests: write images through the full engine, reopen them and
//! verify contents, plus structural checks performed directly on the saved
//! bytes.

use crate::config::{Config, UpdateMode, Version};
use crate::consts::*;
use crate::directory::{DirEntry, ObjType};
use crate::error::CfbError;
use crate::header::Header;
use crate::{shrink, CompoundFile, Item};
use std::collections::HashMap;
use std::io::Cursor;

type MemFile = CompoundFile<Cursor<Vec<u8>>>;

fn new_v3() -> MemFile {
    CompoundFile::create(Cursor::new(Vec::new()), Version::V3).unwrap()
}

fn saved(comp: &mut MemFile) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    comp.save_to(&mut buffer).unwrap();
    buffer.into_inner()
}

fn reopen(image: Vec<u8>) -> MemFile {
    CompoundFile::open(Cursor::new(image)).unwrap()
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().unwrap())
}

/// Structural audit of a saved image, independent of the engine's in-memory
/// state: every non-free FAT entry must belong to exactly one of the known
/// chain families, and stream locations must respect the cutoff.
fn audit_image(image: &[u8]) {
    let header = Header::parse(image).unwrap();
    let sector_size = header.sector_size();
    let sector_count = (image.len() - sector_size) / sector_size;
    let sector = |id: u32| {
        let base = (id as usize + 1) * sector_size;
        &image[base..base + sector_size]
    };

    // Rebuild the DIFAT and FAT from the raw bytes.
    let mut difat_ids = Vec::new();
    let mut current = header.first_difat_sector;
    while current != ENDOFCHAIN && current != FREESECT {
        difat_ids.push(current);
        current = le32(&sector(current)[sector_size - 4..]);
        assert!(difat_ids.len() <= sector_count, "DIFAT chain runs away");
    }
    let mut fat_ids = Vec::new();
    for &id in header.difat.iter() {
        if id == FREESECT {
            break;
        }
        fat_ids.push(id);
    }
    for &difat_id in &difat_ids {
        for chunk in sector(difat_id)[..sector_size - 4].chunks_exact(4) {
            let id = le32(chunk);
            if id == FREESECT {
                break;
            }
            fat_ids.push(id);
        }
    }
    assert_eq!(fat_ids.len() as u32, header.num_fat_sectors);

    let mut fat = Vec::new();
    for &id in &fat_ids {
        for chunk in sector(id).chunks_exact(4) {
            fat.push(le32(chunk));
        }
    }
    assert!(fat.len() >= sector_count);

    let chain_of = |head: u32| -> Vec<u32> {
        let mut ids = Vec::new();
        let mut current = head;
        while current != ENDOFCHAIN {
            assert!(current <= MAXREGSECT, "reserved ID 0x{current:08X} in chain");
            assert!((current as usize) < sector_count, "chain leaves the file");
            assert!(ids.len() <= sector_count, "cyclic chain in image");
            ids.push(current);
            current = fat[current as usize];
        }
        ids
    };

    let mut owner: HashMap<u32, &str> = HashMap::new();
    let mut claim = |ids: &[u32], who: &'static str| {
        for &id in ids {
            if let Some(previous) = owner.insert(id, who) {
                panic!("sector {id} owned by both {previous} and {who}");
            }
        }
    };

    claim(&fat_ids, "fat");
    claim(&difat_ids, "difat");
    for &id in &fat_ids {
        assert_eq!(fat[id as usize], FATSECT);
    }
    for &id in &difat_ids {
        assert_eq!(fat[id as usize], DIFSECT);
    }

    let dir_chain = chain_of(header.first_dir_sector);
    claim(&dir_chain, "directory");

    // Directory records, with the root first.
    let mut entries = Vec::new();
    for &sid in &dir_chain {
        for record in sector(sid).chunks_exact(DIRENTRY_SIZE) {
            entries.push(DirEntry::parse(record, header.version, true).unwrap());
        }
    }
    let root = &entries[0];
    assert_eq!(root.obj_type, ObjType::Root);
    assert_eq!(root.size % MINI_SECTOR_SIZE as u64, 0);
    claim(&chain_of(root.start_sector), "ministream");
    claim(&chain_of(header.first_minifat_sector), "minifat");

    let mut minifat_len = 0u64;
    if header.first_minifat_sector != ENDOFCHAIN {
        minifat_len =
            chain_of(header.first_minifat_sector).len() as u64 * (sector_size as u64 / 4);
    }

    for entry in entries.iter().skip(1) {
        if entry.obj_type != ObjType::Stream {
            continue;
        }
        if entry.size >= header.mini_stream_cutoff as u64 {
            claim(&chain_of(entry.start_sector), "stream");
        } else if entry.size > 0 {
            // Mini streams must point into the mini-FAT, not the FAT.
            assert!((entry.start_sector as u64) < minifat_len);
        } else {
            assert_eq!(entry.start_sector, ENDOFCHAIN);
        }
    }

    if header.version == Version::V4
        && sector_count > RANGE_LOCK_SECTOR_ID as usize
        && fat[RANGE_LOCK_SECTOR_ID as usize] == ENDOFCHAIN
    {
        claim(&[RANGE_LOCK_SECTOR_ID], "rangelock");
    }

    // Every allocated FAT entry must have been claimed by one family.
    for id in 0..sector_count {
        if fat[id] != FREESECT {
            assert!(
                owner.contains_key(&(id as u32)),
                "sector {id} allocated but owned by no chain"
            );
        }
    }
}

// --- scenarios ------------------------------------------------------------

#[test]
fn test_empty_file_layout() {
    let mut comp = new_v3();
    let image = saved(&mut comp);

    // Header plus one directory sector plus one FAT sector.
    assert_eq!(image.len(), 1536);
    assert!(image.len() <= 2048);
    audit_image(&image);

    let comp = reopen(image);
    let root = comp.root_storage();
    assert_eq!(root.name().unwrap(), "Root Entry");
    assert!(root.is_root());
    assert!(comp.root_storage().items().unwrap().is_empty());
}

#[test]
fn test_small_stream_round_trip() {
    let mut comp = new_v3();
    comp.root_storage()
        .add_stream("MyStream")
        .unwrap()
        .set_data(&[0x0Au8; 220])
        .unwrap();

    let image = saved(&mut comp);
    audit_image(&image);

    let comp = reopen(image);
    let data = comp.root_storage().get_stream("MyStream").unwrap().get_data().unwrap();
    assert_eq!(data.len(), 220);
    assert!(data.iter().all(|&b| b == 0x0A));
}

#[test]
fn test_large_stream_forces_difat() {
    let mut comp = new_v3();
    let payload = vec![0u8; 15_345_665];
    comp.root_storage()
        .add_stream("A")
        .unwrap()
        .set_data(&payload)
        .unwrap();

    let image = saved(&mut comp);
    let header = Header::parse(&image).unwrap();
    assert!(header.num_fat_sectors > 109);
    assert!(header.num_difat_sectors >= 1);
    audit_image(&image);

    let comp = reopen(image);
    let data = comp.root_storage().get_stream("A").unwrap().get_data().unwrap();
    assert_eq!(data, payload);
}

#[test]
fn test_rename_and_rename_back() {
    let mut comp = new_v3();
    let root = comp.root_storage();
    root.add_stream("Workbook").unwrap().set_data(b"cell data").unwrap();
    root.add_stream("1Table").unwrap().set_data(b"table").unwrap();
    let image = saved(&mut comp);

    let comp = CompoundFile::open_with(
        Cursor::new(image),
        UpdateMode::ReadOnly,
        Config::default(),
    )
    .unwrap();
    comp.root_storage().rename("Workbook", "Workbuk").unwrap();
    comp.check_tree_invariants();
    let mut comp = comp;
    let image = saved(&mut comp);

    let comp = reopen(image);
    let root = comp.root_storage();
    assert!(root.try_get_stream("Workbook").unwrap().is_none());
    assert_eq!(
        root.get_stream("Workbuk").unwrap().get_data().unwrap(),
        b"cell data"
    );
    root.rename("Workbuk", "Workbook").unwrap();
    comp.check_tree_invariants();
    assert_eq!(
        comp.root_storage()
            .get_stream("Workbook")
            .unwrap()
            .get_data()
            .unwrap(),
        b"cell data"
    );
}

#[test]
fn test_mass_storage_delete_keeps_rest_reachable() {
    let mut comp = new_v3();
    let root = comp.root_storage();
    for i in 1..=99 {
        root.add_storage(&format!("Storage {i}")).unwrap();
    }
    comp.check_tree_invariants();

    for victim in 1..=40 {
        root.delete(&format!("Storage {victim}")).unwrap();
        comp.check_tree_invariants();
        for survivor in victim + 1..=99 {
            root.get_storage(&format!("Storage {survivor}"))
                .unwrap_or_else(|e| {
                    panic!("Storage {survivor} lost after deleting Storage {victim}: {e}")
                });
        }
    }

    let image = saved(&mut comp);
    audit_image(&image);
    let comp = reopen(image);
    let root = comp.root_storage();
    for survivor in 41..=99 {
        root.get_storage(&format!("Storage {survivor}")).unwrap();
    }
    assert_eq!(root.items().unwrap().len(), 59);
}

#[test]
fn test_append_promotes_mini_to_normal_through_commit() {
    let mut comp = new_v3();
    comp.root_storage()
        .add_stream("miniToNormal")
        .unwrap()
        .set_data(&[0xAAu8; 4090])
        .unwrap();
    let image = saved(&mut comp);

    let mut comp = CompoundFile::open_with(
        Cursor::new(image),
        UpdateMode::Update,
        Config::LEAVE_OPEN,
    )
    .unwrap();
    comp.root_storage()
        .get_stream("miniToNormal")
        .unwrap()
        .append(&[0xBBu8; 6])
        .unwrap();
    comp.commit().unwrap();
    let image = comp.close().unwrap().into_inner();
    audit_image(&image);

    let comp = reopen(image);
    let data = comp
        .root_storage()
        .get_stream("miniToNormal")
        .unwrap()
        .get_data()
        .unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data[..4090].iter().all(|&b| b == 0xAA));
    assert!(data[4090..].iter().all(|&b| b == 0xBB));
}

#[test]
fn test_cyclic_fat_chain_is_rejected_without_hanging() {
    let mut comp = new_v3();
    comp.root_storage()
        .add_stream("S")
        .unwrap()
        .set_data(&[7u8; 9000])
        .unwrap();
    let mut image = saved(&mut comp);

    // Make the directory chain's first sector point at itself.
    let header = Header::parse(&image).unwrap();
    let fat_sector = header.difat[0];
    let dir_start = header.first_dir_sector;
    let offset = (fat_sector as usize + 1) * 512 + dir_start as usize * 4;
    image[offset..offset + 4].copy_from_slice(&dir_start.to_le_bytes());

    let strict = CompoundFile::open(Cursor::new(image.clone()));
    assert!(matches!(strict, Err(CfbError::CorruptedFile(_))));

    let lenient = CompoundFile::open_with(
        Cursor::new(image),
        UpdateMode::ReadOnly,
        Config::NO_VALIDATION_EXCEPTION,
    );
    // Either outcome is acceptable; termination is the point.
    let _ = lenient;
}

// --- properties -----------------------------------------------------------

#[test]
fn test_round_trip_boundary_sizes() {
    for &size in &[0usize, 1, 63, 64, 65, 4095, 4096, 4097, 1 << 20] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut comp = new_v3();
        comp.root_storage()
            .add_stream("S")
            .unwrap()
            .set_data(&payload)
            .unwrap();
        let image = saved(&mut comp);
        audit_image(&image);
        let comp = reopen(image);
        let data = comp.root_storage().get_stream("S").unwrap().get_data().unwrap();
        assert_eq!(data, payload, "round trip failed for size {size}");
    }
}

#[test]
fn test_round_trip_twenty_mebibytes() {
    let payload: Vec<u8> = (0..20 << 20).map(|i| (i % 247) as u8).collect();
    let mut comp = new_v3();
    comp.root_storage()
        .add_stream("big")
        .unwrap()
        .set_data(&payload)
        .unwrap();
    let image = saved(&mut comp);
    let comp = reopen(image);
    assert_eq!(
        comp.root_storage().get_stream("big").unwrap().get_data().unwrap(),
        payload
    );
}

#[test]
#[ignore = "allocates several 260 MiB buffers"]
fn test_round_trip_260_mebibytes() {
    let payload: Vec<u8> = (0..260 << 20).map(|i| (i % 239) as u8).collect();
    let mut comp = new_v3();
    comp.root_storage()
        .add_stream("huge")
        .unwrap()
        .set_data(&payload)
        .unwrap();
    let image = saved(&mut comp);
    let comp = reopen(image);
    assert_eq!(
        comp.root_storage().get_stream("huge").unwrap().get_data().unwrap(),
        payload
    );
}

#[test]
fn test_enumeration_matches_invariant_ordering() {
    let names = [
        "delta", "ALPHA", "z", "Echo5", "bravo", "aa", "Charlie", "b2", "Yankee",
    ];
    let mut comp = new_v3();
    let root = comp.root_storage();
    for name in names {
        root.add_stream(name).unwrap();
    }
    root.delete("bravo").unwrap();
    root.delete("z").unwrap();
    comp.check_tree_invariants();

    let mut listed = Vec::new();
    root.visit_entries(false, &mut |item: &Item<_>| {
        listed.push(item.name().unwrap());
    })
    .unwrap();

    let mut expected: Vec<String> = names
        .iter()
        .filter(|&&n| n != "bravo" && n != "z")
        .map(|&n| n.to_string())
        .collect();
    expected.sort_by(|a, b| crate::directory::name_cmp(a, b));
    assert_eq!(listed, expected);
}

#[test]
fn test_visit_entries_recursive_is_level_first() {
    let mut comp = new_v3();
    let root = comp.root_storage();
    let outer = root.add_storage("Outer").unwrap();
    root.add_stream("Top").unwrap();
    outer.add_stream("Inner1").unwrap();
    let deeper = outer.add_storage("Deep").unwrap();
    deeper.add_stream("Bottom").unwrap();

    let mut order = Vec::new();
    root.visit_entries(true, &mut |item: &Item<_>| {
        order.push(item.name().unwrap());
    })
    .unwrap();
    assert_eq!(order, vec!["Top", "Outer", "Deep", "Inner1", "Bottom"]);
}

#[test]
fn test_resize_across_cutoff_preserves_bytes() {
    let mut comp = new_v3();
    let mut stream = comp.root_storage().add_stream("S").unwrap();

    let payload: Vec<u8> = (0..4095).map(|i| (i % 253) as u8).collect();
    stream.set_data(&payload).unwrap();

    // Grow past the cutoff: contents keep their prefix, the rest reads zero.
    stream.resize(4097).unwrap();
    let data = stream.get_data().unwrap();
    assert_eq!(data.len(), 4097);
    assert_eq!(&data[..4095], &payload[..]);
    assert_eq!(&data[4095..], &[0, 0]);

    // Shrink back under the cutoff.
    stream.resize(100).unwrap();
    assert_eq!(stream.get_data().unwrap(), &payload[..100]);

    let image = saved(&mut comp);
    audit_image(&image);
    let comp = reopen(image);
    assert_eq!(
        comp.root_storage().get_stream("S").unwrap().get_data().unwrap(),
        &payload[..100]
    );
}

#[test]
fn test_shrink_drops_freed_space_and_keeps_content() {
    let mut comp = new_v3();
    let root = comp.root_storage();
    root.add_stream("keep").unwrap().set_data(&vec![3u8; 5000]).unwrap();
    root.add_stream("drop").unwrap().set_data(&vec![4u8; 100_000]).unwrap();
    let storage = root.add_storage("Sub").unwrap();
    storage.set_clsid([1; 16]).unwrap();
    storage.add_stream("child").unwrap().set_data(b"leaf").unwrap();
    let image = saved(&mut comp);

    let mut comp = CompoundFile::open_with(
        Cursor::new(image),
        UpdateMode::Update,
        Config::LEAVE_OPEN,
    )
    .unwrap();
    comp.root_storage().delete("drop").unwrap();
    comp.commit().unwrap();
    let mut cursor = comp.close().unwrap();
    let len_before = cursor.get_ref().len();

    shrink(&mut cursor).unwrap();
    let image = cursor.into_inner();
    assert!(image.len() <= len_before);
    assert!(image.len() < len_before - 90_000, "freed space not reclaimed");
    audit_image(&image);

    let comp = reopen(image);
    let root = comp.root_storage();
    assert_eq!(root.get_stream("keep").unwrap().get_data().unwrap(), vec![3u8; 5000]);
    let storage = root.get_storage("Sub").unwrap();
    assert_eq!(storage.clsid().unwrap(), [1; 16]);
    assert_eq!(storage.get_stream("child").unwrap().get_data().unwrap(), b"leaf");
    assert!(root.try_get_stream("drop").unwrap().is_none());
}

#[test]
fn test_shrink_rejects_v4() {
    let mut comp = CompoundFile::create(Cursor::new(Vec::new()), Version::V4).unwrap();
    comp.root_storage().add_stream("S").unwrap().set_data(b"x").unwrap();
    let mut cursor = Cursor::new(saved(&mut comp));
    assert!(matches!(
        shrink(&mut cursor),
        Err(CfbError::InvalidOperation(_))
    ));
}

#[test]
fn test_v4_round_trip() {
    let mut comp = CompoundFile::create(Cursor::new(Vec::new()), Version::V4).unwrap();
    let payload: Vec<u8> = (0..100_000).map(|i| (i % 241) as u8).collect();
    comp.root_storage()
        .add_stream("S")
        .unwrap()
        .set_data(&payload)
        .unwrap();
    let image = saved(&mut comp);
    audit_image(&image);
    let comp = reopen(image);
    assert_eq!(comp.version(), Version::V4);
    assert_eq!(
        comp.root_storage().get_stream("S").unwrap().get_data().unwrap(),
        payload
    );
}

// --- error surface --------------------------------------------------------

#[test]
fn test_handles_disposed_after_close() {
    let comp = new_v3();
    let root = comp.root_storage();
    let mut stream = root.add_stream("S").unwrap();
    assert!(comp.close().is_none());

    assert!(matches!(root.name(), Err(CfbError::Disposed)));
    assert!(matches!(stream.set_data(b"x"), Err(CfbError::Disposed)));
}

#[test]
fn test_leave_open_returns_backing_stream() {
    let comp = CompoundFile::create_with(
        Cursor::new(Vec::new()),
        Version::V3,
        Config::LEAVE_OPEN,
    )
    .unwrap();
    assert!(comp.close().is_some());
}

#[test]
fn test_commit_requires_update_mode() {
    let mut comp = new_v3();
    comp.root_storage().add_stream("S").unwrap();
    let image = saved(&mut comp);

    let mut comp = CompoundFile::open(Cursor::new(image)).unwrap();
    // In-memory mutation is accepted in read-only mode...
    comp.root_storage().add_stream("T").unwrap();
    // ...but committing is not.
    assert!(matches!(
        comp.commit(),
        Err(CfbError::InvalidOperation(_))
    ));
}

#[test]
fn test_name_validation_on_add() {
    let comp = new_v3();
    let root = comp.root_storage();
    assert!(matches!(
        root.add_stream(""),
        Err(CfbError::InvalidArgument(_))
    ));
    assert!(matches!(
        root.add_stream(&"n".repeat(32)),
        Err(CfbError::InvalidArgument(_))
    ));
    assert!(matches!(
        root.add_stream("bad/name"),
        Err(CfbError::InvalidArgument(_))
    ));
}

#[test]
fn test_duplicate_and_not_found() {
    let comp = new_v3();
    let root = comp.root_storage();
    root.add_stream("Twice").unwrap();
    assert!(matches!(
        root.add_stream("Twice"),
        Err(CfbError::DuplicatedItem(_))
    ));
    // The ordering is case-invariant, so this collides too.
    assert!(matches!(
        root.add_stream("TWICE"),
        Err(CfbError::DuplicatedItem(_))
    ));
    assert!(matches!(
        root.get_stream("Missing"),
        Err(CfbError::NotFound(_))
    ));
    assert!(matches!(
        root.delete("Missing"),
        Err(CfbError::NotFound(_))
    ));
}

#[test]
fn test_not_a_compound_file() {
    let result = CompoundFile::open(Cursor::new(vec![0u8; 4096]));
    assert!(matches!(result, Err(CfbError::BadSignature)));
    assert!(!crate::is_compound_file(&[0u8; 4096]));
}

#[test]
fn test_storage_metadata_round_trip() {
    let mut comp = new_v3();
    let root = comp.root_storage();
    let storage = root.add_storage("Meta").unwrap();
    storage.set_clsid([9; 16]).unwrap();
    storage.set_state_bits(0xF00D).unwrap();
    assert!(storage.creation_time().unwrap().is_some());

    let image = saved(&mut comp);
    let comp = reopen(image);
    let storage = comp.root_storage().get_storage("Meta").unwrap();
    assert_eq!(storage.clsid().unwrap(), [9; 16]);
    assert_eq!(storage.state_bits().unwrap(), 0xF00D);
    assert!(storage.creation_time().unwrap().is_some());
}

#[test]
fn test_stream_io_traits() {
    use std::io::{Read, Seek, SeekFrom, Write};

    let comp = new_v3();
    let mut stream = comp.root_storage().add_stream("S").unwrap();
    stream.write_all(b"hello world").unwrap();
    stream.seek(SeekFrom::Start(6)).unwrap();
    let mut tail = String::new();
    stream.read_to_string(&mut tail).unwrap();
    assert_eq!(tail, "world");

    stream.seek(SeekFrom::End(-5)).unwrap();
    stream.write_all(b"WORLD").unwrap();
    let mut all = Vec::new();
    stream.seek(SeekFrom::Start(0)).unwrap();
    stream.read_to_end(&mut all).unwrap();
    assert_eq!(all, b"hello WORLD");
}

#[test]
fn test_sector_recycling_keeps_file_size_stable() {
    let comp = CompoundFile::create_with(
        Cursor::new(Vec::new()),
        Version::V3,
        Config::SECTOR_RECYCLE | Config::LEAVE_OPEN,
    )
    .unwrap();
    let root = comp.root_storage();
    let payload = vec![0x55u8; 100_000];
    root.add_stream("churn").unwrap().set_data(&payload).unwrap();
    let mut comp = comp;
    let first = saved(&mut comp).len();

    // Churn: delete and recreate the same stream several times.
    for _ in 0..5 {
        let root = comp.root_storage();
        root.delete("churn").unwrap();
        root.add_stream("churn").unwrap().set_data(&payload).unwrap();
    }
    let image = saved(&mut comp);
    assert_eq!(image.len(), first, "recycling should not grow the image");
    audit_image(&image);
    let comp = reopen(image);
    assert_eq!(
        comp.root_storage().get_stream("churn").unwrap().get_data().unwrap(),
        payload
    );
}

#[test]
fn test_copy_from() {
    let comp = new_v3();
    let root = comp.root_storage();
    let mut source = root.add_stream("src").unwrap();
    source.set_data(&vec![0xEEu8; 10_000]).unwrap();
    let mut target = root.add_stream("dst").unwrap();
    target.copy_from(&source).unwrap();
    assert_eq!(target.get_data().unwrap(), vec![0xEEu8; 10_000]);
}

#[test]
fn test_on_disk_create_edit_shrink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("container.cfb");

    let mut comp = CompoundFile::create_path(&path, Version::V3).unwrap();
    comp.root_storage()
        .add_stream("payload")
        .unwrap()
        .set_data(&vec![0x42u8; 30_000])
        .unwrap();
    comp.commit().unwrap();
    drop(comp);

    let mut comp = CompoundFile::open_path_update(&path).unwrap();
    let root = comp.root_storage();
    root.get_stream("payload").unwrap().resize(500).unwrap();
    root.add_stream("note").unwrap().set_data(b"hello disk").unwrap();
    comp.commit().unwrap();
    drop(comp);

    crate::shrink_path(&path).unwrap();

    let comp = CompoundFile::open_path(&path).unwrap();
    let root = comp.root_storage();
    assert_eq!(root.get_stream("payload").unwrap().get_data().unwrap(), vec![0x42u8; 500]);
    assert_eq!(root.get_stream("note").unwrap().get_data().unwrap(), b"hello disk");
}

#[test]
fn test_deep_hierarchy_round_trip() {
    let mut comp = new_v3();
    let mut storage = comp.root_storage();
    for depth in 0..8 {
        storage = storage.add_storage(&format!("Level{depth}")).unwrap();
        storage
            .add_stream("payload")
            .unwrap()
            .set_data(format!("depth {depth}").as_bytes())
            .unwrap();
    }

    let image = saved(&mut comp);
    audit_image(&image);
    let comp = reopen(image);
    let mut storage = comp.root_storage();
    for depth in 0..8 {
        storage = storage.get_storage(&format!("Level{depth}")).unwrap();
        assert_eq!(
            storage.get_stream("payload").unwrap().get_data().unwrap(),
            format!("depth {depth}").as_bytes()
        );
    }
}
