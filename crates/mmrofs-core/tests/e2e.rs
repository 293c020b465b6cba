//! End-to-end scenarios over the RAM-backed flash device.

use mmrofs_core::{Clock, ManualClock, Mmrofs, MountConfig, OpenMode, RecoveryReport};
use mmrofs_error::MmrofsError;
use mmrofs_flash::{FileNorFlash, RamNorFlash};
use mmrofs_ondisk::{Entry, EntryState};
use mmrofs_types::{DATA_REGION_START, ENTRY_SIZE, MAX_ENTRIES, fnv1a32};
use std::io::SeekFrom;
use std::sync::Arc;

const PARTITION_SIZE: usize = 0x10000 + 64 * 4096;
const EPOCH: u32 = 1_700_000_000;

fn mount_at(dev: &Arc<RamNorFlash>, clock: &Arc<ManualClock>) -> (Mmrofs, RecoveryReport) {
    Mmrofs::mount(dev.clone(), MountConfig::default(), clock.clone()).expect("mount")
}

fn fresh() -> (Mmrofs, Arc<RamNorFlash>, Arc<ManualClock>) {
    let dev = RamNorFlash::new(PARTITION_SIZE);
    let clock = Arc::new(ManualClock::new(EPOCH));
    let (fs, _) = mount_at(&dev, &clock);
    (fs, dev, clock)
}

fn write_file(fs: &Mmrofs, path: &str, data: &[u8]) {
    let fd = fs.open(path, OpenMode::WriteCreate).expect("open for write");
    assert_eq!(fs.write(fd, data).expect("write"), data.len());
    fs.close(fd).expect("close");
}

fn read_all(fs: &Mmrofs, path: &str) -> Vec<u8> {
    let fd = fs.open(path, OpenMode::ReadOnly).expect("open for read");
    let mut out = Vec::new();
    let mut buf = [0_u8; 300];
    loop {
        let n = fs.read(fd, &mut buf).expect("read");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.close(fd).expect("close");
    out
}

fn list_names(fs: &Mmrofs) -> Vec<String> {
    let dir = fs.opendir().expect("opendir");
    let mut names = Vec::new();
    while let Some(entry) = fs.readdir(dir).expect("readdir") {
        names.push(entry.name);
    }
    fs.closedir(dir).expect("closedir");
    names
}

fn header_entries(dev: &RamNorFlash) -> Vec<(u16, Entry)> {
    let image = dev.snapshot();
    (0..MAX_ENTRIES)
        .map(|index| {
            let at = usize::from(index) * ENTRY_SIZE;
            let mut raw = [0_u8; ENTRY_SIZE];
            raw.copy_from_slice(&image[at..at + ENTRY_SIZE]);
            (index, Entry::decode(&raw))
        })
        .filter(|(_, e)| e.state != EntryState::Free as u8)
        .collect()
}

fn find_entry_by_name<'a>(
    entries: &'a [(u16, Entry)],
    name: &str,
    state: EntryState,
) -> Option<&'a (u16, Entry)> {
    let hash = fnv1a32(name.as_bytes());
    entries
        .iter()
        .find(|(_, e)| e.state == state as u8 && e.name_hash == hash)
}

// ── Scenario 1: create, close, reopen, read ─────────────────────────────────

#[test]
fn create_close_remount_read() {
    let (fs, dev, clock) = fresh();
    fs.create("demo.txt", b"Hello World").unwrap();
    drop(fs);

    let (fs, report) = mount_at(&dev, &clock);
    assert_eq!(report.live_entries, 1);
    assert_eq!(read_all(&fs, "demo.txt"), b"Hello World");
    let meta = fs.stat("/demo.txt").unwrap();
    assert_eq!(meta.size, 11);
    assert_eq!(meta.ctime, EPOCH);
    assert_eq!(meta.mtime, EPOCH);
    assert_eq!(dev.bit_raise_attempts(), 0);
}

#[test]
fn handle_write_then_read_without_remount() {
    let (fs, dev, _) = fresh();
    write_file(&fs, "hello.bin", b"payload bytes");
    assert_eq!(read_all(&fs, "hello.bin"), b"payload bytes");
    assert_eq!(dev.bit_raise_attempts(), 0);
}

// ── Scenario 2: append ──────────────────────────────────────────────────────

#[test]
fn append_reuses_offset_and_tombstones_old_slot() {
    let (fs, dev, _) = fresh();
    write_file(&fs, "log.txt", b"ABC");

    let fd = fs.open("log.txt", OpenMode::ReadWrite).unwrap();
    assert_eq!(fs.write(fd, b"DE").unwrap(), 2);
    fs.close(fd).unwrap();

    assert_eq!(read_all(&fs, "log.txt"), b"ABCDE");

    let entries = header_entries(&dev);
    let (_, valid) = find_entry_by_name(&entries, "log.txt", EntryState::Valid)
        .expect("new slot is VALID");
    assert_eq!(valid.size, u32::try_from("log.txt".len()).unwrap() + 5);
    let (_, old) = find_entry_by_name(&entries, "log.txt", EntryState::Tombstone)
        .expect("original slot is TOMBSTONE");
    // In-place append: both generations share the data offset.
    assert_eq!(old.offset, valid.offset);
    assert_eq!(dev.bit_raise_attempts(), 0);
}

// ── Scenario 3: streaming unknown size ──────────────────────────────────────

#[test]
fn streaming_writes_resolve_capacity_mask_at_close() {
    let (fs, dev, _) = fresh();
    let payload: Vec<u8> = (0..4500_u32).map(|i| (i % 251) as u8).collect();

    let fd = fs.open("log.bin", OpenMode::WriteCreate).unwrap();
    assert_eq!(fs.write(fd, &payload[..2000]).unwrap(), 2000);

    // Mid-stream the size word is a capacity mask.
    let entries = header_entries(&dev);
    let (_, active) = find_entry_by_name(&entries, "log.bin", EntryState::Active)
        .expect("streaming entry is ACTIVE");
    assert!(active.has_capacity_mask());

    assert_eq!(fs.write(fd, &payload[2000..4000]).unwrap(), 2000);
    assert_eq!(fs.write(fd, &payload[4000..]).unwrap(), 500);
    fs.close(fd).unwrap();

    let entries = header_entries(&dev);
    let (_, valid) = find_entry_by_name(&entries, "log.bin", EntryState::Valid)
        .expect("closed entry is VALID");
    assert_eq!(valid.size, 4500 + u32::try_from("log.bin".len()).unwrap());

    assert_eq!(read_all(&fs, "log.bin"), payload);
    assert_eq!(dev.bit_raise_attempts(), 0);
}

// ── Round-trip properties ───────────────────────────────────────────────────

#[test]
fn rename_preserves_content_and_removes_source() {
    let (fs, dev, _) = fresh();
    fs.create("a.txt", b"alpha contents").unwrap();
    fs.create("b.txt", b"beta contents").unwrap();

    fs.rename("a.txt", "b.txt").unwrap();
    assert_eq!(read_all(&fs, "b.txt"), b"alpha contents");
    assert!(matches!(
        fs.open("a.txt", OpenMode::ReadOnly),
        Err(MmrofsError::NotFound(_))
    ));
    assert_eq!(list_names(&fs), vec!["b.txt".to_owned()]);

    // Rename to a fresh name as well.
    fs.rename("b.txt", "c.txt").unwrap();
    assert_eq!(read_all(&fs, "c.txt"), b"alpha contents");
    assert_eq!(dev.bit_raise_attempts(), 0);
}

#[test]
fn unlink_survives_remount() {
    let (fs, dev, clock) = fresh();
    fs.create("gone.txt", b"data").unwrap();
    fs.create("kept.txt", b"data").unwrap();
    fs.unlink("gone.txt").unwrap();
    drop(fs);

    let (fs, _) = mount_at(&dev, &clock);
    assert!(matches!(
        fs.stat("gone.txt"),
        Err(MmrofsError::NotFound(_))
    ));
    assert_eq!(list_names(&fs), vec!["kept.txt".to_owned()]);
}

#[test]
fn create_replaces_existing_content() {
    let (fs, _, _) = fresh();
    fs.create("cfg.json", b"{\"v\":1}").unwrap();
    fs.create("cfg.json", b"{\"version\":2}").unwrap();
    assert_eq!(read_all(&fs, "cfg.json"), b"{\"version\":2}");
    assert_eq!(list_names(&fs).len(), 1);
}

// ── Boundary behaviours ─────────────────────────────────────────────────────

#[test]
fn zero_byte_file() {
    let (fs, dev, clock) = fresh();
    fs.create("empty", b"").unwrap();
    assert_eq!(read_all(&fs, "empty"), b"");
    assert_eq!(fs.stat("empty").unwrap().size, 0);
    drop(fs);
    let (fs, _) = mount_at(&dev, &clock);
    assert_eq!(read_all(&fs, "empty"), b"");
}

#[test]
fn sizes_around_the_block_boundary() {
    let (fs, dev, clock) = fresh();
    // Name "a" (1 byte): totals of 4095, 4096, and 4097 on-flash bytes.
    for (path, data_len) in [("a", 4094_usize), ("b", 4095), ("c", 4096)] {
        let payload: Vec<u8> = (0..data_len).map(|i| (i % 17) as u8 + 1).collect();
        let fd = fs.open(path, OpenMode::WriteCreate).unwrap();
        assert_eq!(fs.write(fd, &payload).unwrap(), data_len);
        fs.close(fd).unwrap();
        assert_eq!(read_all(&fs, path), payload);
    }
    drop(fs);
    let (fs, _) = mount_at(&dev, &clock);
    assert_eq!(read_all(&fs, "a").len(), 4094);
    assert_eq!(read_all(&fs, "b").len(), 4095);
    assert_eq!(read_all(&fs, "c").len(), 4096);
    assert_eq!(dev.bit_raise_attempts(), 0);
}

#[test]
fn trailing_ff_bytes_survive_on_valid_entries() {
    let (fs, dev, clock) = fresh();
    let mut payload = b"binary-tail".to_vec();
    payload.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
    fs.create("raw.bin", &payload).unwrap();
    drop(fs);

    // VALID entries are not size-recovered; the 0xFF tail is kept.
    let (fs, report) = mount_at(&dev, &clock);
    assert_eq!(report.sizes_repaired, 0);
    assert_eq!(read_all(&fs, "raw.bin"), payload);
}

#[test]
fn filename_length_extremes() {
    let (fs, _, _) = fresh();
    let short = "x";
    let long = "n".repeat(255);
    fs.create(short, b"one").unwrap();
    fs.create(&long, b"two-five-five").unwrap();
    assert_eq!(read_all(&fs, short), b"one");
    assert_eq!(read_all(&fs, &long), b"two-five-five");

    let too_long = "n".repeat(256);
    assert!(matches!(
        fs.create(&too_long, b"no"),
        Err(MmrofsError::InvalidArgument(_))
    ));
}

#[test]
fn single_file_no_tombstones_survives_mount() {
    let (fs, dev, clock) = fresh();
    fs.create("only.txt", b"solo").unwrap();
    drop(fs);
    let (fs, report) = mount_at(&dev, &clock);
    assert_eq!(report.live_entries, 1);
    assert_eq!(report.sizes_finalized + report.sizes_repaired, 0);
    assert_eq!(read_all(&fs, "only.txt"), b"solo");
}

// ── Directory handles ───────────────────────────────────────────────────────

#[test]
fn readdir_lists_in_slot_order_with_unfinalized_mtime_zero() {
    let (fs, _, _) = fresh();
    fs.create("first", b"1").unwrap();
    fs.create("second", b"22").unwrap();

    // A streaming writer in flight: visible, but with mtime reported 0.
    let fd = fs.open("third", OpenMode::WriteCreate).unwrap();
    fs.write(fd, b"333").unwrap();

    let dir = fs.opendir().unwrap();
    let mut seen = Vec::new();
    while let Some(entry) = fs.readdir(dir).unwrap() {
        seen.push(entry);
    }
    fs.closedir(dir).unwrap();

    assert_eq!(
        seen.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["first", "second", "third"]
    );
    assert!(seen.windows(2).all(|w| w[0].slot < w[1].slot));
    assert_eq!(seen[0].mtime, EPOCH);
    assert_eq!(seen[2].mtime, 0);

    fs.close(fd).unwrap();
}

#[test]
fn dir_handle_pool_is_bounded() {
    let (fs, _, _) = fresh();
    let first = fs.opendir().unwrap();
    let _second = fs.opendir().unwrap();
    assert!(matches!(fs.opendir(), Err(MmrofsError::NoFreeHandle)));
    fs.closedir(first).unwrap();
    let third = fs.opendir().unwrap();
    fs.closedir(third).unwrap();
}

// ── Seek ────────────────────────────────────────────────────────────────────

#[test]
fn seek_moves_the_read_cursor() {
    let (fs, _, _) = fresh();
    fs.create("s.txt", b"0123456789").unwrap();
    let fd = fs.open("s.txt", OpenMode::ReadOnly).unwrap();

    assert_eq!(fs.seek(fd, SeekFrom::Start(4)).unwrap(), 4);
    let mut buf = [0_u8; 2];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"45");

    assert_eq!(fs.seek(fd, SeekFrom::End(-2)).unwrap(), 8);
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"89");

    assert_eq!(fs.seek(fd, SeekFrom::Current(-4)).unwrap(), 6);
    assert!(matches!(
        fs.seek(fd, SeekFrom::Start(11)),
        Err(MmrofsError::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.seek(fd, SeekFrom::Current(-100)),
        Err(MmrofsError::InvalidArgument(_))
    ));
    fs.close(fd).unwrap();
}

#[test]
fn seek_rejected_on_write_only_handles() {
    let (fs, _, _) = fresh();
    let fd = fs.open("w.txt", OpenMode::WriteCreate).unwrap();
    fs.write(fd, b"data").unwrap();
    assert!(matches!(
        fs.seek(fd, SeekFrom::Start(0)),
        Err(MmrofsError::NotSeekable)
    ));
    fs.close(fd).unwrap();
}

// ── Handle-layer preconditions ──────────────────────────────────────────────

#[test]
fn second_writer_is_rejected_while_first_is_open() {
    let (fs, _, _) = fresh();
    let fd = fs.open("busy.bin", OpenMode::WriteCreate).unwrap();
    fs.write(fd, b"stream").unwrap();

    // The committed streaming entry is pinned by the first handle.
    assert!(matches!(
        fs.open("busy.bin", OpenMode::WriteCreate),
        Err(MmrofsError::Busy)
    ));
    fs.close(fd).unwrap();

    let fd = fs.open("busy.bin", OpenMode::ReadWrite).unwrap();
    fs.close(fd).unwrap();
}

#[test]
fn orphaned_streaming_entry_blocks_writes_until_recovery() {
    let (fs, dev, clock) = fresh();
    let fd = fs.open("orphan.bin", OpenMode::WriteCreate).unwrap();
    fs.write(fd, b"half-finished").unwrap();

    // Power-cut the finalize: the entry stays ACTIVE with a capacity mask
    // and no handle owns the ground-truth size.
    dev.fail_after_programs(0);
    assert!(fs.close(fd).is_err());
    dev.clear_fault();

    assert!(matches!(
        fs.open("orphan.bin", OpenMode::ReadOnly),
        Err(MmrofsError::SizeUnavailable)
    ));
    let fd = fs.open("orphan.bin", OpenMode::ReadWrite).unwrap();
    assert!(matches!(
        fs.write(fd, b"more"),
        Err(MmrofsError::SizeUnavailable)
    ));
    fs.close(fd).unwrap();

    // Recovery resolves the mask; the file is usable again.
    drop(fs);
    let (fs, report) = mount_at(&dev, &clock);
    assert_eq!(report.sizes_finalized, 1);
    assert_eq!(read_all(&fs, "orphan.bin"), b"half-finished");
}

#[test]
fn unlink_blocked_by_open_reader() {
    let (fs, _, _) = fresh();
    fs.create("pinned", b"data").unwrap();
    let fd = fs.open("pinned", OpenMode::ReadOnly).unwrap();
    assert!(matches!(fs.unlink("pinned"), Err(MmrofsError::Busy)));
    fs.close(fd).unwrap();
    fs.unlink("pinned").unwrap();
}

#[test]
fn open_errors() {
    let (fs, _, _) = fresh();
    assert!(matches!(
        fs.open("missing", OpenMode::ReadOnly),
        Err(MmrofsError::NotFound(_))
    ));
    assert!(matches!(
        fs.open("missing", OpenMode::ReadWrite),
        Err(MmrofsError::NotFound(_))
    ));
    assert!(matches!(
        fs.open("", OpenMode::ReadOnly),
        Err(MmrofsError::InvalidArgument(_))
    ));

    // FD table exhaustion.
    fs.create("f", b"x").unwrap();
    let config_limit = MountConfig::default().max_open_files;
    let fds: Vec<_> = (0..config_limit)
        .map(|_| fs.open("f", OpenMode::ReadOnly).unwrap())
        .collect();
    assert!(matches!(
        fs.open("f", OpenMode::ReadOnly),
        Err(MmrofsError::NoFreeHandle)
    ));
    for fd in fds {
        fs.close(fd).unwrap();
    }
}

#[test]
fn write_on_read_only_handle_is_rejected() {
    let (fs, _, _) = fresh();
    fs.create("ro", b"x").unwrap();
    let fd = fs.open("ro", OpenMode::ReadOnly).unwrap();
    assert!(matches!(fs.write(fd, b"y"), Err(MmrofsError::ReadOnly)));
    fs.close(fd).unwrap();
    // A closed descriptor no longer resolves.
    assert!(matches!(
        fs.read(fd, &mut [0; 4]),
        Err(MmrofsError::BadHandle)
    ));
}

// ── Space exhaustion ────────────────────────────────────────────────────────

#[test]
fn no_space_is_reported_and_nothing_is_lost() {
    let (fs, _, _) = fresh();
    // Data region is 64 blocks; a 70-block file cannot fit.
    let huge = vec![0x5A_u8; 70 * 4096];
    assert!(matches!(
        fs.create("huge", &huge),
        Err(MmrofsError::NoSpace)
    ));
    assert!(list_names(&fs).is_empty());

    fs.create("ok", b"fits").unwrap();
    assert_eq!(read_all(&fs, "ok"), b"fits");
}

// ── Reclamation ─────────────────────────────────────────────────────────────

#[test]
fn defragment_moves_files_into_earlier_gaps() {
    let (fs, dev, _) = fresh();
    let big: Vec<u8> = vec![0x11; 3 * 4096];
    fs.create("big", &big).unwrap();
    fs.create("small", b"keep me").unwrap();
    fs.unlink("big").unwrap();

    let before = header_entries(&dev);
    let (_, small_before) = find_entry_by_name(&before, "small", EntryState::Valid).unwrap();
    assert!(small_before.offset > DATA_REGION_START);

    assert_eq!(fs.defragment_data().unwrap(), 1);

    let after = header_entries(&dev);
    let (_, small_after) = find_entry_by_name(&after, "small", EntryState::Valid).unwrap();
    assert_eq!(small_after.offset, DATA_REGION_START);
    assert_eq!(read_all(&fs, "small"), b"keep me");
    assert_eq!(dev.bit_raise_attempts(), 0);

    // Fixpoint: nothing left to move.
    assert_eq!(fs.defragment_data().unwrap(), 0);
}

#[test]
fn entry_table_compaction_keeps_churn_working() {
    let (fs, dev, _) = fresh();
    // Every create consumes a fresh slot; with 2048 slots this churns
    // through the whole table and forces header-page reclamation.
    for round in 0..2200_u32 {
        let body = round.to_le_bytes();
        fs.create("churn.bin", &body).unwrap();
        if round % 2 == 0 {
            fs.unlink("churn.bin").unwrap();
        }
    }
    assert_eq!(read_all(&fs, "churn.bin"), 2199_u32.to_le_bytes());
    assert_eq!(dev.bit_raise_attempts(), 0);
}

#[test]
fn explicit_compaction_relocates_live_entries_and_patches_handles() {
    let (fs, dev, _) = fresh();
    // Fill page 0 with tombstones, then land one live entry on it.
    for _ in 0..127 {
        fs.create("tmp", b"t").unwrap();
        fs.unlink("tmp").unwrap();
    }
    fs.create("keeper", b"precious bytes").unwrap();

    let entries = header_entries(&dev);
    let (keeper_slot, _) = find_entry_by_name(&entries, "keeper", EntryState::Valid).unwrap();
    assert!(*keeper_slot < 128, "keeper sits on the first header page");

    // A pinned read handle must survive the relocation.
    let fd = fs.open("keeper", OpenMode::ReadOnly).unwrap();
    assert!(fs.compact_entries().unwrap());

    let entries = header_entries(&dev);
    let (new_slot, _) = find_entry_by_name(&entries, "keeper", EntryState::Valid).unwrap();
    assert!(*new_slot >= 128, "keeper relocated off the erased page");
    assert!(
        entries.iter().all(|(index, _)| *index >= 128),
        "first header page is FREE again"
    );

    let mut buf = [0_u8; 32];
    let n = fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"precious bytes");
    fs.close(fd).unwrap();
    assert_eq!(dev.bit_raise_attempts(), 0);
}

// ── Clock bootstrap ─────────────────────────────────────────────────────────

#[test]
fn implausible_clock_is_seeded_from_live_timestamps() {
    let (fs, dev, clock) = fresh();
    clock.set_unix(EPOCH + 500);
    fs.create("stamped", b"tick").unwrap();
    drop(fs);

    let cold_clock = Arc::new(ManualClock::new(0));
    let (_fs, _) = mount_at(&dev, &cold_clock);
    assert_eq!(cold_clock.now_unix(), EPOCH + 500);
}

#[test]
fn plausible_clock_is_left_alone() {
    let (fs, dev, _) = fresh();
    fs.create("stamped", b"tick").unwrap();
    drop(fs);

    let warm_clock = Arc::new(ManualClock::new(EPOCH + 10_000));
    let (_fs, _) = mount_at(&dev, &warm_clock);
    assert_eq!(warm_clock.now_unix(), EPOCH + 10_000);
}

// ── File-backed device ──────────────────────────────────────────────────────

#[test]
fn file_backed_image_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmrofs.img");
    let clock = Arc::new(ManualClock::new(EPOCH));

    let dev = Arc::new(FileNorFlash::create(&path, PARTITION_SIZE as u64).unwrap());
    let (fs, _) = Mmrofs::mount(dev, MountConfig::default(), clock.clone()).unwrap();
    fs.create("persist.txt", b"on disk").unwrap();
    drop(fs);

    let dev = Arc::new(FileNorFlash::open(&path).unwrap());
    let (fs, report) = Mmrofs::mount(dev, MountConfig::default(), clock).unwrap();
    assert_eq!(report.live_entries, 1);
    assert_eq!(read_all(&fs, "persist.txt"), b"on disk");
}

// ── Mount validation ────────────────────────────────────────────────────────

#[test]
fn undersized_partition_is_rejected() {
    let dev = RamNorFlash::new(0x10000);
    let clock = Arc::new(ManualClock::new(EPOCH));
    assert!(matches!(
        Mmrofs::mount(dev, MountConfig::default(), clock),
        Err(MmrofsError::Format(_))
    ));
}

#[test]
fn unaligned_partition_is_rejected() {
    let dev = RamNorFlash::new(0x10000 + 4096 + 100);
    let clock = Arc::new(ManualClock::new(EPOCH));
    assert!(matches!(
        Mmrofs::mount(dev, MountConfig::default(), clock),
        Err(MmrofsError::Format(_))
    ));
}
