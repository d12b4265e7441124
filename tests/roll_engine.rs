//! Roll Engine Tests
//!
//! Committed deltas reach their master locations, whole sectors at a time,
//! and the log head moves past them:
//! - Fully overwritten sectors are written without a master read
//! - Partly overwritten sectors merge with the master contents
//! - A current cached image replaces the master read
//! - A full log rolls itself empty instead of failing the commit

use std::sync::Arc;

use samwal::device::{MasterSet, MemDevice};
use samwal::log::{
    DeltaKind, DeltaPayload, DeltaRange, LogConfig, LogUnit, SyncMode, TransactionContext,
    MIN_ROLL_BUFFERS,
};

// =============================================================================
// Test Utilities
// =============================================================================

const BLOCK: u64 = 8192;
const SECTOR: usize = 512;

fn no_roll() -> LogConfig {
    LogConfig {
        no_roll: true,
        ..LogConfig::default()
    }
}

fn mount_with(config: LogConfig, log_size: u64, master: Arc<MemDevice>) -> (Arc<MemDevice>, LogUnit) {
    let log = Arc::new(MemDevice::new(log_size as usize));
    LogUnit::format(log.clone(), log_size, &config).unwrap();
    let unit = LogUnit::mount(log.clone(), MasterSet::single(master), config).unwrap();
    (log, unit)
}

fn commit(unit: &LogUnit, writes: &[(u64, u8, usize)]) {
    let mut ctx = TransactionContext::new();
    unit.begin_sync(&mut ctx, SyncMode::Normal, 2048).unwrap();
    for &(offset, fill, len) in writes {
        unit.declare_delta(
            &mut ctx,
            DeltaRange::new(0, offset, len as u64),
            DeltaKind::Inode,
            DeltaPayload::Bytes(vec![fill; len]),
        )
        .unwrap();
    }
    unit.end_sync(&mut ctx).unwrap();
}

// =============================================================================
// Sector Handling
// =============================================================================

#[test]
fn test_full_sector_rolls_without_master_read() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (_log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(BLOCK, 7, SECTOR)]);

    master.clear_stats();
    unit.request_roll(true).unwrap();

    let snap = unit.metrics().snapshot();
    assert_eq!(snap.roll_reads, 0);
    assert_eq!(snap.roll_writes, 1);
    assert_eq!(master.read_count(), 0);
    assert_eq!(master.write_log(), vec![(BLOCK, SECTOR)]);
    assert!(master.snapshot()[BLOCK as usize..BLOCK as usize + SECTOR]
        .iter()
        .all(|b| *b == 7));
}

#[test]
fn test_partial_sector_merges_master_contents() {
    let master = Arc::new(MemDevice::from_bytes(vec![0xEE; 1 << 20]));
    let (_log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(100, 1, 10)]);

    unit.request_roll(true).unwrap();

    let image = master.snapshot();
    assert!(image[..100].iter().all(|b| *b == 0xEE));
    assert!(image[100..110].iter().all(|b| *b == 1));
    assert!(image[110..SECTOR].iter().all(|b| *b == 0xEE));
    assert_eq!(unit.metrics().snapshot().roll_reads, 1);
}

#[test]
fn test_deltas_rolled_per_kind() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (_log, unit) = mount_with(no_roll(), 1 << 18, master);

    let mut ctx = TransactionContext::new();
    unit.begin_sync(&mut ctx, SyncMode::Normal, 2048).unwrap();
    unit.declare_delta(
        &mut ctx,
        DeltaRange::new(0, 0, 64),
        DeltaKind::Superblock,
        DeltaPayload::Bytes(vec![1; 64]),
    )
    .unwrap();
    unit.declare_delta(
        &mut ctx,
        DeltaRange::new(0, 2 * BLOCK, 64),
        DeltaKind::Directory,
        DeltaPayload::Bytes(vec![2; 64]),
    )
    .unwrap();
    unit.end_sync(&mut ctx).unwrap();
    unit.request_roll(true).unwrap();

    let snap = unit.metrics().snapshot();
    assert_eq!(snap.rolled(DeltaKind::Superblock), 1);
    assert_eq!(snap.rolled(DeltaKind::Directory), 1);
    assert_eq!(snap.deltas_rolled, 2);
    assert_eq!(snap.bytes_rolled, 128);
}

// =============================================================================
// Passes and Trimming
// =============================================================================

#[test]
fn test_passes_bounded_by_buffer_pool() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let config = LogConfig {
        roll_buffers: MIN_ROLL_BUFFERS,
        ..no_roll()
    };
    let (_log, unit) = mount_with(config, 1 << 18, master.clone());
    for i in 0..10u64 {
        commit(&unit, &[(i * BLOCK, i as u8 + 1, SECTOR)]);
    }

    unit.request_roll(true).unwrap();

    // Ten blocks through four buffers take three passes.
    assert!(unit.metrics().snapshot().roll_passes >= 3);
    let image = master.snapshot();
    for i in 0..10u64 {
        assert_eq!(image[(i * BLOCK) as usize], i as u8 + 1);
    }
}

#[test]
fn test_trim_leaves_nothing_to_replay() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(0, 3, 64)]);
    commit(&unit, &[(BLOCK, 4, 64)]);

    let before = unit.header().head_lsn;
    unit.request_roll(true).unwrap();
    assert!(unit.header().head_lsn > before);
    assert!(unit.metrics().snapshot().log_trims >= 1);

    // Crash right here: the remount finds an empty log.
    let log_copy = Arc::new(log.crash_copy());
    let master_copy = Arc::new(master.crash_copy());
    drop(unit);
    let remounted = LogUnit::mount(log_copy, MasterSet::single(master_copy.clone()), no_roll()).unwrap();
    assert_eq!(remounted.recovery_report().epochs_replayed, 0);
    assert_eq!(remounted.recovery_report().next_tid, 3);
    assert_eq!(master_copy.snapshot()[BLOCK as usize], 4);
}

#[test]
fn test_small_log_rolls_to_make_room() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (_log, unit) = mount_with(no_roll(), 1 << 15, master.clone());

    for i in 0..60u64 {
        commit(&unit, &[(i * SECTOR as u64, (i % 200 + 1) as u8, SECTOR)]);
    }

    assert!(unit.metrics().snapshot().log_trims > 0);
    for i in 0..60u64 {
        let bytes = unit.read(0, i * SECTOR as u64, SECTOR).unwrap();
        assert!(bytes.iter().all(|b| *b == (i % 200 + 1) as u8), "sector {}", i);
    }
    unit.unmount().unwrap();
}

#[test]
fn test_background_thread_drains_on_unmount() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (_log, unit) = mount_with(LogConfig::default(), 1 << 18, master.clone());
    commit(&unit, &[(0, 9, 64), (3 * BLOCK, 8, 64)]);

    unit.request_roll(true).unwrap();
    assert_eq!(master.snapshot()[0], 9);

    commit(&unit, &[(5 * BLOCK, 6, 64)]);
    unit.unmount().unwrap();
    assert_eq!(master.snapshot()[(5 * BLOCK) as usize], 6);
}

// =============================================================================
// Cached Roll Buffers
// =============================================================================

#[test]
fn test_cached_image_replaces_master_read() {
    let master = Arc::new(MemDevice::from_bytes(vec![0xEE; 1 << 20]));
    let (_log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(BLOCK + 10, 5, 20)]);

    let mut image = vec![0xCC; BLOCK as usize];
    image[10..30].fill(5);
    unit.register_crb(0, BLOCK, image).unwrap();

    master.clear_stats();
    unit.request_roll(true).unwrap();

    let snap = unit.metrics().snapshot();
    assert_eq!(snap.crb_hits, 1);
    assert_eq!(snap.roll_reads, 0);
    assert_eq!(master.read_count(), 0);

    // Only the touched sector comes from the image.
    let bytes = master.snapshot();
    let base = BLOCK as usize;
    assert!(bytes[base..base + 10].iter().all(|b| *b == 0xCC));
    assert!(bytes[base + 10..base + 30].iter().all(|b| *b == 5));
    assert!(bytes[base + SECTOR..base + 2 * SECTOR].iter().all(|b| *b == 0xEE));
}

#[test]
fn test_cached_image_with_uncommitted_change_ignored() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (_log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(0, 1, 64)]);

    // Declared but not committed; the image below already holds it.
    let mut ctx = TransactionContext::new();
    unit.begin_sync(&mut ctx, SyncMode::Normal, 1024).unwrap();
    unit.declare_delta(
        &mut ctx,
        DeltaRange::new(0, 1024, 16),
        DeltaKind::Inode,
        DeltaPayload::Bytes(vec![9; 16]),
    )
    .unwrap();

    let mut image = vec![0u8; BLOCK as usize];
    image[..64].fill(1);
    image[1024..1040].fill(9);
    unit.register_crb(0, 0, image).unwrap();

    unit.request_roll(true).unwrap();
    let snap = unit.metrics().snapshot();
    assert_eq!(snap.crb_hits, 0);
    assert_eq!(snap.roll_reads, 1);
    assert_eq!(master.snapshot()[1024], 0);

    unit.end_sync(&mut ctx).unwrap();
    unit.release_crb(0, 0);
    unit.request_roll(true).unwrap();
    assert_eq!(master.snapshot()[1024], 9);
}

#[test]
fn test_adjacent_deltas_and_cached_block_take_two_writes() {
    let master = Arc::new(MemDevice::new(1 << 20));
    let (_log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(0, 1, 100), (100, 2, 100), (200, 3, 100), (4 * BLOCK, 4, 64)]);

    let mut image = vec![0u8; BLOCK as usize];
    image[..64].fill(4);
    unit.register_crb(0, 4 * BLOCK, image).unwrap();

    master.clear_stats();
    unit.request_roll(true).unwrap();

    let snap = unit.metrics().snapshot();
    assert_eq!(snap.roll_writes, 2);
    assert_eq!(snap.crb_hits, 1);
    let mut writes = master.write_log();
    writes.sort();
    assert_eq!(writes, vec![(0, SECTOR), (4 * BLOCK, SECTOR)]);

    let bytes = master.snapshot();
    assert!(bytes[..100].iter().all(|b| *b == 1));
    assert!(bytes[100..200].iter().all(|b| *b == 2));
    assert!(bytes[200..300].iter().all(|b| *b == 3));
    assert!(bytes[(4 * BLOCK) as usize..(4 * BLOCK) as usize + 64].iter().all(|b| *b == 4));
}

#[test]
fn test_rolling_twice_gives_same_masters() {
    let master = Arc::new(MemDevice::from_bytes(vec![0x11; 1 << 20]));
    let (log, unit) = mount_with(no_roll(), 1 << 18, master.clone());
    commit(&unit, &[(10, 1, 30), (BLOCK + 700, 2, 900)]);
    commit(&unit, &[(20, 3, 5)]);

    // First roll lands on the masters, then a crash before anything else.
    let unrolled_log = Arc::new(log.crash_copy());
    unit.request_roll(true).unwrap();
    let once = master.snapshot();
    drop(unit);

    // Replaying the same epochs over already rolled masters changes nothing.
    let rolled_again = Arc::new(MemDevice::from_bytes(once.clone()));
    let remounted = LogUnit::mount(unrolled_log, MasterSet::single(rolled_again.clone()), no_roll()).unwrap();
    assert_eq!(remounted.recovery_report().epochs_replayed, 2);
    assert_eq!(rolled_again.snapshot(), once);
}
