//! Shared index between a writer and readers in other processes

use crate::common::*;
use strata_lock::testing::SimulatedHost;
use strata_lock::{shm_path, LockKind, SHM_DMS};

const WRITE_SLOT: u32 = 0;
const READ_SLOT: u32 = 3;

#[test]
fn test_writer_publishes_header_to_reader() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (p1, p2) = (Proc::new(&host), Proc::new(&host));

    let mut writer = p1.open(scratch.path());
    let mut reader = p2.open(scratch.path());

    let w_region = writer.shm_map(0, DEFAULT_REGION_SIZE, true).unwrap().unwrap();
    writer.shm_lock(WRITE_SLOT, 1, ShmLockMode::Exclusive).unwrap();
    w_region.write(0, &42u32.to_le_bytes()).unwrap();
    writer.shm_barrier();
    writer.shm_unlock(WRITE_SLOT, 1, ShmLockMode::Exclusive).unwrap();

    let r_region = reader.shm_map(0, DEFAULT_REGION_SIZE, false).unwrap().unwrap();
    reader.shm_lock(READ_SLOT, 1, ShmLockMode::Shared).unwrap();
    reader.shm_barrier();
    let mut buf = [0u8; 4];
    r_region.read(0, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 42);

    // A checkpointer wanting every read slot waits for the reader.
    assert!(writer
        .shm_lock(1, 7, ShmLockMode::Exclusive)
        .unwrap_err()
        .is_busy());
    reader.shm_unlock(READ_SLOT, 1, ShmLockMode::Shared).unwrap();
    writer.shm_lock(1, 7, ShmLockMode::Exclusive).unwrap();
    writer.shm_unlock(1, 7, ShmLockMode::Exclusive).unwrap();
}

#[test]
fn test_index_reinitialized_after_last_process_leaves() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();

    {
        let p1 = Proc::new(&host);
        let mut db = p1.open(scratch.path());
        db.shm_map(1, DEFAULT_REGION_SIZE, true)
            .unwrap()
            .unwrap()
            .write(0, b"stale")
            .unwrap();
        db.close().unwrap();
    }
    assert!(shm_path(scratch.path()).exists());

    // Nobody holds the deadman byte, so the next opener starts fresh.
    let p2 = Proc::new(&host);
    let mut db = p2.open(scratch.path());
    assert!(db.shm_map(0, DEFAULT_REGION_SIZE, false).unwrap().is_none());
    assert_eq!(std::fs::metadata(shm_path(scratch.path())).unwrap().len(), 3);

    let shm = std::fs::File::open(shm_path(scratch.path())).unwrap();
    assert_eq!(host.holders(&shm, SHM_DMS), vec![(p2.pid(), LockKind::Read)]);
}

#[test]
fn test_index_survives_while_any_process_attached() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (p1, p2) = (Proc::new(&host), Proc::new(&host));

    let mut first = p1.open(scratch.path());
    first
        .shm_map(0, DEFAULT_REGION_SIZE, true)
        .unwrap()
        .unwrap()
        .write(8, b"live")
        .unwrap();

    let mut second = p2.open(scratch.path());
    second.shm_map(0, DEFAULT_REGION_SIZE, false).unwrap().unwrap();
    first.close().unwrap();

    // A third process joins while the second keeps the index alive.
    let p3 = Proc::new(&host);
    let mut third = p3.open(scratch.path());
    let region = third.shm_map(0, DEFAULT_REGION_SIZE, false).unwrap().unwrap();
    let mut buf = [0u8; 4];
    region.read(8, &mut buf).unwrap();
    assert_eq!(&buf, b"live");

    second.shm_unmap(true).unwrap();
    third.shm_unmap(true).unwrap();
    assert!(!shm_path(scratch.path()).exists());
}
