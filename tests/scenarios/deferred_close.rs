//! Closing one handle must not drop another handle's locks

use crate::common::*;
use strata_lock::testing::SimulatedHost;
use strata_lock::{LockKind, SHARED_FIRST};

#[test]
fn test_closing_sibling_keeps_process_lock() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (p1, p2) = (Proc::new(&host), Proc::new(&host));

    let mut a = p1.open(scratch.path());
    a.set_lock(LockLevel::Shared).unwrap();
    let mut b = p1.open(scratch.path());
    b.close().unwrap();

    let snap = a.record().unwrap().snapshot();
    assert_eq!(snap.n_ref, 1);
    assert_eq!(snap.parked, 1);
    assert_eq!(p1.registry.closed_descriptors(), 0);
    assert_eq!(p1.stats().released_descriptors, 0);

    let raw = scratch.raw();
    assert_eq!(host.holders(&raw, SHARED_FIRST), vec![(p1.pid(), LockKind::Read)]);

    // Another process still sees the reader.
    let mut writer = p2.open(scratch.path());
    climb(&mut writer, LockLevel::Reserved).unwrap();
    assert!(writer.set_lock(LockLevel::Exclusive).unwrap_err().is_busy());
    writer.lower_lock(LockLevel::Unlocked).unwrap();

    // The last unlock closes what was parked.
    a.lower_lock(LockLevel::Unlocked).unwrap();
    assert_eq!(a.record().unwrap().snapshot().parked, 0);
    assert_eq!(p1.registry.closed_descriptors(), 1);
}

#[test]
fn test_parked_descriptor_reused_on_open() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let p = Proc::new(&host);

    let mut anchor = p.open(scratch.path());
    anchor.set_lock(LockLevel::Shared).unwrap();
    let mut first = p.open(scratch.path());
    first.close().unwrap();
    assert_eq!(anchor.record().unwrap().snapshot().parked, 1);

    let mut second = p.open(scratch.path());
    assert_eq!(anchor.record().unwrap().snapshot().parked, 0);
    assert_eq!(anchor.record().unwrap().snapshot().n_ref, 2);
    second.set_lock(LockLevel::Shared).unwrap();
    assert_eq!(anchor.record().unwrap().snapshot().n_shared, 2);

    // A read-only open cannot take a read-write descriptor.
    second.close().unwrap();
    let ro = p.open_with(scratch.path(), OpenFlags::read_only(), FsCapabilities::default());
    assert_eq!(anchor.record().unwrap().snapshot().parked, 1);
    drop(ro);
}

#[test]
fn test_last_close_drops_record_and_locks() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let p = Proc::new(&host);

    let mut handles: Vec<DbFile> = (0..4).map(|_| p.open(scratch.path())).collect();
    for db in &mut handles {
        db.set_lock(LockLevel::Shared).unwrap();
    }
    assert_eq!(p.registry.open_records(), 1);

    for mut db in handles {
        db.close().unwrap();
        db.close().unwrap();
    }
    assert_eq!(p.registry.open_records(), 0);
    assert_eq!(host.bytes_held(&scratch.raw(), p.pid()), 0);
    assert_eq!(p.registry.closed_descriptors(), 4);
}
