//! Reader/writer protocol across simulated processes

use crate::common::*;
use strata_lock::testing::SimulatedHost;
use strata_lock::{LockKind, SHARED_FIRST, SHARED_SIZE};

// ============================================================================
// Escalation
// ============================================================================

#[test]
fn test_writer_drains_readers_then_wins() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (p1, p2, p3) = (Proc::new(&host), Proc::new(&host), Proc::new(&host));

    let mut reader = p1.open(scratch.path());
    let mut writer = p2.open(scratch.path());
    reader.set_lock(LockLevel::Shared).unwrap();
    climb(&mut writer, LockLevel::Reserved).unwrap();

    assert!(writer.set_lock(LockLevel::Exclusive).unwrap_err().is_busy());
    assert_eq!(writer.lock_level(), LockLevel::Pending);

    // Pending turns away new readers so the writer cannot starve.
    let mut late = p3.open(scratch.path());
    assert!(late.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    assert_eq!(late.lock_level(), LockLevel::Unlocked);

    reader.lower_lock(LockLevel::Unlocked).unwrap();
    writer.set_lock(LockLevel::Exclusive).unwrap();
    assert_eq!(writer.lock_level(), LockLevel::Exclusive);

    assert!(reader.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    writer.lower_lock(LockLevel::Unlocked).unwrap();
    late.set_lock(LockLevel::Shared).unwrap();
}

#[test]
fn test_single_reserved_holder() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (p1, p2) = (Proc::new(&host), Proc::new(&host));

    let mut a = p1.open(scratch.path());
    let mut b = p2.open(scratch.path());
    climb(&mut a, LockLevel::Reserved).unwrap();

    b.set_lock(LockLevel::Shared).unwrap();
    assert!(b.set_lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert!(b.check_reserved().unwrap());
    assert!(a.check_reserved().unwrap());

    a.lower_lock(LockLevel::Shared).unwrap();
    assert!(!b.check_reserved().unwrap());
    b.set_lock(LockLevel::Reserved).unwrap();
}

#[test]
fn test_downgrade_readmits_readers() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (p1, p2) = (Proc::new(&host), Proc::new(&host));

    let mut writer = p1.open(scratch.path());
    let mut reader = p2.open(scratch.path());
    climb(&mut writer, LockLevel::Exclusive).unwrap();
    assert!(reader.set_lock(LockLevel::Shared).unwrap_err().is_busy());

    writer.lower_lock(LockLevel::Shared).unwrap();
    reader.set_lock(LockLevel::Shared).unwrap();

    let raw = scratch.raw();
    assert_eq!(
        host.holders(&raw, SHARED_FIRST),
        vec![(p1.pid(), LockKind::Read), (p2.pid(), LockKind::Read)]
    );
}

#[test]
fn test_split_downgrade_on_nfs() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let p = Proc::new(&host);
    let nfs = FsCapabilities {
        kind: FsKind::Nfs,
        range_locks: true,
    };

    let mut db = p.open_with(scratch.path(), OpenFlags::read_write(), nfs);
    climb(&mut db, LockLevel::Exclusive).unwrap();
    db.lower_lock(LockLevel::Shared).unwrap();

    let raw = scratch.raw();
    assert_eq!(
        host.holders(&raw, SHARED_FIRST),
        vec![(p.pid(), LockKind::Read)]
    );
    assert!(host.holders(&raw, SHARED_FIRST + SHARED_SIZE - 1).is_empty());

    // The handle is an ordinary reader again.
    db.set_lock(LockLevel::Reserved).unwrap();
    db.set_lock(LockLevel::Exclusive).unwrap();
    db.lower_lock(LockLevel::Unlocked).unwrap();
    assert_eq!(host.bytes_held(&raw, p.pid()), 0);
}

// ============================================================================
// Exclusive-process mode
// ============================================================================

#[test]
fn test_exclusive_process_takes_one_os_lock() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let (owner, other) = (Proc::new(&host), Proc::new(&host));
    let flags = OpenFlags::read_write().with_exclusive_process(true);

    let mut a = owner.open_with(scratch.path(), flags, FsCapabilities::default());
    let before = owner.stats();
    climb(&mut a, LockLevel::Exclusive).unwrap();
    a.lower_lock(LockLevel::Shared).unwrap();
    climb(&mut a, LockLevel::Exclusive).unwrap();
    assert_eq!(owner.stats().lock_calls - before.lock_calls, 1);
    assert_eq!(owner.stats().unlock_calls, before.unlock_calls);

    let mut b = other.open(scratch.path());
    assert!(b.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    assert!(a.record().unwrap().snapshot().process_lock);
}
