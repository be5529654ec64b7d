//! Opening through the facade with `strata-lock.toml`

use std::time::Duration;

use crate::common::*;
use strata_lock::LockStyle;

#[test]
fn test_default_config_uses_byte_range_locks() {
    let scratch = Scratch::new();
    let mut db = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    assert_eq!(db.style(), LockStyle::Posix);

    climb(&mut db, LockLevel::Exclusive).unwrap();
    let snap = db.record().unwrap().snapshot();
    assert_eq!(snap.level, LockLevel::Exclusive);

    let mut other = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    assert!(other.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    db.close().unwrap();
    other.set_lock(LockLevel::Shared).unwrap();
}

#[test]
fn test_no_lock_style_never_conflicts() {
    let scratch = Scratch::new();
    scratch.write_config("lock_style = \"none\"\n");

    let mut a = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    let mut b = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    assert_eq!(a.style(), LockStyle::NoLock);
    climb(&mut a, LockLevel::Exclusive).unwrap();
    climb(&mut b, LockLevel::Exclusive).unwrap();
    assert!(!b.check_reserved().unwrap());
    assert!(a.record().is_none());
}

#[test]
fn test_flock_style_excludes_other_descriptors() {
    let scratch = Scratch::new();
    scratch.write_config("lock_style = \"flock\"\n");

    let mut a = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    let mut b = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    assert_eq!(a.style(), LockStyle::Flock);

    a.set_lock(LockLevel::Shared).unwrap();
    assert!(b.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    assert!(b.check_reserved().unwrap());

    a.lower_lock(LockLevel::Unlocked).unwrap();
    climb(&mut b, LockLevel::Exclusive).unwrap();

    assert!(matches!(
        a.shm_map(0, DEFAULT_REGION_SIZE, true),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_busy_timeout_reaches_handle() {
    let scratch = Scratch::new();
    let db = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    assert_eq!(db.busy_timeout(), None);

    scratch.write_config("busy_timeout_ms = 250\n");
    let mut patient = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    assert_eq!(patient.busy_timeout(), Some(Duration::from_millis(250)));

    // A sibling at Exclusive in this process makes the patient handle wait
    // out its whole budget before reporting Busy.
    let mut writer = strata_lock::open(scratch.path(), OpenFlags::read_write()).unwrap();
    climb(&mut writer, LockLevel::Exclusive).unwrap();
    let started = std::time::Instant::now();
    assert!(patient.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    assert!(started.elapsed() >= Duration::from_millis(250));
    writer.close().unwrap();
    patient.set_lock(LockLevel::Shared).unwrap();
}

#[test]
fn test_invalid_config_rejected() {
    let scratch = Scratch::new();
    scratch.write_config("lock_style = \"dotfile\"\n");
    assert!(matches!(
        strata_lock::open(scratch.path(), OpenFlags::read_write()),
        Err(Error::Config(_))
    ));

    scratch.write_config("busy_timeout_ms = \"soon\"\n");
    assert!(matches!(
        strata_lock::open(scratch.path(), OpenFlags::read_write()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_delete_on_close_removes_file() {
    let scratch = Scratch::new();
    let flags = OpenFlags::read_write().with_delete_on_close(true);
    let mut db = strata_lock::open(scratch.path(), flags).unwrap();
    db.set_lock(LockLevel::Shared).unwrap();
    db.close().unwrap();
    assert!(!scratch.path().exists());
}

#[test]
fn test_read_only_open_needs_existing_file() {
    let scratch = Scratch::new();
    let missing = scratch.dir.path().join("absent.db");
    let err = strata_lock::open(&missing, OpenFlags::read_only()).unwrap_err();
    assert_eq!(err.io_op(), Some(strata_lock::IoOp::Open));
    assert!(!missing.exists());

    let created = strata_lock::open(&missing, OpenFlags::read_write()).unwrap();
    assert!(missing.exists());
    drop(created);
}
