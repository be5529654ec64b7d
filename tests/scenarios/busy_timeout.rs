//! Busy-timeout retries under contention

use std::thread;
use std::time::{Duration, Instant};

use crate::common::*;
use strata_lock::testing::SimulatedHost;

fn patient(ms: u64) -> LockConfig {
    LockConfig {
        busy_timeout_ms: ms,
        ..LockConfig::default()
    }
}

#[test]
fn test_retry_outlasts_transient_writer() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let waiter = Proc::with_config(&host, &patient(5_000));
    let holder = Proc::new(&host);

    let mut blocking = holder.open(scratch.path());
    climb(&mut blocking, LockLevel::Reserved).unwrap();

    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        blocking.lower_lock(LockLevel::Unlocked).unwrap();
        blocking
    });

    let mut db = waiter.open(scratch.path());
    db.set_lock(LockLevel::Shared).unwrap();
    db.set_lock(LockLevel::Reserved).unwrap();
    assert_eq!(db.lock_level(), LockLevel::Reserved);
    assert!(waiter.stats().lock_calls > 3);

    release.join().unwrap();
}

#[test]
fn test_retry_gives_up_after_budget() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let waiter = Proc::with_config(&host, &patient(40));
    let holder = Proc::new(&host);

    let mut blocking = holder.open(scratch.path());
    climb(&mut blocking, LockLevel::Reserved).unwrap();

    let mut db = waiter.open(scratch.path());
    db.set_lock(LockLevel::Shared).unwrap();
    let started = Instant::now();
    assert!(db.set_lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(db.lock_level(), LockLevel::Shared);
}

#[test]
fn test_zero_timeout_fails_fast() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let waiter = Proc::with_config(&host, &patient(0));
    let holder = Proc::new(&host);

    let mut blocking = holder.open(scratch.path());
    climb(&mut blocking, LockLevel::Reserved).unwrap();

    let mut db = waiter.open(scratch.path());
    db.set_lock(LockLevel::Shared).unwrap();
    let before = waiter.stats();
    assert!(db.set_lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert_eq!(waiter.stats().lock_calls - before.lock_calls, 1);
}

// Timeout carried by the handle's open configuration

#[test]
fn test_handle_timeout_outlasts_transient_writer() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let waiter = Proc::new(&host);
    let holder = Proc::new(&host);

    let mut blocking = holder.open(scratch.path());
    climb(&mut blocking, LockLevel::Reserved).unwrap();

    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        blocking.lower_lock(LockLevel::Unlocked).unwrap();
        blocking
    });

    let mut db = waiter.open_configured(scratch.path(), &patient(5_000));
    assert_eq!(db.busy_timeout(), Some(Duration::from_millis(5_000)));
    db.set_lock(LockLevel::Shared).unwrap();
    let before = waiter.stats();
    db.set_lock(LockLevel::Reserved).unwrap();
    assert_eq!(db.lock_level(), LockLevel::Reserved);
    assert!(waiter.stats().lock_calls - before.lock_calls > 1);

    release.join().unwrap();
}

#[test]
fn test_handle_timeout_gives_up_after_budget() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let waiter = Proc::new(&host);
    let holder = Proc::new(&host);

    let mut blocking = holder.open(scratch.path());
    climb(&mut blocking, LockLevel::Reserved).unwrap();

    let mut db = waiter.open_configured(scratch.path(), &patient(40));
    db.set_lock(LockLevel::Shared).unwrap();
    let started = Instant::now();
    assert!(db.set_lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(db.lock_level(), LockLevel::Shared);
}

#[test]
fn test_handle_timeout_waits_for_sibling_in_same_process() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let p = Proc::new(&host);

    let mut writer = p.open(scratch.path());
    climb(&mut writer, LockLevel::Exclusive).unwrap();

    // A sibling without a timeout is refused at once.
    let mut impatient = p.open(scratch.path());
    let before = p.stats();
    assert!(impatient.set_lock(LockLevel::Shared).unwrap_err().is_busy());
    assert_eq!(p.stats().lock_calls, before.lock_calls);

    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        writer.lower_lock(LockLevel::Shared).unwrap();
        writer
    });

    let mut reader = p.open_configured(scratch.path(), &patient(5_000));
    reader.set_lock(LockLevel::Shared).unwrap();
    assert_eq!(reader.lock_level(), LockLevel::Shared);

    let writer = release.join().unwrap();
    assert_eq!(writer.lock_level(), LockLevel::Shared);
}

#[test]
fn test_failed_exclusive_retries_from_pending() {
    let scratch = Scratch::new();
    let host = SimulatedHost::new();
    let reader_proc = Proc::new(&host);
    let writer_proc = Proc::new(&host);

    let mut reader = reader_proc.open(scratch.path());
    reader.set_lock(LockLevel::Shared).unwrap();

    let mut writer = writer_proc.open_configured(scratch.path(), &patient(30));
    climb(&mut writer, LockLevel::Reserved).unwrap();
    assert!(writer.set_lock(LockLevel::Exclusive).unwrap_err().is_busy());
    assert_eq!(writer.lock_level(), LockLevel::Pending);

    // Pending keeps new readers out while the old one drains.
    reader.lower_lock(LockLevel::Unlocked).unwrap();
    assert!(reader.set_lock(LockLevel::Shared).unwrap_err().is_busy());

    writer.set_lock(LockLevel::Exclusive).unwrap();
    assert_eq!(writer.lock_level(), LockLevel::Exclusive);
}
