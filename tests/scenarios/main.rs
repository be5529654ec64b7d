//! Cross-crate locking scenarios
//!
//! Multi-process behaviour runs over simulated processes sharing one lock
//! table; the configuration scenarios go through `strata_lock::open` and
//! real OS locks.
//!
//! ## Running
//!
//! ```bash
//! cargo test --test scenarios
//! ```

#[path = "../common/mod.rs"]
mod common;

mod busy_timeout;
mod config_open;
mod deferred_close;
mod reader_writer;
mod shared_index;
