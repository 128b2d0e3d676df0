//! Test-only helpers shared across `xfer-cli` unit tests.

#![cfg(test)]

use std::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that mutate process-wide environment variables.
///
/// `std::env::set_var`/`remove_var` race across threads within one test
/// binary; every test touching `XFER_*` env vars must hold this lock for
/// its duration.
pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
