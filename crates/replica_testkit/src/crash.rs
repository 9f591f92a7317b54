//! Crash simulation for the journal.
//!
//! [`FaultyLog`] wraps a [`LogDevice`] and dies part way through a write once
//! a byte budget is spent: the bytes that fit land in the inner log, the rest
//! are lost, and every later write fails as if the process were gone. The
//! inner log keeps the torn tail, so reopening a store over a clone of it
//! exercises journal recovery.
//!
//! ## Usage
//!
//! ```rust
//! use replica_store::{LogDevice, MemoryLog};
//! use replica_testkit::crash::FaultyLog;
//!
//! let inner = MemoryLog::new();
//! let (mut log, switch) = FaultyLog::new(inner.clone());
//! switch.crash_after(4);
//! assert!(log.append(b"0123456789").is_err());
//! assert!(switch.has_crashed());
//! assert_eq!(inner.bytes(), b"0123");
//! ```

use replica_store::{LogDevice, StoreError, StoreResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct FaultState {
    crash_after_bytes: AtomicU64,
    appends_until_crash: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
}

impl Default for FaultState {
    fn default() -> Self {
        Self {
            crash_after_bytes: AtomicU64::new(u64::MAX),
            appends_until_crash: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
        }
    }
}

fn simulated(what: &str) -> StoreError {
    StoreError::Io(io::Error::other(format!("simulated crash during {what}")))
}

/// Controls a [`FaultyLog`] after it has been handed to a store.
#[derive(Debug, Clone)]
pub struct FaultSwitch {
    state: Arc<FaultState>,
}

impl FaultSwitch {
    /// Crashes once `bytes` more bytes have been appended.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        self.state
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Crashes half way through the `n`th append from now.
    ///
    /// Each store commit is one append, so `crash_on_append(2)` lets the next
    /// commit land and tears the one after it.
    pub fn crash_on_append(&self, n: u64) {
        self.state.appends_until_crash.store(n.max(1), Ordering::SeqCst);
    }

    /// Returns true once the simulated crash has happened.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }
}

/// A log device that fails on command.
#[derive(Debug)]
pub struct FaultyLog<L> {
    inner: L,
    state: Arc<FaultState>,
}

impl<L: LogDevice> FaultyLog<L> {
    /// Wraps `inner`, returning the device and its switch.
    pub fn new(inner: L) -> (Self, FaultSwitch) {
        let state = Arc::new(FaultState::default());
        let switch = FaultSwitch {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, switch)
    }

    fn tear(&mut self, bytes: &[u8], room: usize) -> StoreResult<u64> {
        if room > 0 {
            self.inner.append(&bytes[..room])?;
        }
        self.state.bytes_written.fetch_add(room as u64, Ordering::SeqCst);
        self.state.crashed.store(true, Ordering::SeqCst);
        Err(simulated("append"))
    }

    fn check_alive(&self, what: &str) -> StoreResult<()> {
        if self.state.crashed.load(Ordering::SeqCst) {
            return Err(simulated(what));
        }
        Ok(())
    }
}

impl<L: LogDevice> LogDevice for FaultyLog<L> {
    fn len(&self) -> StoreResult<u64> {
        self.inner.len()
    }

    fn read_from(&self, offset: u64) -> StoreResult<Vec<u8>> {
        self.inner.read_from(offset)
    }

    fn append(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        self.check_alive("append")?;
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        let limit = self.state.crash_after_bytes.load(Ordering::SeqCst);
        let len = bytes.len() as u64;

        if written.saturating_add(len) > limit {
            let room = usize::try_from(limit.saturating_sub(written)).unwrap_or(bytes.len());
            return self.tear(bytes, room);
        }
        match self.state.appends_until_crash.load(Ordering::SeqCst) {
            u64::MAX => {}
            1 => return self.tear(bytes, bytes.len() / 2),
            n => self.state.appends_until_crash.store(n - 1, Ordering::SeqCst),
        }

        let offset = self.inner.append(bytes)?;
        self.state.bytes_written.fetch_add(len, Ordering::SeqCst);
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.check_alive("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        self.check_alive("truncate")?;
        self.inner.truncate(len)
    }
}
