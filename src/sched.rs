//! Scheduler shim: thin wrappers over the rayon work-stealing pool plus the
//! cross-thread diagnostics sink. The two parallel patterns used by the
//! engine are a parallel-for across input sections and a parallel sort for
//! the ARM exception index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::{Error, Result};

/// Parallel stable sort, used by the `.ARM.exidx` post-pass.
pub fn par_sort_by_key<T, K, F>(items: &mut [T], key: F)
where
    T: Send,
    K: Ord + Send,
    F: Fn(&T) -> K + Sync,
{
    items.par_sort_by_key(key);
}

/// Error accumulation across parallel phases.
///
/// A recoverable `error` is recorded and the phase keeps going so that as
/// many diagnostics as possible are reported; a `fatal` additionally arms
/// the abort flag checked at the phase boundary. No task is ever cancelled
/// mid-compute.
pub struct Diagnostics {
    errors: Mutex<Vec<Error>>,
    first_fatal: Mutex<Option<Error>>,
    has_fatal: AtomicBool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            first_fatal: Mutex::new(None),
            has_fatal: AtomicBool::new(false),
        }
    }

    pub fn error(&self, err: Error) {
        log::error!("{err}");
        self.errors.lock().unwrap().push(err);
    }

    pub fn fatal(&self, err: Error) {
        log::error!("{err}");
        self.has_fatal.store(true, Ordering::Relaxed);
        let mut slot = self.first_fatal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            self.errors.lock().unwrap().push(err);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().unwrap().is_empty() || self.has_fatal.load(Ordering::Relaxed)
    }

    /// Phase-boundary check: the first fatal error aborts the link.
    pub fn check(&self) -> Result<()> {
        if self.has_fatal.load(Ordering::Relaxed) {
            if let Some(err) = self.first_fatal.lock().unwrap().take() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drain the recoverable diagnostics, e.g. undefined-symbol records
    /// surfaced at end-of-link.
    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.lock().unwrap())
    }
}
