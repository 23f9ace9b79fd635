//! Cooperative cancellation for long-running mapping tasks.
//!
//! A token is polled at coarse checkpoints: between cluster iterations,
//! before each mate rescue, and between traversal branches. A tripped token
//! makes the current read unwind and return whatever it has.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    /// A token that never trips.
    pub fn none() -> CancelToken {
        CancelToken { flag: None }
    }

    pub fn new(flag: Arc<AtomicBool>) -> CancelToken {
        CancelToken { flag: Some(flag) }
    }

    pub fn tripped(&self) -> bool {
        self.flag.as_ref().map(|f| f.load(Ordering::Relaxed)).unwrap_or(false)
    }
}
