//! Exactly-once teardown guard

use std::sync::atomic::{AtomicU8, Ordering};

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Serving requests
    Active,
    /// Teardown in progress
    Closing,
    /// Resources released
    Closed,
}

/// `Active -> Closing -> Closed`, advanced with a compare-and-swap so only
/// one caller ever runs teardown
#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    /// New lifecycle in the active state
    pub fn new() -> Self {
        Self(AtomicU8::new(ACTIVE))
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        match self.0.load(Ordering::Acquire) {
            ACTIVE => LifecycleState::Active,
            CLOSING => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }

    /// Whether the owner is still active
    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// Claim teardown; `true` for exactly one caller
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark teardown as finished
    pub fn finish_close(&self) {
        self.0.store(CLOSED, Ordering::Release);
    }
}
