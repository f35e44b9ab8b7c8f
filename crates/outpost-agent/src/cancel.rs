//! Registry of abortable in-flight commands

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Registration {
    serial: u64,
    token: CancellationToken,
}

/// Maps command ids to cancellation tokens
///
/// Ids are not checked for uniqueness: registering an id that is already
/// present replaces the entry, so an abort reaches the latest registration.
#[derive(Default)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<String, Registration>>,
    next_serial: AtomicU64,
}

impl CancelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command as abortable
    ///
    /// The entry is removed when the returned handle is dropped.
    pub fn register(self: &Arc<Self>, command_id: impl Into<String>) -> AbortHandle {
        let command_id = command_id.into();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .insert(command_id.clone(), Registration { serial, token: token.clone() })
            .is_some()
        {
            debug!(command = %command_id, "command id re-registered, replacing previous entry");
        }

        AbortHandle {
            registry: Arc::clone(self),
            command_id,
            serial,
            token,
        }
    }

    /// Cancel and remove a command; `false` if it was not registered
    pub fn cancel(&self, command_id: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(command_id);
        match removed {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered command
    pub fn cancel_all(&self) {
        let drained: Vec<Registration> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        for registration in drained {
            registration.token.cancel();
        }
    }

    /// Whether an id is currently registered
    pub fn is_registered(&self, command_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(command_id)
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, command_id: &str, serial: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(command_id).is_some_and(|r| r.serial == serial) {
            entries.remove(command_id);
        }
    }
}

/// Registration of one abortable command
pub struct AbortHandle {
    registry: Arc<CancelRegistry>,
    command_id: String,
    serial: u64,
    token: CancellationToken,
}

impl AbortHandle {
    /// Completes when the command is aborted
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Whether an abort has been requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying token, for handing to child tasks
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for AbortHandle {
    fn drop(&mut self) {
        self.registry.release(&self.command_id, self.serial);
    }
}
