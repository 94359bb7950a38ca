//! Adapter lifecycle and the device adapter trait.
//!
//! ```text
//! Uninitialized --initialize()--> Initialized --shutdown()--> ShutDown
//! ```
//!
//! Each transition happens at most once. `busy()` is a query, not a
//! transition.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::{AdapterError, AdapterResult};
use crate::property::{PropertyTable, PropertyValue};

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Constructed; pre-init properties may still change.
    Uninitialized,
    /// Talking to the device.
    Initialized,
    /// Released; no further I/O.
    ShutDown,
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AdapterState::Uninitialized => "uninitialized",
            AdapterState::Initialized => "initialized",
            AdapterState::ShutDown => "shut down",
        };
        write!(f, "{}", label)
    }
}

/// Guarded lifecycle state machine.
#[derive(Debug)]
pub struct Lifecycle {
    state: RwLock<AdapterState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start uninitialized.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AdapterState::Uninitialized),
        }
    }

    /// Current state.
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Fails unless the adapter has never been initialized.
    pub fn ensure_can_initialize(&self) -> AdapterResult<()> {
        match self.state() {
            AdapterState::Uninitialized => Ok(()),
            state => Err(AdapterError::InvalidState {
                operation: "initialize".to_string(),
                state,
            }),
        }
    }

    /// Record a successful initialize.
    pub fn mark_initialized(&self) {
        let mut state = self.state.write();
        if *state == AdapterState::Uninitialized {
            *state = AdapterState::Initialized;
        }
    }

    /// Move to `ShutDown`, returning the state it left, or `None` if it was
    /// already shut down.
    pub fn begin_shutdown(&self) -> Option<AdapterState> {
        let mut state = self.state.write();
        match *state {
            AdapterState::ShutDown => None,
            previous => {
                *state = AdapterState::ShutDown;
                Some(previous)
            }
        }
    }
}

/// Busy window after a state-changing command.
#[derive(Debug)]
pub struct SettlingClock {
    delay: Duration,
    last_change: Mutex<Option<Instant>>,
}

impl SettlingClock {
    /// Clock with the given settling delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_change: Mutex::new(None),
        }
    }

    /// Note that a state-changing command just went out.
    pub fn mark(&self) {
        *self.last_change.lock() = Some(Instant::now());
    }

    /// True while the settling delay since the last mark has not elapsed.
    pub fn is_settling(&self) -> bool {
        self.last_change
            .lock()
            .is_some_and(|at| at.elapsed() < self.delay)
    }

    /// Configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// A device adapter: lifecycle plus a property table.
///
/// Property access is delegated to [`PropertyTable`], which enforces the
/// validation and caching rules. Implementors provide identity, the
/// initialize/shutdown sequences and the busy query.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Device name as shown to users.
    fn name(&self) -> &str;

    /// One-line description.
    fn description(&self) -> &str;

    /// The adapter's property table.
    fn properties(&self) -> &PropertyTable;

    /// Current lifecycle state.
    fn state(&self) -> AdapterState {
        self.properties().lifecycle().state()
    }

    /// Open the port and bring the device into a known state.
    ///
    /// Allowed once, from `Uninitialized`. On failure the adapter stays
    /// uninitialized.
    async fn initialize(&self) -> AdapterResult<()>;

    /// Return the device to a safe state and release it. Idempotent.
    async fn shutdown(&self) -> AdapterResult<()>;

    /// Whether the device is still carrying out the last command.
    async fn busy(&self) -> AdapterResult<bool>;

    /// Read a property.
    async fn get_property(&self, name: &str) -> AdapterResult<PropertyValue> {
        self.properties().get(name).await
    }

    /// Write a property.
    async fn set_property(&self, name: &str, value: PropertyValue) -> AdapterResult<()> {
        self.properties().set(name, value).await
    }
}
