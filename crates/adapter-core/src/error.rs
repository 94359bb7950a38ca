//! Error types shared by every adapter.
//!
//! `AdapterError` is the single error type returned by transports, response
//! classification, the property table and drivers. Each variant maps to a
//! stable integer code through [`AdapterError::code`], so a host that keys
//! operator-facing messages by number can still do so.
//!
//! ## Error Hierarchy
//!
//! - **Transport**: `Communication`, `Timeout`, `ResponseTooLarge`. The exchange
//!   with the device failed before anything could be parsed.
//! - **Protocol**: `UnrecognizedResponse`, `DeviceReported`. The device answered,
//!   but either with something that matched no expected shape, or with an
//!   explicit fault code.
//! - **Property**: `InvalidArgument`, `ConflictingState`, `PortChangeForbidden`,
//!   `UnknownProperty`, `ReadOnlyProperty`. Rejected before any I/O is issued.
//! - **Lifecycle/config**: `InvalidState`, `Configuration`.
//!
//! None of these are retried internally and none are fatal: cached property
//! values are left untouched when an error is returned.

use std::time::Duration;
use thiserror::Error;

use crate::adapter::AdapterState;

/// Code used for a device error token that is missing from the device's table.
pub const UNKNOWN_DEVICE_ERROR: i32 = 10001;

/// Coarse error category, useful for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The port could not be opened, read or written.
    Communication,
    /// No complete reply within the deadline.
    Timeout,
    /// A reply arrived but could not be understood.
    Protocol,
    /// The instrument reported a fault of its own.
    Device,
    /// Rejected by local validation before any I/O.
    InvalidArgument,
    /// Refused because another setting is in the way.
    Conflict,
    /// Not allowed in the adapter's current state.
    Lifecycle,
    /// Bad configuration file or driver settings.
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Communication => "communication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Device => "device",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Lifecycle => "lifecycle",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the adapter error type.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Primary error type for serial device adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Write or read on the underlying port failed, or the port closed.
    #[error("Communication error: {0}")]
    Communication(String),

    /// No terminator (or acknowledgment) arrived within the exchange budget.
    #[error("Timed out after {waited:?} waiting for device response")]
    Timeout {
        /// How long the exchange waited before giving up.
        waited: Duration,
    },

    /// The device answered, but the reply matched no expected shape.
    ///
    /// Also returned when a numeric field has trailing garbage or a fixed-offset
    /// field lies beyond the end of a short reply.
    #[error("Unrecognized response: {0}")]
    UnrecognizedResponse(String),

    /// The device explicitly signalled a fault.
    ///
    /// `code` comes from the device's error table; tokens not present in the
    /// table use [`UNKNOWN_DEVICE_ERROR`].
    #[error("Device reported error {code}: {description}")]
    DeviceReported {
        /// Host-facing numeric code for this fault.
        code: i32,
        /// Human readable description from the device table.
        description: String,
    },

    /// Value outside the property's declared domain. No I/O was issued.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A cross-property constraint rejected the write. No I/O was issued.
    #[error("Conflicting state: {0}")]
    ConflictingState(String),

    /// Attempt to change a pre-initialization property after initialize().
    #[error("Property '{property}' cannot be changed after initialization")]
    PortChangeForbidden {
        /// Name of the immutable property.
        property: String,
    },

    /// No property with this name exists on the adapter.
    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    /// The property can be read but not written.
    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),

    /// Operation not allowed in the adapter's current lifecycle state.
    #[error("Cannot {operation} while adapter is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: String,
        /// State the adapter was in.
        state: AdapterState,
    },

    /// A reply grew past the configured scanner bound without a terminator.
    #[error("Response too large: {bytes} bytes (max: {max_bytes})")]
    ResponseTooLarge {
        /// Bytes accumulated when the bound was hit.
        bytes: usize,
        /// Configured bound.
        max_bytes: usize,
    },

    /// Invalid adapter or transport configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AdapterError {
    /// Shorthand for a device fault with a description.
    pub fn device(code: i32, description: impl Into<String>) -> Self {
        Self::DeviceReported {
            code,
            description: description.into(),
        }
    }

    /// Integer code for hosts that key error messages by number.
    pub fn code(&self) -> i32 {
        match self {
            Self::Communication(_) => 10002,
            Self::Timeout { .. } => 10003,
            Self::PortChangeForbidden { .. } => 10004,
            Self::UnrecognizedResponse(_) => 10009,
            Self::InvalidArgument(_) => 10010,
            Self::ConflictingState(_) => 10011,
            Self::UnknownProperty(_) => 10012,
            Self::ReadOnlyProperty(_) => 10013,
            Self::InvalidState { .. } => 10014,
            Self::ResponseTooLarge { .. } => 10015,
            Self::Configuration(_) => 10016,
            Self::DeviceReported { code, .. } => *code,
        }
    }

    /// Coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Communication(_) => ErrorKind::Communication,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnrecognizedResponse(_) | Self::ResponseTooLarge { .. } => ErrorKind::Protocol,
            Self::DeviceReported { .. } => ErrorKind::Device,
            Self::InvalidArgument(_) | Self::UnknownProperty(_) | Self::ReadOnlyProperty(_) => {
                ErrorKind::InvalidArgument
            }
            Self::ConflictingState(_) => ErrorKind::Conflict,
            Self::PortChangeForbidden { .. } | Self::InvalidState { .. } => ErrorKind::Lifecycle,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout {
                waited: Duration::ZERO,
            },
            _ => Self::Communication(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for AdapterError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
