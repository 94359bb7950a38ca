//! `adapter-core`
//!
//! Building blocks for ASCII serial instrument adapters: a command/response
//! transport, response classification and field extraction, unit
//! normalization, a typed property table with validation and caching, and the
//! adapter lifecycle.
//!
//! ## Layers
//!
//! - **Transport** ([`transport`]): send, read until terminator, read fixed
//!   length, purge. One exchange in flight per port.
//! - **Protocol** ([`protocol`], [`units`]): classify replies as error / ack /
//!   data, pull fields out by offset or tag, parse numbers strictly.
//! - **Properties** ([`property`], [`adapter`]): named slots bound to query and
//!   command closures, enforced by the adapter lifecycle.
//!
//! Driver crates build on these and expose a [`driver::DriverFactory`].

pub mod adapter;
pub mod config;
pub mod driver;
pub mod error;
pub mod property;
pub mod protocol;
pub mod serial;
pub mod tracing_init;
pub mod transport;
pub mod units;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use adapter::{AdapterState, DeviceAdapter, Lifecycle, SettlingClock};
pub use driver::{AdapterRegistry, DriverFactory};
pub use error::{AdapterError, AdapterResult, ErrorKind};
pub use property::{
    bind_command, bind_query, Access, Domain, PropertyTable, PropertySlot, PropertyType,
    PropertyValue, WeakPropertyTable,
};
pub use protocol::{
    Command, DeviceErrorEntry, ErrorMarker, ErrorTable, FieldSpec, Locate, MalformedPolicy,
    ResponseRules,
};
pub use transport::{SharedTransport, Transport, TransportSettings};
