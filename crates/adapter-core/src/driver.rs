//! Driver factories and the adapter registry.
//!
//! Each driver crate exposes a [`DriverFactory`] that turns the `config`
//! table of a `[[devices]]` entry into a ready-to-initialize adapter. The
//! [`AdapterRegistry`] maps the `type` string to its factory.
//!
//! ```toml
//! [[devices]]
//! id = "slider"
//! type = "ell9"        # matches DriverFactory::driver_type()
//! [devices.config]
//! port = "/dev/ttyUSB1"
//! channel = "0"
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::adapter::DeviceAdapter;
use crate::error::{AdapterError, AdapterResult};

/// Builds adapters of one driver type from TOML configuration.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `type` field selecting this driver.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name, e.g. "WPI Aladdin Syringe Pump".
    fn name(&self) -> &'static str;

    /// Check the configuration without building anything.
    fn validate(&self, config: &toml::Value) -> AdapterResult<()>;

    /// Build an uninitialized adapter. No I/O happens until
    /// [`DeviceAdapter::initialize`].
    fn build(&self, config: toml::Value) -> BoxFuture<'static, AdapterResult<Arc<dyn DeviceAdapter>>>;
}

/// Registry of driver factories keyed by driver type.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<&'static str, Box<dyn DriverFactory>>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one with the same type.
    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) {
        debug!(driver_type = factory.driver_type(), "registering driver factory");
        self.factories.insert(factory.driver_type(), factory);
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Factory for a driver type.
    pub fn factory(&self, driver_type: &str) -> Option<&dyn DriverFactory> {
        self.factories.get(driver_type).map(|f| f.as_ref())
    }

    /// Validate then build an adapter.
    pub async fn build(
        &self,
        driver_type: &str,
        config: toml::Value,
    ) -> AdapterResult<Arc<dyn DeviceAdapter>> {
        let factory = self.factory(driver_type).ok_or_else(|| {
            AdapterError::Configuration(format!(
                "unknown driver type '{}' (known: {})",
                driver_type,
                self.driver_types().join(", ")
            ))
        })?;
        factory.validate(&config)?;
        let adapter = factory.build(config).await?;
        info!(driver_type, name = adapter.name(), "adapter built");
        Ok(adapter)
    }
}
