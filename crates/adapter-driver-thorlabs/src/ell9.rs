//! Thorlabs Elliptec ELL9 Four-Position Slider Adapter
//!
//! Reference: Elliptec ELLx modules communication protocol manual
//!
//! Protocol Overview:
//! - Format: ASCII, up to 16 modules on one bus, addressed `0`-`F`
//! - Baud: 9600 default, 8N1
//! - Command: `{channel}{verb}{argument}\r`, verbs are lower case
//! - Reply: `{channel}{TAG}{data}\r\n`, tags are upper case
//! - Status: `GS` followed by two hex digits; `00` means idle/OK
//!
//! Response Formats:
//! - `0in` -> `"0IN0911400012201715010100000000000000\r\n"` (type at 3..5,
//!   serial number at 5..13)
//! - `0gp` -> `"0PO0000001F\r\n"`
//! - `0ma0000003E` -> `"0PO0000003E\r\n"` or `"0GS02\r\n"`
//! - `0gs` -> `"0GS00\r\n"`
//!
//! The four detent positions are fixed encoder words; anything else read
//! back from `gp` means the slider is between positions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use adapter_driver_thorlabs::Ell9Factory;
//!
//! registry.register_factory(Box::new(Ell9Factory));
//!
//! let config = toml::toml! {
//!     port = "/dev/ttyUSB2"
//!     channel = "0"
//! };
//! let slider = registry.build("ell9", config.into()).await?;
//! slider.initialize().await?;
//! slider.set_property("State", 2i64.into()).await?;
//! ```

use std::sync::Arc;

use adapter_core::config::{parse_driver_config, TransportConfig};
use adapter_core::protocol::{Classified, CRLF};
use adapter_core::{
    bind_command, bind_query, AdapterError, AdapterState, AdapterResult, Command, DeviceAdapter,
    DeviceErrorEntry, DriverFactory, ErrorMarker, ErrorTable, FieldSpec, Locate, PropertySlot,
    PropertyTable, PropertyValue, ResponseRules, SharedTransport, WeakPropertyTable,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, instrument};

const PORT: &str = "Port";
const CHANNEL: &str = "Channel";
const STATE: &str = "State";
const LABEL: &str = "Label";
const SERIAL_ID: &str = "Serial ID";

/// Device type reported by `in` for an ELL9.
const ELL9_TYPE: &str = "09";

/// Encoder words of the four detents, indexed by state.
const POSITIONS: [&str; 4] = ["00000000", "0000001F", "0000003E", "0000005D"];
const LABELS: [&str; 4] = ["Position 0", "Position 1", "Position 2", "Position 3"];

const CHANNELS: [&str; 16] = [
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "A", "B", "C", "D", "E", "F",
];

const ENTRIES: &[DeviceErrorEntry] = &[
    DeviceErrorEntry::benign("00", "OK"),
    DeviceErrorEntry::fault("01", 10301, "Communication time-out"),
    DeviceErrorEntry::fault("02", 10302, "Mechanical time-out"),
    DeviceErrorEntry::fault("03", 10303, "Unsupported or unknown command"),
    DeviceErrorEntry::fault("04", 10304, "Value out of range"),
    DeviceErrorEntry::fault("05", 10305, "Module isolated"),
    DeviceErrorEntry::fault("06", 10306, "Module out of isolation"),
    DeviceErrorEntry::fault("07", 10307, "Initializing error"),
    DeviceErrorEntry::fault("08", 10308, "Thermal error"),
    DeviceErrorEntry::fault("09", 10309, "Busy"),
    DeviceErrorEntry::fault("0A", 10310, "Sensor error"),
    DeviceErrorEntry::fault("0B", 10311, "Motor error"),
    DeviceErrorEntry::fault("0C", 10312, "Out of range"),
    DeviceErrorEntry::fault("0D", 10313, "Over-current error"),
];

/// Elliptec `GS` status codes.
pub const STATUS_ERRORS: ErrorTable = ErrorTable::new(ENTRIES).with_unknown_code(10300);

const RULES: ResponseRules = ResponseRules::new(STATUS_ERRORS).with_error_marker(ErrorMarker {
    token: "GS",
    offset: Some(1),
    code_len: Some(2),
});

const TAG: Locate = Locate::at(1, 2);
const DEVICE_TYPE: Locate = Locate::at(3, 2);
const SERIAL: FieldSpec = FieldSpec::text(Locate::at(5, 8));
const WORD: FieldSpec = FieldSpec::text(Locate::at(3, 8));

// =============================================================================
// Ell9Factory - DriverFactory implementation
// =============================================================================

/// Configuration for the ELL9 adapter
#[derive(Debug, Clone, Deserialize)]
pub struct Ell9Config {
    /// Port and timing.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Bus address, one hex digit (default: "0")
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

impl Ell9Config {
    /// Config for the module at address 0 on `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(port),
            channel: default_channel(),
        }
    }

    fn validate(&self) -> AdapterResult<()> {
        self.transport.validate()?;
        if !CHANNELS.contains(&self.channel.as_str()) {
            return Err(AdapterError::Configuration(format!(
                "channel '{}' is not a hex digit 0-F",
                self.channel
            )));
        }
        Ok(())
    }
}

/// Factory for ELL9 slider adapters.
pub struct Ell9Factory;

impl DriverFactory for Ell9Factory {
    fn driver_type(&self) -> &'static str {
        "ell9"
    }

    fn name(&self) -> &'static str {
        "Thorlabs Elliptec ELL9 Slider"
    }

    fn validate(&self, config: &toml::Value) -> AdapterResult<()> {
        let cfg: Ell9Config = parse_driver_config(config.clone())?;
        cfg.validate()
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, AdapterResult<Arc<dyn DeviceAdapter>>> {
        Box::pin(async move {
            let cfg: Ell9Config = parse_driver_config(config)?;
            Ok(Arc::new(Ell9Slider::new(&cfg)?) as Arc<dyn DeviceAdapter>)
        })
    }
}

// =============================================================================
// Module - exchanges with one bus address
// =============================================================================

fn state_of_word(word: &str) -> AdapterResult<i64> {
    POSITIONS
        .iter()
        .position(|p| p.eq_ignore_ascii_case(word))
        .map(|i| i as i64)
        .ok_or_else(|| {
            AdapterError::UnrecognizedResponse(format!("slider at unknown position '{}'", word))
        })
}

fn word_of_state(state: i64) -> AdapterResult<&'static str> {
    usize::try_from(state)
        .ok()
        .and_then(|i| POSITIONS.get(i).copied())
        .ok_or_else(|| {
            AdapterError::InvalidArgument(format!(
                "forbidden position {} (allowed: 0, 1, 2 and 3)",
                state
            ))
        })
}

fn state_of_label(label: &str) -> AdapterResult<i64> {
    LABELS
        .iter()
        .position(|l| *l == label)
        .map(|i| i as i64)
        .ok_or_else(|| AdapterError::InvalidArgument(format!("unknown label '{}'", label)))
}

fn label_of_state(state: i64) -> &'static str {
    usize::try_from(state)
        .ok()
        .and_then(|i| LABELS.get(i).copied())
        .unwrap_or("Undefined")
}

#[derive(Clone)]
struct Module {
    transport: SharedTransport,
    channel: Arc<str>,
    table: WeakPropertyTable,
}

impl Module {
    fn command(&self, verb: &str) -> Command {
        Command::new(verb).selector(&*self.channel)
    }

    async fn exchange(&self, command: Command) -> AdapterResult<String> {
        let reply = self.transport.query_line(&command, CRLF).await?;
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    fn expect_tag(reply: &str, tag: &str) -> AdapterResult<()> {
        if TAG.slice(reply)? == tag {
            Ok(())
        } else {
            Err(AdapterError::UnrecognizedResponse(format!(
                "expected {} reply, got '{}'",
                tag,
                reply.escape_debug()
            )))
        }
    }

    /// `in`: check the device type and return its serial number.
    async fn identify(&self) -> AdapterResult<String> {
        let reply = self.exchange(self.command("in")).await?;
        let reply = RULES.expect_data(&reply)?;
        Self::expect_tag(reply, "IN")?;

        let device_type = DEVICE_TYPE.slice(reply)?;
        if device_type != ELL9_TYPE {
            return Err(AdapterError::UnrecognizedResponse(format!(
                "device type {} is not an ELL9",
                device_type
            )));
        }
        Ok(SERIAL.extract(reply)?.value.require_str()?.to_string())
    }

    async fn state(&self) -> AdapterResult<i64> {
        let reply = self.exchange(self.command("gp")).await?;
        let reply = RULES.expect_data(&reply)?;
        Self::expect_tag(reply, "PO")?;
        let state = state_of_word(WORD.extract(reply)?.value.require_str()?)?;
        self.publish(LABEL, label_of_state(state));
        Ok(state)
    }

    async fn move_to(&self, state: i64) -> AdapterResult<()> {
        let word = word_of_state(state)?;
        let reply = self.exchange(self.command("ma").param(word)).await?;
        if let Classified::Data(data) = RULES.classify(&reply)? {
            Self::expect_tag(data, "PO")?;
        }
        debug!(state, word, "slider moved");
        Ok(())
    }

    /// `gs`; anything but an idle status, including no answer, is busy.
    async fn busy(&self) -> bool {
        match self.exchange(self.command("gs")).await {
            Ok(reply) => !matches!(RULES.classify(&reply), Ok(Classified::Info(_))),
            Err(e) => {
                debug!(error = %e, "status poll failed, reporting busy");
                true
            }
        }
    }

    /// Keep the sibling of State/Label in step without another exchange.
    fn publish(&self, name: &str, value: impl Into<PropertyValue>) {
        if let Some(table) = self.table.upgrade() {
            if let Err(e) = table.notify_changed(name, value) {
                debug!(property = name, error = %e, "could not publish change");
            }
        }
    }
}

// =============================================================================
// Ell9Slider
// =============================================================================

/// Adapter for an Elliptec ELL9 four-position slider.
pub struct Ell9Slider {
    properties: PropertyTable,
    transport: SharedTransport,
    baud_rate: u32,
}

impl Ell9Slider {
    /// Adapter that opens `config.transport.port` on initialize.
    pub fn new(config: &Ell9Config) -> AdapterResult<Self> {
        let transport = SharedTransport::detached("ell9", config.transport.settings());
        Self::with_transport(config, transport)
    }

    /// Adapter over an existing transport.
    pub fn with_transport(config: &Ell9Config, transport: SharedTransport) -> AdapterResult<Self> {
        config.validate()?;
        let properties = PropertyTable::new();
        properties.register(PropertySlot::text(PORT, config.transport.port.clone()).pre_init())?;
        properties.register(
            PropertySlot::text(CHANNEL, config.channel.clone())
                .pre_init()
                .with_allowed(CHANNELS)
                .with_description("Bus address of the module"),
        )?;

        Ok(Self {
            properties,
            transport,
            baud_rate: config.transport.baud_or(default_baud_rate()),
        })
    }

    fn register_runtime(&self, module: &Module, serial: String) -> AdapterResult<()> {
        self.properties
            .register(PropertySlot::text(SERIAL_ID, serial).read_only())?;
        self.properties.register(
            PropertySlot::integer(STATE, 0)
                .with_allowed(0i64..4)
                .on_get(bind_query(module.clone(), |m| async move {
                    m.state().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(module.clone(), |m, v| async move {
                    let state = v.require_i64()?;
                    m.move_to(state).await?;
                    m.publish(LABEL, label_of_state(state));
                    Ok(())
                })),
        )?;
        self.properties.register(
            PropertySlot::text(LABEL, LABELS[0])
                .with_allowed(LABELS)
                .on_get(bind_query(module.clone(), |m| async move {
                    let state = m.state().await?;
                    Ok(PropertyValue::from(label_of_state(state)))
                }))
                .on_set(bind_command(module.clone(), |m, v| async move {
                    let state = state_of_label(v.require_str()?)?;
                    m.move_to(state).await?;
                    m.publish(STATE, state);
                    Ok(())
                })),
        )?;
        Ok(())
    }
}

#[async_trait]
impl DeviceAdapter for Ell9Slider {
    fn name(&self) -> &str {
        "Thorlabs ElliptecSlider"
    }

    fn description(&self) -> &str {
        "Thorlabs Elliptec ELL9 four-position slider"
    }

    fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    #[instrument(skip(self), err)]
    async fn initialize(&self) -> AdapterResult<()> {
        self.properties.lifecycle().ensure_can_initialize()?;

        let port = self.properties.cached(PORT)?.to_string();
        let channel = self.properties.cached(CHANNEL)?.to_string();
        self.transport.open(&port, self.baud_rate).await?;

        let module = Module {
            transport: self.transport.clone(),
            channel: Arc::from(channel.as_str()),
            table: self.properties.downgrade(),
        };
        let serial = match module.identify().await {
            Ok(serial) => serial,
            Err(e) => {
                self.transport.close().await;
                return Err(e);
            }
        };
        self.register_runtime(&module, serial.clone())?;

        self.properties.lifecycle().mark_initialized();
        info!(port = %port, channel = %channel, serial = %serial, "ELL9 initialized");
        Ok(())
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        if self.properties.lifecycle().begin_shutdown().is_some() {
            self.transport.close().await;
            info!("ELL9 shut down");
        }
        Ok(())
    }

    async fn busy(&self) -> AdapterResult<bool> {
        if self.state() != AdapterState::Initialized {
            return Ok(false);
        }
        let channel = self.properties.cached(CHANNEL)?.to_string();
        let module = Module {
            transport: self.transport.clone(),
            channel: Arc::from(channel.as_str()),
            table: self.properties.downgrade(),
        };
        Ok(module.busy().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_driver_type() {
        let factory = Ell9Factory;
        assert_eq!(factory.driver_type(), "ell9");
        assert_eq!(factory.name(), "Thorlabs Elliptec ELL9 Slider");
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = Ell9Factory;

        let valid = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            channel = "A"
        });
        assert!(factory.validate(&valid).is_ok());

        let bad_channel = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            channel = "G"
        });
        assert!(factory.validate(&bad_channel).is_err());
    }

    #[test]
    fn test_position_words() {
        for state in 0..4 {
            let word = word_of_state(state).unwrap();
            assert_eq!(state_of_word(word).unwrap(), state);
        }
        assert_eq!(state_of_word("0000003e").unwrap(), 2);
        assert!(state_of_word("00000010").is_err());
        assert!(matches!(
            word_of_state(4),
            Err(AdapterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_labels() {
        assert_eq!(label_of_state(3), "Position 3");
        assert_eq!(state_of_label("Position 1").unwrap(), 1);
        assert!(state_of_label("Position 4").is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(RULES.classify("0GS00"), Ok(Classified::Info(_))));
        assert_eq!(RULES.classify("0GS02").unwrap_err().code(), 10302);
        assert_eq!(RULES.classify("0GS1F").unwrap_err().code(), 10300);
        assert!(matches!(
            RULES.classify("0PO0000001F"),
            Ok(Classified::Data(_))
        ));
    }
}
