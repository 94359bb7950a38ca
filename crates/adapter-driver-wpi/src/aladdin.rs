//! WPI Aladdin Syringe Pump Adapter
//!
//! Reference: Aladdin (AL-1000) Syringe Pump Operating Manual, RS-232 section
//!
//! Protocol Overview:
//! - Format: ASCII, one or more pumps daisy-chained on one port
//! - Baud: 19200 default, 8N1, no flow control
//! - Command: `{address}{VERB}{argument}\r`, addresses 0..99
//! - Reply: `STX addr(2) status(1) payload ETX`
//! - Status: `S` stopped, `I` infusing, `W` withdrawing, `P` paused, `T` timed
//!   pause, `U` user wait, `X` purging, `A` alarm
//! - Errors: `?` at the start of the payload followed by a code
//! - Queries with a fixed-width payload (`DIA`, `RAT`, `DIR`, `PHN`, status)
//!   are read by length; `VOL`, `FUN` and set acknowledgments are read to ETX
//!
//! Response Formats:
//! - `0RAT` -> `"\x0200S00300UH\x03"` (value at 4..9, unit at 9..11)
//! - `0VOL` -> `"\x0200S12.50UL\x03"` (unit letter at 9)
//! - `0DIR` -> `"\x0200SINF\x03"`
//! - `0`    -> `"\x0200I\x03"` (status only)
//! - `0VOL99999` -> `"\x0200S?OOR\x03"`
//!
//! All rates are reported in µL/min and volumes in µL regardless of the unit
//! the pump answers in.
//!
//! # Usage
//!
//! ```rust,ignore
//! use adapter_driver_wpi::AladdinFactory;
//!
//! registry.register_factory(Box::new(AladdinFactory));
//!
//! let config = toml::toml! {
//!     port = "/dev/ttyUSB0"
//!     pump_count = 2
//! };
//! let pump = registry.build("aladdin", config.into()).await?;
//! pump.initialize().await?;
//! pump.set_property("Rate (uL/min) Pump1", 250.0.into()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use adapter_core::config::{parse_driver_config, TransportConfig};
use adapter_core::protocol::{format_in_width, ETX};
use adapter_core::units::{FlowRateUnit, VolumeUnit};
use adapter_core::{
    bind_command, bind_query, AdapterError, AdapterResult, Command, DeviceAdapter,
    DeviceErrorEntry, DriverFactory, ErrorMarker, ErrorTable, FieldSpec, Locate, PropertySlot,
    PropertyTable, PropertyValue, ResponseRules, SettlingClock, SharedTransport,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, instrument};

/// Number of pumps property.
const PUMP_NR: &str = "PumpNr";
const PORT: &str = "Port";

/// Largest value the 5-character numeric field can carry.
const MAX_FIELD_VALUE: f64 = 9999.0;
/// Numeric parameters travel in a five-character field.
const FIELD_WIDTH: usize = 5;
/// Longest reply frame we accept before giving up on ETX.
const MAX_FRAME_BYTES: usize = 16;
const STX: char = '\x02';
const ETX_CHAR: char = '\x03';

/// Frame sizes through the closing ETX for replies with a fixed payload.
const STATUS_FRAME: usize = 5;
const DIRECTION_FRAME: usize = 8;
const PHASE_FRAME: usize = 9;
const DIAMETER_FRAME: usize = 10;
const RATE_FRAME: usize = 12;

/// Accepted program function prefixes for `FUN`.
const FUNCTIONS: &[&str] = &[
    "RAT", "INC", "DEC", "STP", "JMP", "PRI", "PRL", "LOP", "LPS", "LPE", "PAS", "IF", "EVN",
    "EVS", "EVR", "BEP", "OUT",
];

const ENTRIES: &[DeviceErrorEntry] = &[
    DeviceErrorEntry::fault("", 10201, "Command is not recognized"),
    DeviceErrorEntry::fault("NA", 10202, "Command is not currently applicable"),
    DeviceErrorEntry::fault("OOR", 10203, "Command data is out of range"),
    DeviceErrorEntry::fault("COM", 10204, "Invalid communications packet received"),
    DeviceErrorEntry::fault("IGN", 10205, "Command ignored due to a simultaneous new phase start"),
    DeviceErrorEntry::fault("R", 10206, "Pump was reset (power was interrupted)"),
    DeviceErrorEntry::fault("S", 10207, "Pump motor stalled"),
    DeviceErrorEntry::fault("T", 10208, "Safe mode communications time out"),
    DeviceErrorEntry::fault("E", 10209, "Pumping program error"),
    DeviceErrorEntry::fault("O", 10210, "Pumping program phase is out of range"),
];

/// Aladdin error and alarm codes.
pub const PUMP_ERRORS: ErrorTable = ErrorTable::new(ENTRIES).with_unknown_code(10200);

const RULES: ResponseRules = ResponseRules::new(PUMP_ERRORS).with_error_marker(ErrorMarker {
    token: "?",
    offset: Some(4),
    code_len: None,
});

const VALUE: FieldSpec = FieldSpec::float(Locate::at(4, 5));
const VOLUME_UNIT: Locate = Locate::at(9, 1);
const RATE_UNIT: Locate = Locate::at(9, 2);
const WORD: FieldSpec = FieldSpec::text(Locate::at(4, 3));
const STATUS: FieldSpec = FieldSpec::text(Locate::at(3, 1));
const PHASE: FieldSpec = FieldSpec::integer(Locate::at(5, 2));

// =============================================================================
// AladdinFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the Aladdin adapter
#[derive(Debug, Clone, Deserialize)]
pub struct AladdinConfig {
    /// Port and timing.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Number of daisy-chained pumps, addressed 0..pump_count (default: 1)
    #[serde(default = "default_pump_count")]
    pub pump_count: u8,
    /// Busy window after a set command, in milliseconds (default: 100)
    #[serde(default = "default_settling_ms")]
    pub settling_ms: u64,
}

fn default_pump_count() -> u8 {
    1
}

fn default_settling_ms() -> u64 {
    100
}

fn default_baud_rate() -> u32 {
    19200
}

impl AladdinConfig {
    /// Config for a single pump on `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(port),
            pump_count: default_pump_count(),
            settling_ms: default_settling_ms(),
        }
    }

    fn validate(&self) -> AdapterResult<()> {
        self.transport.validate()?;
        if !(1..=99).contains(&self.pump_count) {
            return Err(AdapterError::Configuration(format!(
                "pump_count {} outside 1..=99",
                self.pump_count
            )));
        }
        Ok(())
    }
}

/// Factory for Aladdin pump adapters.
pub struct AladdinFactory;

impl DriverFactory for AladdinFactory {
    fn driver_type(&self) -> &'static str {
        "aladdin"
    }

    fn name(&self) -> &'static str {
        "WPI Aladdin Syringe Pump"
    }

    fn validate(&self, config: &toml::Value) -> AdapterResult<()> {
        let cfg: AladdinConfig = parse_driver_config(config.clone())?;
        cfg.validate()
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, AdapterResult<Arc<dyn DeviceAdapter>>> {
        Box::pin(async move {
            let cfg: AladdinConfig = parse_driver_config(config)?;
            let pump = AladdinPump::new(&cfg)?;
            Ok(Arc::new(pump) as Arc<dyn DeviceAdapter>)
        })
    }
}

// =============================================================================
// Pump - one address on the chain
// =============================================================================

/// Exchange context shared by every property closure of one pump.
#[derive(Clone)]
struct Pump {
    transport: SharedTransport,
    address: u8,
    settling: Arc<SettlingClock>,
}

impl Pump {
    fn command(&self, verb: &str) -> Command {
        Command::new(verb).selector(self.address.to_string())
    }

    fn check_frame(reply: &str) -> AdapterResult<()> {
        if !reply.starts_with(STX) || reply.len() < 4 {
            return Err(AdapterError::UnrecognizedResponse(format!(
                "'{}' is not a pump frame",
                reply.escape_debug()
            )));
        }
        Ok(())
    }

    async fn exchange(&self, command: Command) -> AdapterResult<String> {
        let reply = self.transport.query_line(&command, ETX).await?;
        Self::check_frame(&reply)?;
        Ok(reply)
    }

    /// Send a set command and check the acknowledgment frame.
    async fn write(&self, command: Command) -> AdapterResult<()> {
        let reply = self.exchange(command).await?;
        RULES.expect_ack(&reply)?;
        self.settling.mark();
        Ok(())
    }

    async fn read(&self, verb: &str) -> AdapterResult<String> {
        let reply = self.exchange(self.command(verb)).await?;
        RULES.expect_data(&reply).map(str::to_string)
    }

    /// Read a reply of known size, `frame_len` bytes including the ETX.
    ///
    /// An ETX inside the window ends the frame early: alarms and errors are
    /// still classified, anything else is a short reply.
    async fn read_fixed(&self, verb: &str, frame_len: usize) -> AdapterResult<String> {
        let raw = self
            .transport
            .query_fixed(&self.command(verb), frame_len)
            .await?;
        let (frame, terminated) = match raw.find(ETX_CHAR) {
            Some(end) => (&raw[..end], true),
            None => (raw.as_str(), false),
        };
        Self::check_frame(frame)?;
        let data = RULES.expect_data(frame)?;
        if !terminated || frame.len() + 1 != frame_len {
            return Err(AdapterError::UnrecognizedResponse(format!(
                "expected a {}-byte reply to {}, got '{}'",
                frame_len,
                verb,
                raw.escape_debug()
            )));
        }
        Ok(data.to_string())
    }

    async fn volume(&self) -> AdapterResult<f64> {
        let reply = self.read("VOL").await?;
        let value = VALUE.extract(&reply)?.value.require_f64()?;
        let unit = VolumeUnit::from_code(VOLUME_UNIT.slice(&reply)?)?;
        Ok(unit.to_ul(value))
    }

    async fn set_volume(&self, volume: f64) -> AdapterResult<()> {
        self.write(self.command("VOL").param(format_in_width(volume, 4, FIELD_WIDTH)))
            .await
    }

    async fn diameter(&self) -> AdapterResult<f64> {
        let reply = self.read_fixed("DIA", DIAMETER_FRAME).await?;
        VALUE.extract(&reply)?.value.require_f64()
    }

    async fn set_diameter(&self, diameter: f64) -> AdapterResult<()> {
        self.write(self.command("DIA").param(format_in_width(diameter, 4, FIELD_WIDTH)))
            .await
    }

    async fn rate(&self) -> AdapterResult<f64> {
        let reply = self.read_fixed("RAT", RATE_FRAME).await?;
        let value = VALUE.extract(&reply)?.value.require_f64()?;
        let unit = FlowRateUnit::from_code(RATE_UNIT.slice(&reply)?)?;
        Ok(unit.to_ul_per_min(value))
    }

    async fn set_rate(&self, rate: f64) -> AdapterResult<()> {
        let command = self
            .command("RAT")
            .param(format_in_width(rate, 4, FIELD_WIDTH))
            .param(FlowRateUnit::MicrolitersPerMinute.code());
        self.write(command).await
    }

    async fn direction(&self) -> AdapterResult<&'static str> {
        let reply = self.read_fixed("DIR", DIRECTION_FRAME).await?;
        match WORD.extract(&reply)?.value.require_str()? {
            "INF" => Ok(INFUSE),
            "WDR" => Ok(WITHDRAW),
            other => Err(AdapterError::UnrecognizedResponse(format!(
                "unknown direction '{}'",
                other
            ))),
        }
    }

    async fn set_direction(&self, direction: &str) -> AdapterResult<()> {
        let word = match direction {
            INFUSE => "INF",
            WITHDRAW => "WDR",
            other => {
                return Err(AdapterError::InvalidArgument(format!(
                    "unknown direction '{}'",
                    other
                )))
            }
        };
        self.write(self.command("DIR").separator(" ").param(word))
            .await
    }

    async fn running(&self) -> AdapterResult<bool> {
        let reply = self.read_fixed("", STATUS_FRAME).await?;
        let status = STATUS.extract(&reply)?.value;
        Ok(matches!(status.require_str()?, "I" | "W"))
    }

    async fn set_running(&self, run: bool) -> AdapterResult<()> {
        self.write(self.command(if run { "RUN" } else { "STP" }))
            .await
    }

    async fn function(&self) -> AdapterResult<String> {
        let reply = self.read("FUN").await?;
        Ok(WORD.extract(&reply)?.value.require_str()?.to_string())
    }

    async fn set_function(&self, function: &str) -> AdapterResult<()> {
        self.write(self.command("FUN").param(function)).await
    }

    async fn phase(&self) -> AdapterResult<i64> {
        let reply = self.read_fixed("PHN", PHASE_FRAME).await?;
        PHASE.extract(&reply)?.value.require_i64()
    }

    async fn set_phase(&self, phase: i64) -> AdapterResult<()> {
        self.write(self.command("PHN").param(phase)).await
    }
}

const INFUSE: &str = "Infuse";
const WITHDRAW: &str = "Withdraw";

fn check_function(value: &PropertyValue) -> Result<(), String> {
    let text = value.as_str().unwrap_or_default();
    if FUNCTIONS.iter().any(|prefix| text.starts_with(prefix)) {
        Ok(())
    } else {
        Err(format!(
            "'{}' does not start with a pump function ({})",
            text,
            FUNCTIONS.join(", ")
        ))
    }
}

// =============================================================================
// AladdinPump
// =============================================================================

/// Adapter for a chain of Aladdin syringe pumps sharing one serial port.
///
/// Per-pump properties are registered during [`DeviceAdapter::initialize`],
/// one set per address, with a ` Pump{address}` suffix.
pub struct AladdinPump {
    properties: PropertyTable,
    transport: SharedTransport,
    baud_rate: u32,
    settling: Arc<SettlingClock>,
}

impl AladdinPump {
    /// Adapter that opens `config.transport.port` on initialize.
    pub fn new(config: &AladdinConfig) -> AdapterResult<Self> {
        let settings = Self::transport_settings(config);
        let transport = SharedTransport::detached("aladdin", settings);
        Self::with_transport(config, transport)
    }

    /// Adapter over an existing transport (already attached ports are kept).
    pub fn with_transport(config: &AladdinConfig, transport: SharedTransport) -> AdapterResult<Self> {
        config.validate()?;
        let properties = PropertyTable::new();
        properties.register(
            PropertySlot::text(PORT, config.transport.port.clone())
                .pre_init()
                .with_description("Serial port"),
        )?;
        properties.register(
            PropertySlot::integer(PUMP_NR, i64::from(config.pump_count))
                .pre_init()
                .with_range(1.0, 99.0)
                .with_description("Number of pumps on the chain"),
        )?;

        Ok(Self {
            properties,
            transport,
            baud_rate: config.transport.baud_or(default_baud_rate()),
            settling: Arc::new(SettlingClock::new(Duration::from_millis(config.settling_ms))),
        })
    }

    fn transport_settings(config: &AladdinConfig) -> adapter_core::TransportSettings {
        let mut settings = config.transport.settings();
        settings.max_response_bytes = settings.max_response_bytes.min(MAX_FRAME_BYTES);
        settings
    }

    fn register_pump(&self, address: u8) -> AdapterResult<()> {
        let pump = Pump {
            transport: self.transport.clone(),
            address,
            settling: self.settling.clone(),
        };
        let name = |base: &str| format!("{} Pump{}", base, address);

        self.properties.register(
            PropertySlot::float(name("Volume (uL)"), 0.0)
                .with_range(0.0, MAX_FIELD_VALUE)
                .with_unit("uL")
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.volume().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump.clone(), |p, v| async move {
                    p.set_volume(v.require_f64()?).await
                })),
        )?;
        self.properties.register(
            PropertySlot::switch(name("Run"), false)
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.running().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump.clone(), |p, v| async move {
                    p.set_running(v.require_i64()? == 1).await
                })),
        )?;
        self.properties.register(
            PropertySlot::float(name("Rate (uL/min)"), 0.0)
                .with_range(0.0, MAX_FIELD_VALUE)
                .with_unit("uL/min")
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.rate().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump.clone(), |p, v| async move {
                    p.set_rate(v.require_f64()?).await
                })),
        )?;
        self.properties.register(
            PropertySlot::float(name("Diameter (mm)"), 0.0)
                .with_range(0.1, 50.0)
                .with_unit("mm")
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.diameter().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump.clone(), |p, v| async move {
                    p.set_diameter(v.require_f64()?).await
                })),
        )?;
        self.properties.register(
            PropertySlot::integer(name("Phase"), 1)
                .with_range(1.0, 41.0)
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.phase().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump.clone(), |p, v| async move {
                    p.set_phase(v.require_i64()?).await
                })),
        )?;
        self.properties.register(
            PropertySlot::text(name("Function"), "")
                .with_validator(check_function)
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.function().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump.clone(), |p, v| async move {
                    p.set_function(v.require_str()?).await
                })),
        )?;
        self.properties.register(
            PropertySlot::text(name("Direction"), INFUSE)
                .with_allowed([INFUSE, WITHDRAW])
                .on_get(bind_query(pump.clone(), |p| async move {
                    p.direction().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(pump, |p, v| async move {
                    p.set_direction(v.require_str()?).await
                })),
        )?;

        debug!(address, "pump properties registered");
        Ok(())
    }
}

#[async_trait]
impl DeviceAdapter for AladdinPump {
    fn name(&self) -> &str {
        "Aladdin"
    }

    fn description(&self) -> &str {
        "WPI Aladdin Syringe Pump"
    }

    fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    #[instrument(skip(self), err)]
    async fn initialize(&self) -> AdapterResult<()> {
        self.properties.lifecycle().ensure_can_initialize()?;

        let port = self.properties.cached(PORT)?.to_string();
        let count = self.properties.cached(PUMP_NR)?.require_i64()?;
        let count = u8::try_from(count)
            .map_err(|_| AdapterError::Configuration(format!("{} {} out of range", PUMP_NR, count)))?;

        self.transport.open(&port, self.baud_rate).await?;

        for address in 0..count {
            self.register_pump(address)?;
        }

        self.properties.lifecycle().mark_initialized();
        info!(port = %port, pumps = count, "Aladdin initialized");
        Ok(())
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        if self.properties.lifecycle().begin_shutdown().is_some() {
            self.transport.close().await;
            info!("Aladdin shut down");
        }
        Ok(())
    }

    async fn busy(&self) -> AdapterResult<bool> {
        Ok(self.settling.is_settling())
    }
}
