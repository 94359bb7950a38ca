//! Toptica iBeam smart Laser Adapter
//!
//! Reference: iBeam smart Firmware Manual, command reference
//!
//! Protocol Overview:
//! - Format: ASCII command line, words separated by spaces
//! - Baud: 115200 default, 8N1
//! - Command terminator: CR (`\r`)
//! - Every reply is zero or more lines followed by a line containing `[OK]`
//!   (`prom off` must be set, otherwise a `CMD>` prompt replaces the ack)
//! - Errors: lines starting with `%SYS-` and a severity letter
//!   (`I` info, `W` warning, `E` error, `F` fatal)
//!
//! Response Formats:
//! - `id`            -> `"iBEAM-SMART-640-S-HP\r\n[OK]\r\n"`
//! - `sh data`       -> `"... Pmax: 150 mW ...\r\n fine a ... -> 35.0 %\r\n[OK]\r\n"`
//! - `sh level pow`  -> `"CH1, PWR: 12.500 mW\r\nCH2, PWR: 0.000 mW\r\n[OK]\r\n"`
//! - `sta la`        -> `"OFF\r\n[OK]\r\n"`
//!
//! # Variants
//!
//! One controller can be driven four ways. [`IBeamVariant::Full`] exposes
//! both channels, the fine mode and the external trigger; the other variants
//! put the unused parts in a safe state at initialize and hide them.

use std::sync::Arc;

use adapter_core::config::{parse_driver_config, TransportConfig};
use adapter_core::protocol::{format_significant, parse_f64_field, CR};
use adapter_core::{
    bind_command, bind_query, AdapterError, AdapterResult, AdapterState, Command, DeviceAdapter,
    DeviceErrorEntry, DriverFactory, ErrorMarker, ErrorTable, PropertySlot, PropertyTable,
    PropertyValue, ResponseRules, SharedTransport, WeakPropertyTable,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

const PORT: &str = "Port";
const SERIAL_ID: &str = "Serial ID";
const FIRMWARE: &str = "Firmware version";
const MAX_POWER: &str = "Maximum power (mW)";
const CLIP: &str = "Clipping status";
const LASER: &str = "Laser Operation";
const CH1_POWER: &str = "Ch1 power (mW)";
const CH1_ENABLE: &str = "Ch1 enable";
const CH2_POWER: &str = "Ch2 power (mW)";
const CH2_ENABLE: &str = "Ch2 enable";
const EXT: &str = "Enable ext trigger";
const FINE: &str = "Enable Fine";
const FINE_A: &str = "Fine A (%)";
const FINE_B: &str = "Fine B (%)";

const OFF: &str = "Off";
const ON: &str = "On";

/// Data line missing from a reply.
pub const DATA_NOT_FOUND: i32 = 107;
/// Clip check reported a failure.
pub const CLIP_FAIL: i32 = 109;
/// Clip check answered something other than PASS, GOOD or FAIL.
pub const UNEXPECTED_CLIP_STATUS: i32 = 110;

const ENTRIES: &[DeviceErrorEntry] = &[
    DeviceErrorEntry::benign("I", "Laser information"),
    DeviceErrorEntry::fault("W", 102, "Laser warning"),
    DeviceErrorEntry::fault("E", 103, "Laser error"),
    DeviceErrorEntry::fault("F", 104, "Laser fatal error"),
];

/// `%SYS-` severities.
pub const LASER_ERRORS: ErrorTable = ErrorTable::new(ENTRIES);

const RULES: ResponseRules = ResponseRules::new(LASER_ERRORS)
    .with_error_marker(ErrorMarker {
        token: "%SYS-",
        offset: Some(0),
        code_len: Some(1),
    })
    .with_ack("[OK]");

// =============================================================================
// IBeamSmartFactory - DriverFactory implementation
// =============================================================================

/// Which parts of the controller the adapter drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IBeamVariant {
    /// Both channels, fine mode and external trigger.
    #[default]
    Full,
    /// Channel 1 only.
    Simple,
    /// Channel 1 with the fine mode.
    Fine,
    /// Channel 2 with the external trigger.
    ExtTrigger,
}

impl IBeamVariant {
    /// Channel 1 power and enable are exposed.
    pub fn has_channel1(self) -> bool {
        !matches!(self, Self::ExtTrigger)
    }

    /// Channel 2 power, enable and the external trigger are exposed.
    pub fn has_channel2(self) -> bool {
        matches!(self, Self::Full | Self::ExtTrigger)
    }

    /// Fine mode and its two percentages are exposed.
    pub fn has_fine(self) -> bool {
        matches!(self, Self::Full | Self::Fine)
    }

    fn device_name(self) -> &'static str {
        match self {
            Self::Full => "iBeamSmart",
            Self::Simple => "iBeamSmart-Simple",
            Self::Fine => "iBeamSmart-Fine",
            Self::ExtTrigger => "iBeamSmart-ExtTrigger",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Full => "Toptica iBeam smart laser with two channels, fine and external trigger options",
            Self::Simple => "Toptica iBeam smart laser with a single channel and no option",
            Self::Fine => "Toptica iBeam smart laser with channel 1 and fine option",
            Self::ExtTrigger => "Toptica iBeam smart laser with channel 2 and external trigger",
        }
    }

    /// Commands that park the parts this variant hides.
    fn setup(self) -> &'static [&'static str] {
        match self {
            Self::Full => &[],
            Self::Simple => &["di ext", "fine off", "ch 2 pow 0", "di 2"],
            Self::Fine => &["di ext", "ch 2 pow 0", "di 2"],
            Self::ExtTrigger => &["fine off", "ch 1 pow 0", "di 1"],
        }
    }
}

/// Configuration for the iBeam smart adapter
#[derive(Debug, Clone, Deserialize)]
pub struct IBeamSmartConfig {
    /// Port and timing.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Driven parts of the controller (default: full)
    #[serde(default)]
    pub variant: IBeamVariant,
    /// Lines read while waiting for `[OK]` (default: 32)
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

fn default_max_lines() -> usize {
    32
}

fn default_baud_rate() -> u32 {
    115200
}

impl IBeamSmartConfig {
    /// Full variant on `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(port),
            variant: IBeamVariant::default(),
            max_lines: default_max_lines(),
        }
    }

    fn validate(&self) -> AdapterResult<()> {
        self.transport.validate()?;
        if self.max_lines == 0 {
            return Err(AdapterError::Configuration(
                "max_lines must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Factory for iBeam smart adapters.
pub struct IBeamSmartFactory;

impl DriverFactory for IBeamSmartFactory {
    fn driver_type(&self) -> &'static str {
        "ibeam_smart"
    }

    fn name(&self) -> &'static str {
        "Toptica iBeam smart"
    }

    fn validate(&self, config: &toml::Value) -> AdapterResult<()> {
        let cfg: IBeamSmartConfig = parse_driver_config(config.clone())?;
        cfg.validate()
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, AdapterResult<Arc<dyn DeviceAdapter>>> {
        Box::pin(async move {
            let cfg: IBeamSmartConfig = parse_driver_config(config)?;
            Ok(Arc::new(IBeamSmart::new(&cfg)?) as Arc<dyn DeviceAdapter>)
        })
    }
}

// =============================================================================
// Laser - command/ack exchanges
// =============================================================================

fn data_not_found(what: &str) -> AdapterError {
    AdapterError::device(DATA_NOT_FOUND, format!("could not find {} in the reply", what))
}

/// Number between `start` and `end` on `line`, e.g. `Pmax: 150 mW`.
fn number_between(line: &str, start: &str, end: &str) -> AdapterResult<f64> {
    let rest = match line.find(start) {
        Some(at) => &line[at + start.len()..],
        None => return Err(data_not_found(start)),
    };
    let text = match rest.find(end) {
        Some(at) => &rest[..at],
        None => rest,
    };
    parse_f64_field(text.trim())
}

fn on_off(on: bool) -> &'static str {
    if on {
        ON
    } else {
        OFF
    }
}

#[derive(Clone)]
struct Laser {
    transport: SharedTransport,
    max_lines: usize,
    table: WeakPropertyTable,
}

impl Laser {
    fn command(verb: &str) -> Command {
        Command::new(verb).separator(" ")
    }

    async fn exchange(&self, command: Command) -> AdapterResult<Vec<String>> {
        self.transport
            .query_until_ack(&command, &RULES, CR, self.max_lines)
            .await
    }

    async fn send(&self, command: Command) -> AdapterResult<()> {
        self.exchange(command).await.map(|_| ())
    }

    /// `sta ...`; the last line saying ON or OFF wins.
    async fn status(&self, command: Command) -> AdapterResult<bool> {
        let lines = self.exchange(command).await?;
        let mut status = None;
        for line in &lines {
            if line.contains("ON") {
                status = Some(true);
            } else if line.contains("OFF") {
                status = Some(false);
            }
        }
        status.ok_or_else(|| data_not_found("ON/OFF status"))
    }

    async fn line_containing(&self, verb: &str, needle: &str) -> AdapterResult<String> {
        self.exchange(Self::command(verb))
            .await?
            .into_iter()
            .find(|line| line.contains(needle))
            .ok_or_else(|| data_not_found(needle))
    }

    async fn serial(&self) -> AdapterResult<String> {
        let line = self.line_containing("id", "iBEAM").await?;
        let at = line.find("iBEAM").unwrap_or(0);
        Ok(line[at..].trim().to_string())
    }

    async fn firmware(&self) -> AdapterResult<String> {
        Ok(self.line_containing("ver", "iB").await?.trim().to_string())
    }

    async fn max_power(&self) -> AdapterResult<f64> {
        let line = self.line_containing("sh data", "Pmax:").await?;
        number_between(&line, "Pmax:", " mW")
    }

    async fn fine_percentage(&self, letter: char) -> AdapterResult<f64> {
        let line = self
            .line_containing("sh data", &format!("fine {}", letter))
            .await?;
        number_between(&line, "-> ", " %")
    }

    async fn power(&self, channel: u8) -> AdapterResult<f64> {
        let tag = format!("CH{}, PWR:", channel);
        let line = self.line_containing("sh level pow", &tag).await?;
        number_between(&line, &tag, " mW")
    }

    async fn clip_status(&self) -> AdapterResult<String> {
        let lines = self.exchange(Self::command("sta").param("clip")).await?;
        let Some(line) = lines.iter().map(|l| l.trim()).find(|l| !l.is_empty()) else {
            return Err(data_not_found("clip status"));
        };
        if line.contains("FAIL") {
            Err(AdapterError::device(CLIP_FAIL, format!("laser clip fail: {}", line)))
        } else if line.contains("PASS") || line.contains("GOOD") {
            Ok(line.to_string())
        } else {
            Err(AdapterError::device(
                UNEXPECTED_CLIP_STATUS,
                format!("unexpected clip status '{}'", line),
            ))
        }
    }

    async fn set_laser(&self, on: bool) -> AdapterResult<()> {
        self.send(Self::command("la").param(if on { "on" } else { "off" }))
            .await
    }

    async fn set_power(&self, channel: u8, power: f64) -> AdapterResult<()> {
        let command = Self::command("ch")
            .param(channel)
            .param("pow")
            .param(format_significant(power, 6));
        self.send(command).await
    }

    async fn set_enabled(&self, target: &str, on: bool) -> AdapterResult<()> {
        self.send(Self::command(if on { "en" } else { "di" }).param(target))
            .await
    }

    async fn set_fine_percentage(&self, letter: char, percentage: f64) -> AdapterResult<()> {
        let command = Self::command("fine")
            .param(letter)
            .param(format_significant(percentage, 6));
        self.send(command).await
    }

    /// Channel 2 cannot change while the external trigger is on. The trigger
    /// is read from the laser each time and the cache follows it.
    async fn set_channel2(&self, on: bool) -> AdapterResult<()> {
        let ext_on = self.status(Self::command("sta").param("ext")).await?;
        if let Some(table) = self.table.upgrade() {
            table.notify_changed(EXT, ext_on)?;
        }
        if ext_on {
            return Err(AdapterError::ConflictingState(
                "cannot change channel 2 while the external trigger is on".to_string(),
            ));
        }
        self.set_enabled("2", on).await
    }

    /// Fine on moves all power to channel 1 and zeroes Fine A first.
    async fn set_fine(&self, on: bool) -> AdapterResult<()> {
        if on {
            self.set_power(2, 0.0).await?;
            self.set_fine_percentage('a', 0.0).await?;
            if let Some(table) = self.table.upgrade() {
                table.notify_changed(FINE_A, 0.0)?;
            }
        }
        self.send(Self::command("fine").param(if on { "on" } else { "off" }))
            .await
    }
}

// =============================================================================
// IBeamSmart
// =============================================================================

/// Adapter for a Toptica iBeam smart laser.
pub struct IBeamSmart {
    properties: PropertyTable,
    transport: SharedTransport,
    baud_rate: u32,
    variant: IBeamVariant,
    max_lines: usize,
}

impl IBeamSmart {
    /// Adapter that opens `config.transport.port` on initialize.
    pub fn new(config: &IBeamSmartConfig) -> AdapterResult<Self> {
        let transport = SharedTransport::detached("ibeam_smart", config.transport.settings());
        Self::with_transport(config, transport)
    }

    /// Adapter over an existing transport.
    pub fn with_transport(
        config: &IBeamSmartConfig,
        transport: SharedTransport,
    ) -> AdapterResult<Self> {
        config.validate()?;
        let properties = PropertyTable::new();
        properties.register(PropertySlot::text(PORT, config.transport.port.clone()).pre_init())?;

        Ok(Self {
            properties,
            transport,
            baud_rate: config.transport.baud_or(default_baud_rate()),
            variant: config.variant,
            max_lines: config.max_lines,
        })
    }

    /// Which parts of the controller this adapter drives.
    pub fn variant(&self) -> IBeamVariant {
        self.variant
    }

    fn laser(&self) -> Laser {
        Laser {
            transport: self.transport.clone(),
            max_lines: self.max_lines,
            table: self.properties.downgrade(),
        }
    }

    fn register_switch(
        &self,
        laser: &Laser,
        name: &'static str,
        status: &'static str,
        target: &'static str,
    ) -> AdapterResult<()> {
        self.properties.register(
            PropertySlot::switch(name, false)
                .on_get(bind_query(laser.clone(), move |l| async move {
                    let command = Laser::command("sta").param(status);
                    l.status(command).await.map(PropertyValue::from)
                }))
                .on_set(bind_command(laser.clone(), move |l, v| async move {
                    l.set_enabled(target, v.require_i64()? == 1).await
                })),
        )
    }

    fn register_power(&self, laser: &Laser, name: &'static str, channel: u8, max: f64) -> AdapterResult<()> {
        self.properties.register(
            PropertySlot::float(name, 0.0)
                .with_range(0.0, max)
                .with_unit("mW")
                .on_get(bind_query(laser.clone(), move |l| async move {
                    l.power(channel).await.map(PropertyValue::from)
                }))
                .on_set(bind_command(laser.clone(), move |l, v| async move {
                    l.set_power(channel, v.require_f64()?).await
                })),
        )
    }

    fn register_fine_percentage(&self, laser: &Laser, name: &'static str, letter: char) -> AdapterResult<()> {
        self.properties.register(
            PropertySlot::float(name, 0.0)
                .with_range(0.0, 100.0)
                .with_unit("%")
                .on_get(bind_query(laser.clone(), move |l| async move {
                    l.fine_percentage(letter).await.map(PropertyValue::from)
                }))
                .on_set(bind_command(laser.clone(), move |l, v| async move {
                    l.set_fine_percentage(letter, v.require_f64()?).await
                })),
        )
    }

    async fn bring_up(&self, laser: &Laser) -> AdapterResult<Identity> {
        // without these the ack never comes and sh data misses lines
        laser.send(Laser::command("prom").param("off")).await?;
        laser.send(Laser::command("talk").param("usual")).await?;

        for step in self.variant.setup() {
            laser.send(Laser::command(step)).await?;
        }

        let serial = laser.serial().await?;
        let max_power = laser.max_power().await?;
        let firmware = laser.firmware().await?;
        let clip = laser.clip_status().await?;
        let ext_on = if self.variant.has_channel2() {
            laser.status(Laser::command("sta").param("ext")).await?
        } else {
            false
        };
        debug!(serial = %serial, firmware = %firmware, max_power, clip = %clip, ext_on, "laser identified");

        Ok(Identity {
            serial,
            firmware,
            max_power,
            clip,
            ext_on,
        })
    }

    fn register_runtime(&self, laser: &Laser, identity: Identity) -> AdapterResult<()> {
        let props = &self.properties;
        props.register(PropertySlot::text(SERIAL_ID, identity.serial).read_only())?;
        props.register(PropertySlot::text(FIRMWARE, identity.firmware).read_only())?;
        props.register(PropertySlot::float(MAX_POWER, identity.max_power).read_only())?;
        props.register(
            PropertySlot::text(CLIP, identity.clip)
                .read_only()
                .on_get(bind_query(laser.clone(), |l| async move {
                    l.clip_status().await.map(PropertyValue::from)
                })),
        )?;
        props.register(
            PropertySlot::text(LASER, OFF)
                .with_allowed([OFF, ON])
                .on_get(bind_query(laser.clone(), |l| async move {
                    let on = l.status(Laser::command("sta").param("la")).await?;
                    Ok(PropertyValue::from(on_off(on)))
                }))
                .on_set(bind_command(laser.clone(), |l, v| async move {
                    l.set_laser(v.require_str()? == ON).await
                })),
        )?;

        if self.variant.has_channel1() {
            self.register_power(laser, CH1_POWER, 1, identity.max_power)?;
            self.register_switch(laser, CH1_ENABLE, "ch 1", "1")?;
        }

        if self.variant.has_channel2() {
            self.register_power(laser, CH2_POWER, 2, identity.max_power)?;
            props.register(
                PropertySlot::switch(CH2_ENABLE, false)
                    .on_get(bind_query(laser.clone(), |l| async move {
                        let command = Laser::command("sta").param("ch 2");
                        l.status(command).await.map(PropertyValue::from)
                    }))
                    .on_set(bind_command(laser.clone(), |l, v| async move {
                        l.set_channel2(v.require_i64()? == 1).await
                    })),
            )?;
            self.register_switch(laser, EXT, "ext", "ext")?;
            props.notify_changed(EXT, identity.ext_on)?;
        }

        if self.variant.has_fine() {
            props.register(
                PropertySlot::switch(FINE, false)
                    .on_get(bind_query(laser.clone(), |l| async move {
                        let command = Laser::command("sta").param("fine");
                        l.status(command).await.map(PropertyValue::from)
                    }))
                    .on_set(bind_command(laser.clone(), |l, v| async move {
                        l.set_fine(v.require_i64()? == 1).await
                    })),
            )?;
            self.register_fine_percentage(laser, FINE_A, 'a')?;
            self.register_fine_percentage(laser, FINE_B, 'b')?;
        }
        Ok(())
    }
}

/// Read-only facts gathered during initialize.
struct Identity {
    serial: String,
    firmware: String,
    max_power: f64,
    clip: String,
    ext_on: bool,
}

#[async_trait]
impl DeviceAdapter for IBeamSmart {
    fn name(&self) -> &str {
        self.variant.device_name()
    }

    fn description(&self) -> &str {
        self.variant.description()
    }

    fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    #[instrument(skip(self), fields(variant = ?self.variant), err)]
    async fn initialize(&self) -> AdapterResult<()> {
        self.properties.lifecycle().ensure_can_initialize()?;

        let port = self.properties.cached(PORT)?.to_string();
        self.transport.open(&port, self.baud_rate).await?;
        let laser = self.laser();
        let identity = match self.bring_up(&laser).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "iBeam smart did not come up");
                self.transport.close().await;
                return Err(e);
            }
        };
        self.register_runtime(&laser, identity)?;

        self.properties.lifecycle().mark_initialized();
        info!(port = %port, variant = ?self.variant, "iBeam smart initialized");
        Ok(())
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        let previous = self.properties.lifecycle().begin_shutdown();
        if previous.is_none() {
            return Ok(());
        }

        // the controller keeps emitting when its software stops
        let result = if previous == Some(AdapterState::Initialized) {
            self.laser().set_laser(false).await
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            warn!(error = %e, "could not switch the laser off during shutdown");
        }
        self.transport.close().await;
        result
    }

    async fn busy(&self) -> AdapterResult<bool> {
        Ok(false)
    }
}
