//! PI Piezo Z Stage / Focus Lock Adapter
//!
//! Reference: PI General Command Set (GCS) manual, E-709 / E-753 controllers
//!
//! Protocol Overview:
//! - Format: GCS ASCII over RS-232 or USB virtual COM
//! - Baud: 115200 default, 8N1
//! - Command terminator: LF (`\n`)
//! - Response terminator: LF (`\n`)
//! - Set commands (`MOV`, `SVO`, `SPA`, `CCL`) send no reply; errors are
//!   collected with `ERR?`, which returns an integer (0 = no error)
//! - `#5` (single byte 0x05) polls motion status without a terminator
//!
//! Response Formats:
//! - `POS? Z` -> `"Z=12.3450\n"`
//! - `TSP? 1` -> `"1=12.3450\n"`
//! - `VOL? 1` -> `"1=55.000\n"`
//! - `ERR?`   -> `"0\n"`
//!
//! # Sensor modes
//!
//! The servo loop can close on the internal capacitive sensor (normal stage
//! operation) or on an external sensor (focus lock). Switching reconfigures
//! the servo input matrix, the P/I gains and the soft limits. While the lock
//! is engaged the controller owns the position and `Position` writes are
//! refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adapter_core::config::{parse_driver_config, TransportConfig};
use adapter_core::error::UNKNOWN_DEVICE_ERROR;
use adapter_core::protocol::{format_significant, parse_f64_field, parse_i64_field, LF};
use adapter_core::{
    bind_command, bind_query, AdapterError, AdapterResult, Command, DeviceAdapter,
    DeviceErrorEntry, DriverFactory, ErrorTable, PropertySlot, PropertyTable, PropertyValue,
    SharedTransport,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

const PORT: &str = "Port";
const AXIS: &str = "Axis";
const LIMIT: &str = "Limit_um";
const POSITION: &str = "Position";
const EXTERNAL: &str = "External sensor";
const STEP_SIZE: &str = "StepSizeUm";

/// Offset added to GCS error numbers.
const GCS_ERROR_OFFSET: i32 = 10100;
const SERVO_SETTLE: Duration = Duration::from_millis(20);
const MOVE_SETTLE: Duration = Duration::from_millis(20);
const SPAN_UM: f64 = 50.0;

const ENTRIES: &[DeviceErrorEntry] = &[
    DeviceErrorEntry::fault("1", 10101, "Parameter syntax error"),
    DeviceErrorEntry::fault("2", 10102, "Unknown command"),
    DeviceErrorEntry::fault("3", 10103, "Command length out of limits or command buffer overrun"),
    DeviceErrorEntry::fault("5", 10105, "Unallowable move attempted on unreferenced axis, or move attempted with servo off"),
    DeviceErrorEntry::fault("7", 10107, "Position out of limits"),
    DeviceErrorEntry::fault("8", 10108, "Velocity out of limits"),
    DeviceErrorEntry::fault("10", 10110, "Controller was stopped by command"),
    DeviceErrorEntry::fault("15", 10115, "Invalid axis identifier"),
    DeviceErrorEntry::fault("17", 10117, "Parameter out of range"),
    DeviceErrorEntry::fault("23", 10123, "Invalid axis"),
    DeviceErrorEntry::fault("24", 10124, "Incorrect number of parameters"),
    DeviceErrorEntry::fault("25", 10125, "Invalid floating point number"),
    DeviceErrorEntry::fault("26", 10126, "Parameter missing"),
    DeviceErrorEntry::fault("56", 10156, "Password invalid"),
    DeviceErrorEntry::fault("60", 10160, "Protected parameter: current command level too low"),
];

/// GCS error numbers reported by `ERR?`.
pub const GCS_ERRORS: ErrorTable = ErrorTable::new(ENTRIES);

// =============================================================================
// PiFocusLockFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the PI focus lock adapter
#[derive(Debug, Clone, Deserialize)]
pub struct PiFocusLockConfig {
    /// Port and timing.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Controller axis name (default: "Z")
    #[serde(default = "default_axis")]
    pub axis: String,
    /// Travel limit in µm (default: 500)
    #[serde(default = "default_limit_um")]
    pub limit_um: f64,
}

fn default_axis() -> String {
    "Z".to_string()
}

fn default_limit_um() -> f64 {
    500.0
}

fn default_baud_rate() -> u32 {
    115200
}

impl PiFocusLockConfig {
    /// Config with default axis and limit.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::new(port),
            axis: default_axis(),
            limit_um: default_limit_um(),
        }
    }

    fn validate(&self) -> AdapterResult<()> {
        self.transport.validate()?;
        if self.axis.trim().is_empty() || self.axis.contains(char::is_whitespace) {
            return Err(AdapterError::Configuration(format!(
                "invalid axis name '{}'",
                self.axis
            )));
        }
        if !(self.limit_um > 0.0) {
            return Err(AdapterError::Configuration(format!(
                "limit_um must be positive, got {}",
                self.limit_um
            )));
        }
        Ok(())
    }
}

/// Factory for PI focus lock adapters.
pub struct PiFocusLockFactory;

impl DriverFactory for PiFocusLockFactory {
    fn driver_type(&self) -> &'static str {
        "pi_focus_lock"
    }

    fn name(&self) -> &'static str {
        "Physik Instrumente (PI) Focus Lock"
    }

    fn validate(&self, config: &toml::Value) -> AdapterResult<()> {
        let cfg: PiFocusLockConfig = parse_driver_config(config.clone())?;
        cfg.validate()
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, AdapterResult<Arc<dyn DeviceAdapter>>> {
        Box::pin(async move {
            let cfg: PiFocusLockConfig = parse_driver_config(config)?;
            Ok(Arc::new(PiFocusLock::new(&cfg)?) as Arc<dyn DeviceAdapter>)
        })
    }
}

// =============================================================================
// Controller - GCS exchanges for one axis
// =============================================================================

fn number(value: f64) -> String {
    format_significant(value, 6)
}

/// Value after the last `=` of a GCS reply, or the whole reply.
fn reply_value(reply: &str) -> &str {
    let value = match reply.rfind('=') {
        Some(at) => &reply[at + 1..],
        None => reply,
    };
    value.trim()
}

#[derive(Clone)]
struct Controller {
    transport: SharedTransport,
    axis: Arc<str>,
    locked: Arc<AtomicBool>,
    check_moving: Arc<AtomicBool>,
}

impl Controller {
    fn new(transport: SharedTransport, axis: &str) -> Self {
        Self {
            transport,
            axis: Arc::from(axis),
            locked: Arc::new(AtomicBool::new(false)),
            check_moving: Arc::new(AtomicBool::new(true)),
        }
    }

    fn gcs(verb: &str) -> Command {
        Command::new(verb).separator(" ").terminated(LF)
    }

    fn axis_command(&self, verb: &str) -> Command {
        Self::gcs(verb).param(&*self.axis)
    }

    async fn send(&self, command: Command) -> AdapterResult<()> {
        self.transport.send_only(&command).await
    }

    async fn query(&self, command: Command) -> AdapterResult<String> {
        let reply = self.transport.query_line(&command, LF).await?;
        Ok(reply.trim_end_matches('\r').to_string())
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// `ERR?`; a non-zero number becomes a device error.
    async fn check_error(&self) -> AdapterResult<()> {
        let reply = self.query(Self::gcs("ERR?")).await?;
        let code = parse_i64_field(reply_value(&reply))?;
        if code == 0 {
            return Ok(());
        }
        Err(match GCS_ERRORS.lookup(&code.to_string()) {
            Some(entry) => AdapterError::device(entry.code, entry.description),
            None => {
                let host_code = i32::try_from(code)
                    .ok()
                    .and_then(|n| GCS_ERROR_OFFSET.checked_add(n))
                    .unwrap_or(UNKNOWN_DEVICE_ERROR);
                AdapterError::device(host_code, format!("controller error {}", code))
            }
        })
    }

    async fn set_servo(&self, on: bool) -> AdapterResult<()> {
        self.send(self.axis_command("SVO").param(u8::from(on))).await?;
        tokio::time::sleep(SERVO_SETTLE).await;
        Ok(())
    }

    async fn set_parameter(&self, target: &str, id: &str, value: &str) -> AdapterResult<()> {
        self.send(Self::gcs("SPA").param(target).param(id).param(value))
            .await
    }

    /// Motion status through `#5`. A controller that does not answer, or
    /// answers with something other than a number, is never asked again.
    async fn moving(&self) -> AdapterResult<bool> {
        if !self.check_moving.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let poll = Command::new("\x05").terminated(b"");
        let status = match self.query(poll).await {
            Ok(reply) => parse_i64_field(reply_value(&reply)),
            Err(e) => Err(e),
        };
        match status {
            Ok(code) => Ok(code != 0),
            Err(e) => {
                warn!(error = %e, "motion poll unsupported, disabling busy check");
                // two reads clear the error the unsupported poll left behind
                for _ in 0..2 {
                    if let Err(e) = self.check_error().await {
                        debug!(error = %e, "clearing controller error");
                    }
                }
                self.check_moving.store(false, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    async fn position(&self) -> AdapterResult<f64> {
        let command = if self.is_locked() {
            Self::gcs("TSP?").param(1)
        } else {
            self.axis_command("POS?")
        };
        let reply = self.query(command).await?;
        parse_f64_field(reply_value(&reply))
    }

    async fn move_to(&self, position: f64) -> AdapterResult<()> {
        if self.is_locked() {
            return Err(AdapterError::ConflictingState(
                "position is held by the external sensor lock".to_string(),
            ));
        }
        self.send(self.axis_command("MOV").param(number(position)))
            .await?;
        tokio::time::sleep(MOVE_SETTLE).await;
        self.check_error().await
    }

    /// Close the servo loop on the internal sensor and restore stage limits.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    async fn use_internal_sensor(&self) -> AdapterResult<()> {
        let axis = &*self.axis;
        self.set_servo(false).await?;
        self.set_parameter(axis, "0x07000500", "1").await?;
        self.set_parameter(axis, "0x07000501", "0").await?;
        self.set_parameter(axis, "0x07000300", "0.02").await?;
        self.set_parameter(axis, "0x07000301", "1.567286e-4").await?;
        self.set_parameter("1", "0x0c000000", "-30").await?;
        self.set_parameter("1", "0x0c000001", "130").await?;
        self.set_servo(true).await?;
        self.check_error().await?;
        self.locked.store(false, Ordering::SeqCst);
        info!("focus lock released, internal sensor");
        Ok(())
    }

    /// Close the servo loop on the external sensor, with soft limits
    /// centered on the sensor's current reading.
    #[instrument(skip(self), fields(axis = %self.axis), err)]
    async fn use_external_sensor(&self) -> AdapterResult<()> {
        let axis = &*self.axis;
        self.set_servo(false).await?;
        self.set_parameter(axis, "0x07000500", "0").await?;
        self.set_parameter(axis, "0x07000501", "1").await?;
        self.set_parameter(axis, "0x07000300", "0.02").await?;
        self.set_parameter(axis, "0x07000301", "2e-3").await?;

        let reply = self.query(Self::gcs("VOL?").param(1)).await?;
        let reading = parse_f64_field(reply_value(&reply))?;
        let low = reading - SPAN_UM / 2.0;
        let high = low + SPAN_UM;
        debug!(reading, low, high, "external sensor soft limits");

        self.set_parameter("1", "0x0c000000", &number(low)).await?;
        self.set_parameter("1", "0x0c000001", &number(high)).await?;
        self.set_servo(true).await?;
        self.send(self.axis_command("MOV").param(0)).await?;
        tokio::time::sleep(MOVE_SETTLE).await;
        self.check_error().await?;
        self.locked.store(true, Ordering::SeqCst);
        info!("focus lock engaged, external sensor");
        Ok(())
    }
}

// =============================================================================
// PiFocusLock
// =============================================================================

/// Adapter for a PI piezo Z stage used as a focus lock.
pub struct PiFocusLock {
    properties: PropertyTable,
    transport: SharedTransport,
    baud_rate: u32,
    controller: RwLock<Option<Controller>>,
}

impl PiFocusLock {
    /// Adapter that opens `config.transport.port` on initialize.
    pub fn new(config: &PiFocusLockConfig) -> AdapterResult<Self> {
        let transport = SharedTransport::detached("pi_focus_lock", config.transport.settings());
        Self::with_transport(config, transport)
    }

    /// Adapter over an existing transport.
    pub fn with_transport(
        config: &PiFocusLockConfig,
        transport: SharedTransport,
    ) -> AdapterResult<Self> {
        config.validate()?;
        let properties = PropertyTable::new();
        properties.register(PropertySlot::text(PORT, config.transport.port.clone()).pre_init())?;
        properties.register(PropertySlot::text(AXIS, config.axis.clone()).pre_init())?;
        properties.register(
            PropertySlot::float(LIMIT, config.limit_um)
                .pre_init()
                .with_unit("um")
                .with_validator(|v| match v.as_f64() {
                    Some(limit) if limit > 0.0 => Ok(()),
                    _ => Err("limit must be positive".to_string()),
                }),
        )?;

        Ok(Self {
            properties,
            transport,
            baud_rate: config.transport.baud_or(default_baud_rate()),
            controller: RwLock::new(None),
        })
    }

    fn controller(&self) -> Option<Controller> {
        self.controller.read().clone()
    }

    /// Command level, internal sensor, then the starting position.
    async fn bring_up(controller: &Controller) -> AdapterResult<f64> {
        // poll once so an unsupported #5 is detected before use
        controller.moving().await?;
        controller
            .send(Controller::gcs("CCL").param(1).param("advanced"))
            .await?;
        controller.use_internal_sensor().await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.position().await
    }

    fn register_runtime(&self, controller: &Controller, limit: f64, position: f64) -> AdapterResult<()> {
        self.properties.register(
            PropertySlot::float(STEP_SIZE, 0.01)
                .with_unit("um")
                .with_validator(|v| match v.as_f64() {
                    Some(step) if step > 0.0 => Ok(()),
                    _ => Err("step size must be positive".to_string()),
                }),
        )?;
        self.properties.register(
            PropertySlot::float(POSITION, position)
                .with_range(0.0, limit)
                .with_unit("um")
                .on_get(bind_query(controller.clone(), |c| async move {
                    c.position().await.map(PropertyValue::from)
                }))
                .on_set(bind_command(controller.clone(), |c, v| async move {
                    c.move_to(v.require_f64()?).await
                })),
        )?;
        self.properties.register(
            PropertySlot::switch(EXTERNAL, false)
                .with_description("Servo loop closed on the external sensor")
                .on_get(bind_query(controller.clone(), |c| async move {
                    Ok(PropertyValue::from(c.is_locked()))
                }))
                .on_set(bind_command(controller.clone(), |c, v| async move {
                    if v.require_i64()? == 1 {
                        c.use_external_sensor().await
                    } else {
                        c.use_internal_sensor().await
                    }
                })),
        )?;
        Ok(())
    }
}

#[async_trait]
impl DeviceAdapter for PiFocusLock {
    fn name(&self) -> &str {
        "PIZStage"
    }

    fn description(&self) -> &str {
        "Physik Instrumente (PI) Focus Lock"
    }

    fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    #[instrument(skip(self), err)]
    async fn initialize(&self) -> AdapterResult<()> {
        self.properties.lifecycle().ensure_can_initialize()?;

        let port = self.properties.cached(PORT)?.to_string();
        let axis = self.properties.cached(AXIS)?.to_string();
        let limit = self.properties.cached(LIMIT)?.require_f64()?;

        self.transport.open(&port, self.baud_rate).await?;
        let controller = Controller::new(self.transport.clone(), &axis);

        let position = match Self::bring_up(&controller).await {
            Ok(position) => position,
            Err(e) => {
                warn!(error = %e, "PI focus lock did not come up");
                self.transport.close().await;
                return Err(e);
            }
        };

        self.register_runtime(&controller, limit, position)?;
        *self.controller.write() = Some(controller);
        self.properties.lifecycle().mark_initialized();
        info!(port = %port, axis = %axis, position, "PI focus lock initialized");
        Ok(())
    }

    async fn shutdown(&self) -> AdapterResult<()> {
        let previous = self.properties.lifecycle().begin_shutdown();
        if previous.is_none() {
            return Ok(());
        }

        let controller = self.controller.write().take();
        let result = match controller {
            Some(controller) => controller.use_internal_sensor().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "could not restore internal sensor during shutdown");
        }
        self.transport.close().await;
        result
    }

    async fn busy(&self) -> AdapterResult<bool> {
        match self.controller() {
            Some(controller) => controller.moving().await,
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_driver_type() {
        let factory = PiFocusLockFactory;
        assert_eq!(factory.driver_type(), "pi_focus_lock");
        assert_eq!(factory.name(), "Physik Instrumente (PI) Focus Lock");
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = PiFocusLockFactory;

        let valid = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            axis = "Z"
            limit_um = 100.0
        });
        assert!(factory.validate(&valid).is_ok());

        let bad_axis = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            axis = "A B"
        });
        assert!(factory.validate(&bad_axis).is_err());

        let bad_limit = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            limit_um = -1.0
        });
        assert!(factory.validate(&bad_limit).is_err());
    }

    #[test]
    fn test_reply_value() {
        assert_eq!(reply_value("Z=12.3450"), "12.3450");
        assert_eq!(reply_value("1=0 1=55.5 "), "55.5");
        assert_eq!(reply_value(" 0"), "0");
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number(55.3 - 25.0), "30.3");
        assert_eq!(number(0.0), "0");
        assert_eq!(number(-30.0), "-30");
    }
}
