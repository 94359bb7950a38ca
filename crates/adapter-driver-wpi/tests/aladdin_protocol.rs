//! Aladdin adapter against a scripted pump.

use std::time::Duration;

use adapter_core::mock::{ScriptHandle, ScriptedPort};
use adapter_core::{AdapterError, AdapterState, DeviceAdapter, PropertyValue, SharedTransport};
use adapter_driver_wpi::{AladdinConfig, AladdinPump};

fn pump_chain(count: u8) -> (AladdinPump, ScriptHandle) {
    let (port, script) = ScriptedPort::new(b"\r");
    let mut config = AladdinConfig::new("/dev/ttyUSB0");
    config.pump_count = count;
    let transport =
        SharedTransport::from_port("aladdin", Box::new(port), config.transport.settings());
    let pump = AladdinPump::with_transport(&config, transport).unwrap();
    (pump, script)
}

async fn initialized() -> (AladdinPump, ScriptHandle) {
    let (pump, script) = pump_chain(1);
    pump.initialize().await.unwrap();
    (pump, script)
}

#[tokio::test]
async fn test_initialize_registers_properties_per_address() {
    let (pump, script) = pump_chain(2);
    assert!(!pump.properties().contains("Rate (uL/min) Pump0"));

    pump.initialize().await.unwrap();

    assert_eq!(pump.state(), AdapterState::Initialized);
    for address in 0..2 {
        for base in [
            "Volume (uL)",
            "Run",
            "Rate (uL/min)",
            "Diameter (mm)",
            "Phase",
            "Function",
            "Direction",
        ] {
            let name = format!("{} Pump{}", base, address);
            assert!(pump.properties().contains(&name), "missing {}", name);
        }
    }
    // initialization itself talks to nobody
    assert_eq!(script.write_count(), 0);
}

#[tokio::test]
async fn test_rate_in_microliters_per_hour_is_normalized() {
    let (pump, script) = initialized().await;
    script.on("0RAT", "\x0200S00300UH\x03");

    let rate = pump.get_property("Rate (uL/min) Pump0").await.unwrap();

    assert_eq!(rate, PropertyValue::Float(5.0));
    assert_eq!(script.writes(), vec!["0RAT"]);
}

#[tokio::test]
async fn test_rate_in_milliliters_per_hour_is_normalized() {
    let (pump, script) = initialized().await;
    script.on("0RAT", "\x0200S0.600MH\x03");

    let rate = pump.get_property("Rate (uL/min) Pump0").await.unwrap();
    assert_eq!(rate, PropertyValue::Float(10.0));
}

#[tokio::test]
async fn test_volume_write_through() {
    let (pump, script) = initialized().await;
    script.on("0VOL12.5", "\x0200S\x03");
    script.on("0VOL", "\x0200S12.50UL\x03");

    pump.set_property("Volume (uL) Pump0", 12.5.into())
        .await
        .unwrap();
    let volume = pump.get_property("Volume (uL) Pump0").await.unwrap();

    assert_eq!(volume, PropertyValue::Float(12.5));
    assert_eq!(script.writes(), vec!["0VOL12.5", "0VOL"]);
}

#[tokio::test]
async fn test_volume_in_milliliters_converts_to_microliters() {
    let (pump, script) = initialized().await;
    script.on("0VOL", "\x0200S1.200ML\x03");

    let volume = pump.get_property("Volume (uL) Pump0").await.unwrap();
    assert_eq!(volume, PropertyValue::Float(1200.0));
}

#[tokio::test]
async fn test_rate_set_uses_microliters_per_minute() {
    let (pump, script) = initialized().await;
    script.on("0RAT250UM", "\x0200S\x03");

    pump.set_property("Rate (uL/min) Pump0", 250.0.into())
        .await
        .unwrap();

    assert_eq!(script.writes(), vec!["0RAT250UM"]);
    assert_eq!(
        pump.properties().cached("Rate (uL/min) Pump0").unwrap(),
        PropertyValue::Float(250.0)
    );
}

#[tokio::test]
async fn test_small_values_fit_the_numeric_field() {
    let (pump, script) = initialized().await;
    script.on("0VOL0.001", "\x0200S\x03");
    script.on("0RAT0.012UM", "\x0200S\x03");
    script.on("0DIA0.123", "\x0200S\x03");

    pump.set_property("Volume (uL) Pump0", 0.001234.into())
        .await
        .unwrap();
    pump.set_property("Rate (uL/min) Pump0", 0.01234.into())
        .await
        .unwrap();
    pump.set_property("Diameter (mm) Pump0", 0.1234.into())
        .await
        .unwrap();

    assert_eq!(
        script.writes(),
        vec!["0VOL0.001", "0RAT0.012UM", "0DIA0.123"]
    );
}

#[tokio::test]
async fn test_out_of_range_diameter_is_rejected_without_io() {
    let (pump, script) = initialized().await;

    let err = pump
        .set_property("Diameter (mm) Pump0", 60.0.into())
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::InvalidArgument(_)));
    assert_eq!(script.write_count(), 0);
    assert_eq!(
        pump.properties().cached("Diameter (mm) Pump0").unwrap(),
        PropertyValue::Float(0.0)
    );
}

#[tokio::test]
async fn test_device_error_leaves_cache_unchanged() {
    let (pump, script) = initialized().await;
    script.on("0RAT100UM", "\x0200S\x03");
    script.on("0RAT9000UM", "\x0200S?OOR\x03");

    pump.set_property("Rate (uL/min) Pump0", 100.0.into())
        .await
        .unwrap();
    let err = pump
        .set_property("Rate (uL/min) Pump0", 9000.0.into())
        .await
        .unwrap_err();

    assert_eq!(err.code(), 10203);
    assert_eq!(
        pump.properties().cached("Rate (uL/min) Pump0").unwrap(),
        PropertyValue::Float(100.0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unrecognized_command_and_alarm_frames() {
    let (pump, script) = initialized().await;
    script.on("0PHN", "\x0200S?\x03");
    script.on("0DIA", "\x0200A?S\x03");

    let err = pump.get_property("Phase Pump0").await.unwrap_err();
    assert_eq!(err.code(), 10201);

    let err = pump.get_property("Diameter (mm) Pump0").await.unwrap_err();
    assert!(matches!(err, AdapterError::DeviceReported { code: 10207, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_silent_pump_times_out() {
    let (pump, _script) = initialized().await;

    let err = pump
        .get_property("Diameter (mm) Pump0")
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::Timeout { .. }));
    assert_eq!(
        pump.properties().cached("Diameter (mm) Pump0").unwrap(),
        PropertyValue::Float(0.0)
    );
}

#[tokio::test]
async fn test_reply_without_etx_is_too_large() {
    let (port, script) = ScriptedPort::new(b"\r");
    let config = AladdinConfig::new("/dev/ttyUSB0");
    let mut settings = config.transport.settings();
    settings.max_response_bytes = 16;
    let transport = SharedTransport::from_port("aladdin", Box::new(port), settings);
    let pump = AladdinPump::with_transport(&config, transport).unwrap();
    pump.initialize().await.unwrap();
    script.on("0VOL", "\x0200S12.34 and then some more noise");

    let err = pump.get_property("Volume (uL) Pump0").await.unwrap_err();
    assert!(matches!(err, AdapterError::ResponseTooLarge { .. }));
}

#[tokio::test]
async fn test_fixed_replies_are_read_by_length() {
    let (pump, script) = initialized().await;
    // trailing bytes past the frame are left for the next purge
    script.on("0DIA", "\x0200S12.34\x03\x0200S");
    script.on("0DIR", "\x0200SINF\x03");

    assert_eq!(
        pump.get_property("Diameter (mm) Pump0").await.unwrap(),
        PropertyValue::Float(12.34)
    );
    assert_eq!(
        pump.get_property("Direction Pump0").await.unwrap(),
        PropertyValue::from("Infuse")
    );
    assert_eq!(script.writes(), vec!["0DIA", "0DIR"]);
}

#[tokio::test(start_paused = true)]
async fn test_short_fixed_reply_is_unrecognized() {
    let (pump, script) = initialized().await;
    script.on("0RAT", "\x0200S00300U");

    let err = pump.get_property("Rate (uL/min) Pump0").await.unwrap_err();

    assert!(matches!(err, AdapterError::UnrecognizedResponse(ref m) if m.contains("12-byte")));
    assert_eq!(
        pump.properties().cached("Rate (uL/min) Pump0").unwrap(),
        PropertyValue::Float(0.0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_early_terminator_in_fixed_reply_is_unrecognized() {
    let (pump, script) = initialized().await;
    script.on("0DIA", "\x0200S12\x03");

    let err = pump
        .get_property("Diameter (mm) Pump0")
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::UnrecognizedResponse(ref m) if m.contains("10-byte")));
}

#[tokio::test]
async fn test_fixed_reply_without_etx_at_its_end_is_unrecognized() {
    let (pump, script) = initialized().await;
    script.on("0RAT", "\x0200S003000UH\x03");

    let err = pump.get_property("Rate (uL/min) Pump0").await.unwrap_err();

    assert!(matches!(err, AdapterError::UnrecognizedResponse(_)));
}

#[tokio::test]
async fn test_malformed_number_is_surfaced() {
    let (pump, script) = initialized().await;
    script.on("0DIA", "\x0200S1x.00\x03");

    let err = pump
        .get_property("Diameter (mm) Pump0")
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::UnrecognizedResponse(_)));
}

#[tokio::test]
async fn test_direction_and_function_round_trip_words() {
    let (pump, script) = initialized().await;
    script.on("0DIR WDR", "\x0200S\x03");
    script.on("0DIR", "\x0200SWDR\x03");
    script.on("0FUNINC", "\x0200S\x03");
    script.on("0FUN", "\x0200SINC\x03");

    pump.set_property("Direction Pump0", "Withdraw".into())
        .await
        .unwrap();
    assert_eq!(
        pump.get_property("Direction Pump0").await.unwrap(),
        PropertyValue::from("Withdraw")
    );

    pump.set_property("Function Pump0", "INC".into())
        .await
        .unwrap();
    assert_eq!(
        pump.get_property("Function Pump0").await.unwrap(),
        PropertyValue::from("INC")
    );
}

#[tokio::test]
async fn test_unknown_function_rejected_before_io() {
    let (pump, script) = initialized().await;

    let err = pump
        .set_property("Function Pump0", "XYZ".into())
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::InvalidArgument(_)));
    assert_eq!(script.write_count(), 0);
}

#[tokio::test]
async fn test_phase_limits_and_query() {
    let (pump, script) = initialized().await;
    script.on("0PHN", "\x0200SP03\x03");

    assert_eq!(
        pump.get_property("Phase Pump0").await.unwrap(),
        PropertyValue::Integer(3)
    );
    assert!(matches!(
        pump.set_property("Phase Pump0", PropertyValue::Integer(42)).await,
        Err(AdapterError::InvalidArgument(_))
    ));
    assert_eq!(script.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_marks_busy_for_settling_delay() {
    let (pump, script) = initialized().await;
    script.on("0RUN", "\x0200I\x03");
    script.on("0", "\x0200I\x03");

    assert!(!pump.busy().await.unwrap());
    pump.set_property("Run Pump0", PropertyValue::Integer(1))
        .await
        .unwrap();
    assert!(pump.busy().await.unwrap());

    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(!pump.busy().await.unwrap());

    assert_eq!(
        pump.get_property("Run Pump0").await.unwrap(),
        PropertyValue::Integer(1)
    );
}

#[tokio::test]
async fn test_second_pump_uses_its_own_address() {
    let (pump, script) = pump_chain(2);
    pump.initialize().await.unwrap();
    script.on("1STP", "\x0201S\x03");

    pump.set_property("Run Pump1", PropertyValue::Integer(0))
        .await
        .unwrap();
    assert_eq!(script.writes(), vec!["1STP"]);
}

#[tokio::test]
async fn test_pre_init_properties_are_locked_after_initialize() {
    let (pump, _script) = pump_chain(1);
    pump.set_property("PumpNr", PropertyValue::Integer(3))
        .await
        .unwrap();
    pump.initialize().await.unwrap();

    assert!(pump.properties().contains("Run Pump2"));
    assert_eq!(
        pump.set_property("Port", "/dev/ttyUSB9".into()).await,
        Err(AdapterError::PortChangeForbidden {
            property: "Port".into()
        })
    );
    assert!(matches!(
        pump.set_property("PumpNr", PropertyValue::Integer(1)).await,
        Err(AdapterError::PortChangeForbidden { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_blocks_io() {
    let (pump, script) = initialized().await;

    pump.shutdown().await.unwrap();
    pump.shutdown().await.unwrap();
    assert_eq!(pump.state(), AdapterState::ShutDown);

    assert!(matches!(
        pump.get_property("Rate (uL/min) Pump0").await,
        Err(AdapterError::InvalidState { .. })
    ));
    // local values are refused too
    assert!(matches!(
        pump.get_property("PumpNr").await,
        Err(AdapterError::InvalidState { .. })
    ));
    assert!(pump.initialize().await.is_err());
    assert_eq!(script.write_count(), 0);
}
