//! PI focus lock adapter against a scripted GCS controller.

use adapter_core::mock::{ScriptHandle, ScriptedPort};
use adapter_core::{AdapterError, AdapterState, DeviceAdapter, PropertyValue, SharedTransport};
use adapter_driver_pi::{PiFocusLock, PiFocusLockConfig};

const INTERNAL_SEQUENCE: &[&str] = &[
    "SVO Z 0",
    "SPA Z 0x07000500 1",
    "SPA Z 0x07000501 0",
    "SPA Z 0x07000300 0.02",
    "SPA Z 0x07000301 1.567286e-4",
    "SPA 1 0x0c000000 -30",
    "SPA 1 0x0c000001 130",
    "SVO Z 1",
    "ERR?",
];

fn stage_with_poll(poll_reply: &str) -> (PiFocusLock, ScriptHandle) {
    let (port, script) = ScriptedPort::new(b"\n");
    script.on_raw(b"\x05", poll_reply);
    script.on("ERR?", "0\n");
    script.on("POS? Z", "Z=12.5\n");

    let config = PiFocusLockConfig::new("/dev/ttyUSB0");
    let transport = SharedTransport::from_port("pi", Box::new(port), config.transport.settings());
    let stage = PiFocusLock::with_transport(&config, transport).unwrap();
    (stage, script)
}

async fn initialized() -> (PiFocusLock, ScriptHandle) {
    let (stage, script) = stage_with_poll("0\n");
    stage.initialize().await.unwrap();
    script.clear_writes();
    (stage, script)
}

#[tokio::test(start_paused = true)]
async fn test_initialize_runs_the_internal_sensor_sequence() {
    let (stage, script) = stage_with_poll("0\n");

    stage.initialize().await.unwrap();

    let mut expected = vec!["\u{5}", "CCL 1 advanced"];
    expected.extend_from_slice(INTERNAL_SEQUENCE);
    expected.push("POS? Z");
    assert_eq!(script.writes(), expected);

    assert_eq!(stage.state(), AdapterState::Initialized);
    assert_eq!(
        stage.properties().cached("Position").unwrap(),
        PropertyValue::Float(12.5)
    );
    assert_eq!(
        stage.properties().cached("StepSizeUm").unwrap(),
        PropertyValue::Float(0.01)
    );
    assert_eq!(
        stage.get_property("External sensor").await.unwrap(),
        PropertyValue::Integer(0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_position_write_moves_and_checks_errors() {
    let (stage, script) = initialized().await;
    script.on("POS? Z", "Z=20\n");

    stage
        .set_property("Position", PropertyValue::Float(20.0))
        .await
        .unwrap();

    assert_eq!(script.writes(), vec!["MOV Z 20", "ERR?"]);
    assert_eq!(
        stage.properties().cached("Position").unwrap(),
        PropertyValue::Float(20.0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_controller_error_after_move_leaves_cache() {
    let (stage, script) = initialized().await;
    script.forget("ERR?");
    script.on("ERR?", "7\n");

    let err = stage
        .set_property("Position", PropertyValue::Float(30.0))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 10107);
    assert_eq!(
        stage.properties().cached("Position").unwrap(),
        PropertyValue::Float(12.5)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unlisted_controller_error_uses_offset() {
    let (stage, script) = initialized().await;
    script.forget("ERR?");
    script.on("ERR?", "1000\n");

    let err = stage
        .set_property("Position", PropertyValue::Float(30.0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 11100);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_position_is_rejected_without_io() {
    let (stage, script) = initialized().await;

    let err = stage
        .set_property("Position", PropertyValue::Float(600.0))
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::InvalidArgument(_)));
    assert_eq!(script.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_external_lock_centers_soft_limits_and_refuses_moves() {
    let (stage, script) = initialized().await;
    script.on("VOL? 1", "1=55.3\n");
    script.on("TSP? 1", "1=0.25\n");

    stage
        .set_property("External sensor", PropertyValue::Integer(1))
        .await
        .unwrap();

    assert_eq!(
        script.writes(),
        vec![
            "SVO Z 0",
            "SPA Z 0x07000500 0",
            "SPA Z 0x07000501 1",
            "SPA Z 0x07000300 0.02",
            "SPA Z 0x07000301 2e-3",
            "VOL? 1",
            "SPA 1 0x0c000000 30.3",
            "SPA 1 0x0c000001 80.3",
            "SVO Z 1",
            "MOV Z 0",
            "ERR?",
        ]
    );
    assert_eq!(
        stage.get_property("External sensor").await.unwrap(),
        PropertyValue::Integer(1)
    );

    // locked: position comes from the external sensor channel
    assert_eq!(
        stage.get_property("Position").await.unwrap(),
        PropertyValue::Float(0.25)
    );

    script.clear_writes();
    let err = stage
        .set_property("Position", PropertyValue::Float(10.0))
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::ConflictingState(_)));
    assert_eq!(script.write_count(), 0);
    assert_eq!(
        stage.properties().cached("Position").unwrap(),
        PropertyValue::Float(0.25)
    );
}

#[tokio::test(start_paused = true)]
async fn test_releasing_the_lock_restores_moves() {
    let (stage, script) = initialized().await;
    script.on("VOL? 1", "1=60\n");

    stage
        .set_property("External sensor", PropertyValue::Integer(1))
        .await
        .unwrap();
    stage
        .set_property("External sensor", PropertyValue::Integer(0))
        .await
        .unwrap();
    script.clear_writes();

    stage
        .set_property("Position", PropertyValue::Float(5.0))
        .await
        .unwrap();
    assert_eq!(script.writes(), vec!["MOV Z 5", "ERR?"]);
}

#[tokio::test(start_paused = true)]
async fn test_busy_follows_motion_poll() {
    let (stage, script) = stage_with_poll("1\n");
    stage.initialize().await.unwrap();
    script.clear_writes();

    assert!(stage.busy().await.unwrap());
    assert_eq!(script.writes(), vec!["\u{5}"]);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_motion_poll_is_disabled() {
    let (stage, script) = stage_with_poll("");

    stage.initialize().await.unwrap();
    let writes = script.writes();
    assert_eq!(&writes[..4], &["\u{5}", "ERR?", "ERR?", "CCL 1 advanced"]);

    script.clear_writes();
    assert!(!stage.busy().await.unwrap());
    assert_eq!(script.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_garbled_motion_poll_is_disabled() {
    let (stage, script) = stage_with_poll("x?\n");

    stage.initialize().await.unwrap();
    assert_eq!(stage.state(), AdapterState::Initialized);
    let writes = script.writes();
    assert_eq!(&writes[..4], &["\u{5}", "ERR?", "ERR?", "CCL 1 advanced"]);

    script.clear_writes();
    assert!(!stage.busy().await.unwrap());
    assert_eq!(script.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_position_is_surfaced() {
    let (stage, script) = initialized().await;
    script.forget("POS? Z");
    script.on("POS? Z", "Z=1.2x\n");

    let err = stage.get_property("Position").await.unwrap_err();
    assert!(matches!(err, AdapterError::UnrecognizedResponse(_)));
    assert_eq!(
        stage.properties().cached("Position").unwrap(),
        PropertyValue::Float(12.5)
    );
}

#[tokio::test(start_paused = true)]
async fn test_step_size_is_local() {
    let (stage, script) = initialized().await;

    stage
        .set_property("StepSizeUm", PropertyValue::Float(0.05))
        .await
        .unwrap();
    assert!(stage
        .set_property("StepSizeUm", PropertyValue::Float(0.0))
        .await
        .is_err());
    assert_eq!(script.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pre_init_properties_are_locked_after_initialize() {
    let (stage, _script) = initialized().await;

    for (name, value) in [
        ("Port", PropertyValue::from("/dev/ttyUSB1")),
        ("Axis", PropertyValue::from("X")),
        ("Limit_um", PropertyValue::Float(100.0)),
    ] {
        assert!(matches!(
            stage.set_property(name, value).await,
            Err(AdapterError::PortChangeForbidden { .. })
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_restores_internal_sensor_once() {
    let (stage, script) = initialized().await;

    stage.shutdown().await.unwrap();
    assert_eq!(script.writes(), INTERNAL_SEQUENCE);

    stage.shutdown().await.unwrap();
    assert_eq!(script.write_count(), INTERNAL_SEQUENCE.len());
    assert_eq!(stage.state(), AdapterState::ShutDown);
}

#[tokio::test(start_paused = true)]
async fn test_silent_controller_fails_initialize() {
    let (port, _script) = ScriptedPort::new(b"\n");
    let config = PiFocusLockConfig::new("/dev/ttyUSB0");
    let transport = SharedTransport::from_port("pi", Box::new(port), config.transport.settings());
    let stage = PiFocusLock::with_transport(&config, transport).unwrap();

    let err = stage.initialize().await.unwrap_err();

    assert!(matches!(err, AdapterError::Timeout { .. }));
    assert_eq!(stage.state(), AdapterState::Uninitialized);
    assert!(!stage.properties().contains("Position"));
}
