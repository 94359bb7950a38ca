//! ELL9 adapter against a scripted Elliptec module.

use adapter_core::mock::{ScriptHandle, ScriptedPort};
use adapter_core::{AdapterError, AdapterState, DeviceAdapter, PropertyValue, SharedTransport};
use adapter_driver_thorlabs::{Ell9Config, Ell9Slider};

const INFO: &str = "0IN0911400012201715010100000000000000\r\n";

fn slider(channel: &str) -> (Ell9Slider, ScriptHandle) {
    let (port, script) = ScriptedPort::new(b"\r");
    let mut config = Ell9Config::new("/dev/ttyUSB2");
    config.channel = channel.to_string();
    let transport = SharedTransport::from_port("ell9", Box::new(port), config.transport.settings());
    (Ell9Slider::with_transport(&config, transport).unwrap(), script)
}

async fn initialized() -> (Ell9Slider, ScriptHandle) {
    let (slider, script) = slider("0");
    script.on("0in", INFO);
    slider.initialize().await.unwrap();
    script.clear_writes();
    (slider, script)
}

#[tokio::test]
async fn test_initialize_reads_serial_number() {
    let (slider, script) = slider("0");
    script.on("0in", INFO);

    slider.initialize().await.unwrap();

    assert_eq!(script.writes(), vec!["0in"]);
    assert_eq!(slider.state(), AdapterState::Initialized);
    assert_eq!(
        slider.get_property("Serial ID").await.unwrap(),
        PropertyValue::from("11400012")
    );
    assert!(matches!(
        slider.set_property("Serial ID", "x".into()).await,
        Err(AdapterError::ReadOnlyProperty(_))
    ));
}

#[tokio::test]
async fn test_wrong_device_type_fails_initialize() {
    let (slider, script) = slider("0");
    script.on("0in", "0IN0611400012201715010100000000000000\r\n");

    let err = slider.initialize().await.unwrap_err();

    assert!(matches!(err, AdapterError::UnrecognizedResponse(ref m) if m.contains("not an ELL9")));
    assert_eq!(slider.state(), AdapterState::Uninitialized);
    assert!(!slider.properties().contains("State"));
}

#[tokio::test]
async fn test_failed_initialize_releases_port() {
    let (port, script) = ScriptedPort::new(b"\r");
    let config = Ell9Config::new("/dev/ttyUSB2");
    let transport = SharedTransport::from_port("ell9", Box::new(port), config.transport.settings());
    let slider = Ell9Slider::with_transport(&config, transport.clone()).unwrap();
    script.on("0in", "0GS02\r\n");

    assert!(slider.initialize().await.is_err());
    assert!(!transport.is_open().await);
    assert_eq!(slider.state(), AdapterState::Uninitialized);
}

#[tokio::test]
async fn test_channel_selects_bus_address() {
    let (slider, script) = slider("B");
    script.on("Bin", "BIN0911400012201715010100000000000000\r\n");
    script.on("Bgp", "BPO0000005D\r\n");

    slider.initialize().await.unwrap();

    assert_eq!(
        slider.get_property("State").await.unwrap(),
        PropertyValue::Integer(3)
    );
    assert_eq!(script.writes(), vec!["Bin", "Bgp"]);
}

#[tokio::test]
async fn test_state_move_and_read_back() {
    let (slider, script) = initialized().await;
    script.on("0ma0000003E", "0PO0000003E\r\n");
    script.on("0gp", "0PO0000003E\r\n");

    slider
        .set_property("State", PropertyValue::Integer(2))
        .await
        .unwrap();

    assert_eq!(script.writes(), vec!["0ma0000003E"]);
    assert_eq!(
        slider.properties().cached("Label").unwrap(),
        PropertyValue::from("Position 2")
    );
    assert_eq!(
        slider.get_property("State").await.unwrap(),
        PropertyValue::Integer(2)
    );
}

#[tokio::test]
async fn test_label_maps_through_state() {
    let (slider, script) = initialized().await;
    script.on("0ma0000001F", "0GS00\r\n");
    script.on("0gp", "0PO0000001F\r\n");

    slider
        .set_property("Label", "Position 1".into())
        .await
        .unwrap();
    assert_eq!(
        slider.properties().cached("State").unwrap(),
        PropertyValue::Integer(1)
    );
    assert_eq!(
        slider.get_property("Label").await.unwrap(),
        PropertyValue::from("Position 1")
    );
}

#[tokio::test]
async fn test_forbidden_state_is_rejected_without_io() {
    let (slider, script) = initialized().await;

    let err = slider
        .set_property("State", PropertyValue::Integer(4))
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::InvalidArgument(_)));
    assert_eq!(script.write_count(), 0);
}

#[tokio::test]
async fn test_mechanical_timeout_leaves_state_unchanged() {
    let (slider, script) = initialized().await;
    script.on("0ma0000005D", "0GS02\r\n");

    let err = slider
        .set_property("State", PropertyValue::Integer(3))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 10302);
    assert_eq!(
        slider.properties().cached("State").unwrap(),
        PropertyValue::Integer(0)
    );
}

#[tokio::test]
async fn test_slider_between_positions_is_unrecognized() {
    let (slider, script) = initialized().await;
    script.on("0gp", "0PO00000010\r\n");

    let err = slider.get_property("State").await.unwrap_err();
    assert!(matches!(err, AdapterError::UnrecognizedResponse(_)));
}

#[tokio::test]
async fn test_unknown_status_code_maps_to_unknown_error() {
    let (slider, script) = initialized().await;
    script.on("0gp", "0GS1F\r\n");

    let err = slider.get_property("State").await.unwrap_err();
    assert_eq!(err.code(), 10300);
}

#[tokio::test(start_paused = true)]
async fn test_busy_follows_status() {
    let (slider, script) = initialized().await;

    script.on("0gs", "0GS00\r\n");
    assert!(!slider.busy().await.unwrap());

    script.forget("0gs");
    script.on("0gs", "0GS09\r\n");
    assert!(slider.busy().await.unwrap());

    // no answer counts as busy
    script.forget("0gs");
    assert!(slider.busy().await.unwrap());
}

#[tokio::test]
async fn test_busy_before_initialize_is_false() {
    let (slider, script) = slider("0");
    assert!(!slider.busy().await.unwrap());
    assert_eq!(script.write_count(), 0);
}

#[tokio::test]
async fn test_pre_init_properties_are_locked_after_initialize() {
    let (slider, _script) = initialized().await;

    assert!(matches!(
        slider.set_property("Port", "/dev/ttyUSB3".into()).await,
        Err(AdapterError::PortChangeForbidden { .. })
    ));
    assert!(matches!(
        slider.set_property("Channel", "1".into()).await,
        Err(AdapterError::PortChangeForbidden { .. })
    ));
}

#[tokio::test]
async fn test_channel_must_be_hex_digit() {
    let (slider, _script) = slider("0");
    assert!(slider.set_property("Channel", "G".into()).await.is_err());
    slider.set_property("Channel", "F".into()).await.unwrap();
}
