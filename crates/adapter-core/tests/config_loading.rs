//! Config file loading through figment.

use std::io::Write;

use adapter_core::config::{load_config, TransportConfig};
use adapter_core::tracing_init::OutputFormat;
use anyhow::Result;
use serial_test::serial;

const SAMPLE: &str = r#"
[logging]
level = "debug"
format = "compact"

[[devices]]
id = "pump"
type = "aladdin"
[devices.config]
port = "/dev/ttyUSB0"
pump_count = 2

[[devices]]
id = "laser"
type = "ibeam_smart"
[devices.config]
port = "/dev/ttyUSB1"
variant = "fine"
timeout_ms = 2000
"#;

fn write_config(contents: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

#[test]
#[serial]
fn test_load_sample_config() -> Result<()> {
    let file = write_config(SAMPLE)?;
    let config = load_config(file.path())?;

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, OutputFormat::Compact);
    assert_eq!(config.devices.len(), 2);

    let laser = config.device("laser").expect("laser entry");
    assert_eq!(laser.driver_type, "ibeam_smart");
    let transport: TransportConfig = laser.config.clone().try_into()?;
    assert_eq!(transport.port, "/dev/ttyUSB1");
    assert_eq!(transport.timeout_ms, 2000);
    Ok(())
}

#[test]
#[serial]
fn test_env_overrides_logging_level() -> Result<()> {
    let file = write_config(SAMPLE)?;
    std::env::set_var("ADAPTERS_LOGGING__LEVEL", "trace");
    let loaded = load_config(file.path());
    std::env::remove_var("ADAPTERS_LOGGING__LEVEL");

    assert_eq!(loaded?.logging.level, "trace");
    Ok(())
}

#[test]
#[serial]
fn test_missing_file_is_reported() {
    let err = load_config(std::path::Path::new("/definitely/not/here.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
#[serial]
fn test_duplicate_ids_rejected() -> Result<()> {
    let file = write_config(
        r#"
[[devices]]
id = "a"
type = "ell9"
[[devices]]
id = "a"
type = "ell9"
"#,
    )?;
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("Duplicate device id"));
    Ok(())
}

#[test]
#[serial]
fn test_defaults_without_logging_section() -> Result<()> {
    let file = write_config("devices = []\n")?;
    let config = load_config(file.path())?;
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, OutputFormat::Pretty);
    assert!(config.devices.is_empty());
    Ok(())
}
