//! Configuration loading

use std::io::Write;

use mhf_channel::channel::Rounding;
use mhf_channel::ChannelConfig;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
id = 3
name = "Valor"
port = 54010
idle_timeout_secs = 60

[debug]
log_inbound_messages = true

[world_event]
max_players = 32
low_latency = false
"#
    )
    .unwrap();

    let config = ChannelConfig::load(file.path()).unwrap();
    assert_eq!(config.id, 3);
    assert_eq!(config.name, "Valor");
    assert_eq!(config.port, 54010);
    assert_eq!(config.idle_timeout().as_secs(), 60);
    assert!(config.debug.log_inbound_messages);
    assert_eq!(config.world_event.max_players, 32);
    assert!(!config.world_event.low_latency);

    // Untouched fields keep their defaults
    assert_eq!(config.send_queue_capacity, 20);
    assert_eq!(config.world_event.semaphore_prefix, "hs_l0u3B5");
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ChannelConfig::load(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_invalid_toml_is_an_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "port = \"not a number\"").unwrap();
    assert!(ChannelConfig::load(file.path()).is_err());
}

#[test]
fn test_siblings_step_port_and_id() {
    let base = ChannelConfig::default();
    let third = base.sibling(2);
    assert_eq!(third.id, base.id + 2);
    assert_eq!(third.port, base.port + 2);
    assert_eq!(third.name, format!("{}-{}", base.name, third.id));
}

#[test]
fn test_scaling_policy_from_toml() {
    let config = ChannelConfig::from_toml(
        r#"
[world_event.scaling]
rounding = "floor"
"#,
    )
    .unwrap();
    assert_eq!(config.world_event.scaling.rounding, Rounding::Floor);
}
