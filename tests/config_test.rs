// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::Result;
use smcd14_manipulator::config::{self, ClientConfig, Config, EmulatorConfig};
use std::fs;
use tempfile::tempdir;

#[test]
fn test_config_load_and_save() -> Result<()> {
    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("config.yaml");

    let config = Config {
        client: ClientConfig {
            host: "192.168.1.50".to_string(),
            port: 502,
            slave_ids: vec![4, 5, 6],
            ..Default::default()
        },
        emulator: EmulatorConfig {
            port: 1502,
            slave_ids: vec![4, 5, 6, 7],
            time_scale: 10.0,
            ..Default::default()
        },
    };

    config.save_to_file(&config_path)?;
    let loaded_config = Config::from_file(&config_path)?;
    assert_eq!(loaded_config, config);

    // A missing file is created with default values
    let non_existent_path = temp_dir.path().join("non_existent.yaml");
    let default_config = Config::from_file(&non_existent_path)?;
    assert!(non_existent_path.exists());
    assert_eq!(default_config, Config::default());
    assert_eq!(default_config.client.port, 5020);
    assert_eq!(default_config.emulator.address, "0.0.0.0");

    Ok(())
}

#[test]
fn test_partial_file_falls_back_to_defaults() -> Result<()> {
    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(
        &config_path,
        r#"
client:
  host: "manipulator.lab"
  slave_ids: [11, 12, 13]
"#,
    )?;

    let config = Config::from_file(&config_path)?;
    assert_eq!(config.client.host, "manipulator.lab");
    assert_eq!(config.client.slave_ids, vec![11, 12, 13]);
    assert_eq!(config.client.port, 5020);
    assert_eq!(config.client.timeout_ms, 1000);
    assert_eq!(config.emulator, EmulatorConfig::default());

    Ok(())
}

#[test]
fn test_apply_args_after_file() -> Result<()> {
    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("config.yaml");
    let mut config = Config::from_file(&config_path)?;

    config.apply_args(
        Some("10.0.0.5".to_string()),
        Some(1502),
        Some(vec![7, 8, 9]),
        Some("127.0.0.1".to_string()),
        Some(0),
        Some(vec![7, 8, 9]),
    );

    assert_eq!(config.client.host, "10.0.0.5");
    assert_eq!(config.client.port, 1502);
    assert_eq!(config.client.slave_ids, vec![7, 8, 9]);
    assert_eq!(config.emulator.address, "127.0.0.1");
    assert_eq!(config.emulator.port, 0);
    config::utils::validate_specific_rules(&config)?;

    Ok(())
}

#[test]
fn test_schema_is_valid_json() -> Result<()> {
    let schema: serde_json::Value = serde_json::from_str(config::utils::CONFIG_SCHEMA)?;
    assert_eq!(schema["type"], "object");
    assert!(schema["properties"]["client"].is_object());
    assert!(schema["properties"]["emulator"].is_object());

    // Runs without error; the output itself goes to stdout
    config::output_config_schema()?;
    Ok(())
}
