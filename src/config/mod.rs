// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management
//!
//! Configuration is backed by a YAML file and validated against an embedded
//! JSON schema before being deserialized, then checked against rules the
//! schema cannot express.
//!
//! ## Configuration Structure
//!
//! - `client`: where the manipulator finds its SMCD14 controllers
//! - `emulator`: how the emulator listens and how its axes behave
//!
//! ## Overrides
//!
//! Values from the file can be overridden, in this order, by environment
//! variables ([`Config::apply_env`]) and by command line arguments
//! ([`Config::apply_args`]).
//!
//! | Variable | Field |
//! |----------|-------|
//! | `SMCD14_HOST` | `client.host` |
//! | `SMCD14_PORT` | `client.port` |
//! | `SMCD14_SLAVE_IDS` | `client.slave_ids` (comma separated) |
//!
//! ## Usage
//!
//! ```no_run
//! use smcd14_manipulator::config::Config;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut config = Config::from_file("config.yaml")?;
//! config.apply_env()?;
//! config.apply_args(Some("10.0.0.5".to_string()), None, None, None, None, None);
//! println!("Manipulator link: {}:{}", config.client.host, config.client.port);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod emulator;
pub mod utils;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::modbus::SlaveId;

pub use client::ClientConfig;
pub use emulator::EmulatorConfig;
pub use utils::{is_valid_ip_address, output_config_schema, parse_slave_ids};

/// Environment variable overriding `client.host`
pub const ENV_HOST: &str = "SMCD14_HOST";
/// Environment variable overriding `client.port`
pub const ENV_PORT: &str = "SMCD14_PORT";
/// Environment variable overriding `client.slave_ids`
pub const ENV_SLAVE_IDS: &str = "SMCD14_SLAVE_IDS";

/// Root configuration structure.
///
/// Both sections fall back to their defaults when absent from the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Settings of the manipulator client
    #[serde(default)]
    pub client: ClientConfig,

    /// Settings of the SMCD14 emulator
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Helper method to create a sample config file when validation fails
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Original path: {:?}, Sample path: {:?}", path, sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {:?}", parent);
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file
    ///
    /// A missing file is created with default values. A file that fails
    /// schema validation, deserialization or the specific rules is rejected
    /// and a `<name>.sample.yaml` with default values is written next to it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        let yaml_value: serde_yml::Value = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?;

        // jsonschema works on JSON values
        let json_value = serde_json::to_value(&yaml_value).with_context(|| {
            format!("Failed to convert YAML to JSON for validation: {:?}", path)
        })?;

        let schema: serde_json::Value = serde_json::from_str(utils::CONFIG_SCHEMA)
            .context("Failed to parse JSON schema")?;
        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;

        debug!("Validating {} configuration against schema", path.display());
        if let Err(error) = validator.validate(&json_value) {
            error!("Configuration validation error before deserialization");
            Self::create_sample_config(path)?;
            anyhow::bail!("Configuration validation failed: {}", error);
        }

        let config: Config = match serde_yml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                error!("Configuration deserialization error: {}", err);
                if let Err(e) = Self::create_sample_config(path) {
                    error!("Failed to create sample config: {}", e);
                }
                return Err(anyhow::anyhow!(
                    "Failed to deserialize configuration from {}: {}",
                    path.display(),
                    err
                ));
            }
        };

        if let Err(err) = utils::validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply `SMCD14_HOST`, `SMCD14_PORT` and `SMCD14_SLAVE_IDS` from the
    /// process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Unset or empty variables leave the configuration untouched. A value
    /// that does not parse is an error and nothing is changed.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = get(ENV_PORT)
            .map(|value| {
                value
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("{} is not a valid port: {:?}", ENV_PORT, value))
            })
            .transpose()?;
        let slave_ids = get(ENV_SLAVE_IDS)
            .map(|value| {
                parse_slave_ids(&value).with_context(|| format!("Invalid {}", ENV_SLAVE_IDS))
            })
            .transpose()?;

        if let Some(host) = get(ENV_HOST) {
            debug!("Overriding client host from environment: {}", host);
            self.client.host = host.trim().to_string();
        }
        if let Some(port) = port {
            debug!("Overriding client port from environment: {}", port);
            self.client.port = port;
        }
        if let Some(slave_ids) = slave_ids {
            debug!("Overriding client slave ids from environment: {:?}", slave_ids);
            self.client.slave_ids = slave_ids;
        }
        Ok(())
    }

    /// Apply command line arguments to override configuration values.
    ///
    /// # Parameters
    ///
    /// * `client_host` - Host of the SMCD14 link
    /// * `client_port` - Port of the SMCD14 link
    /// * `client_slave_ids` - X, Y and Z slave identifiers
    /// * `emulator_address` - Address the emulator binds to
    /// * `emulator_port` - Port the emulator listens on
    /// * `emulator_slave_ids` - Slave identifiers answered by the emulator
    #[allow(clippy::too_many_arguments)]
    pub fn apply_args(
        &mut self,
        client_host: Option<String>,
        client_port: Option<u16>,
        client_slave_ids: Option<Vec<SlaveId>>,
        emulator_address: Option<String>,
        emulator_port: Option<u16>,
        emulator_slave_ids: Option<Vec<SlaveId>>,
    ) {
        if let Some(host) = client_host {
            debug!("Overriding client host from command line: {}", host);
            self.client.host = host;
        }
        if let Some(port) = client_port {
            debug!("Overriding client port from command line: {}", port);
            self.client.port = port;
        }
        if let Some(address) = emulator_address {
            debug!("Overriding emulator address from command line: {}", address);
            self.emulator.address = address;
        }
        if let Some(port) = emulator_port {
            debug!("Overriding emulator port from command line: {}", port);
            self.emulator.port = port;
        }
        if let Some(slave_ids) = client_slave_ids {
            debug!("Overriding client slave ids from command line: {:?}", slave_ids);
            self.client.slave_ids = slave_ids;
        }
        if let Some(slave_ids) = emulator_slave_ids {
            debug!("Overriding emulator slave ids from command line: {:?}", slave_ids);
            self.emulator.slave_ids = slave_ids;
        }
    }
}
