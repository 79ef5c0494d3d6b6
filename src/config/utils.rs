// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! This module provides utility functions for working with configuration
//! settings, including validation and schema management.

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::debug;

use super::Config;
use crate::modbus::SlaveId;

/// JSON schema embedded at build time
pub const CONFIG_SCHEMA: &str = include_str!("../../resources/config.schema.json");

/// Output the embedded JSON schema to the console.
///
/// This function is called when the `--show-config-schema` flag is provided
/// on the command line.
///
/// # Example
///
/// ```bash
/// ./smcd14_emulator --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).context("Failed to parse JSON schema")?;

    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;

    println!("{}", formatted_schema);

    Ok(())
}

/// Check if a string is a valid IP address
///
/// Accepts any IPv4 or IPv6 address plus the special value "localhost".
pub fn is_valid_ip_address(addr: &str) -> bool {
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    matches!(addr, "localhost" | "::" | "::0" | "0.0.0.0")
}

/// Parse a comma separated list of slave identifiers, e.g. `"1,2,3"`.
pub fn parse_slave_ids(list: &str) -> Result<Vec<SlaveId>> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<SlaveId>()
                .with_context(|| format!("Invalid slave identifier {:?}", item))
        })
        .collect()
}

fn validate_slave_ids(section: &str, slave_ids: &[SlaveId]) -> Result<()> {
    if slave_ids.is_empty() {
        anyhow::bail!("{}: at least one slave identifier is required", section);
    }
    let mut seen = HashSet::new();
    for slave in slave_ids {
        if !(1..=247).contains(slave) {
            anyhow::bail!(
                "{}: slave identifier {} is outside 1..=247",
                section,
                slave
            );
        }
        if !seen.insert(*slave) {
            anyhow::bail!("{}: slave identifier {} is used twice", section, slave);
        }
    }
    Ok(())
}

/// Validates the configuration against additional rules that aren't covered by the JSON schema.
///
/// # Validation Rules
///
/// - **Slave identifiers**: unique and within 1..=247 in both sections; the
///   client needs exactly one per axis
/// - **Velocity limits**: `min_velocity` ≤ `max_velocity`, minimum at least 1
/// - **Emulator address**: a valid IP address
/// - **Travel range**: `travel_min` < `travel_max`
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    validate_slave_ids("client", &config.client.slave_ids)?;
    if config.client.slave_ids.len() != 3 {
        anyhow::bail!(
            "client: exactly three slave identifiers (X, Y, Z) are required, got {}",
            config.client.slave_ids.len()
        );
    }
    validate_slave_ids("emulator", &config.emulator.slave_ids)?;

    if config.client.host.trim().is_empty() {
        anyhow::bail!("client: host must not be empty");
    }
    if config.client.min_velocity == 0 {
        anyhow::bail!("client: min_velocity must be at least 1 µm/s");
    }
    if config.client.min_velocity > config.client.max_velocity {
        anyhow::bail!(
            "client: min_velocity {} exceeds max_velocity {}",
            config.client.min_velocity,
            config.client.max_velocity
        );
    }

    if !is_valid_ip_address(&config.emulator.address) {
        anyhow::bail!(
            "emulator: invalid listen address {}",
            config.emulator.address
        );
    }
    if config.emulator.travel_min >= config.emulator.travel_max {
        anyhow::bail!(
            "emulator: travel_min {} must be below travel_max {}",
            config.emulator.travel_min,
            config.emulator.travel_max
        );
    }
    if config.emulator.time_scale <= 0.0 || !config.emulator.time_scale.is_finite() {
        anyhow::bail!(
            "emulator: time_scale must be a positive number, got {}",
            config.emulator.time_scale
        );
    }

    Ok(())
}
