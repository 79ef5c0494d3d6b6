// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SMCD14 emulator
//!
//! Serves every configured slave identifier on one Modbus TCP port, on all
//! interfaces unless configured otherwise.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::signal;

use smcd14_manipulator::config::{self, parse_slave_ids, Config};
use smcd14_manipulator::daemon::Daemon;

/// Emulator of SMCD14 stepper motor controllers over Modbus TCP
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on [default: 5020]
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind to [default: 0.0.0.0]
    #[arg(long)]
    address: Option<String>,

    /// Comma separated slave identifiers to emulate [default: 1,2,3]
    #[arg(long)]
    slaves: Option<String>,

    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output the configuration schema as JSON and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_config_schema {
        return config::output_config_schema();
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let slaves = args.slaves.as_deref().map(parse_slave_ids).transpose()?;
    config.apply_args(None, None, None, args.address.clone(), args.port, slaves);
    config::utils::validate_specific_rules(&config)?;

    let mut daemon = Daemon::new();
    daemon.launch(&config).await?;

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, terminating emulator"),
        Err(err) => eprintln!("Error waiting for shutdown signal: {}", err),
    }
    daemon.shutdown();
    daemon.join().await?;

    Ok(())
}
