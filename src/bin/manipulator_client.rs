// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Operator command line for the three-axis manipulator

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::warn;

use smcd14_manipulator::config::{self, parse_slave_ids, Config};
use smcd14_manipulator::{Axis, ManipulatorError, PerAxis, Position, Velocity, XyzManipulator};

/// Drive an SMCD14 three-axis manipulator over Modbus TCP
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Modbus endpoint host (overrides SMCD14_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Modbus endpoint port (overrides SMCD14_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// X,Y,Z slave identifiers (overrides SMCD14_SLAVE_IDS)
    #[arg(long)]
    slaves: Option<String>,

    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the three positions
    Positions,
    /// Print the state of every axis
    Status,
    /// Move every axis to a position (µm) at one axis velocity (µm/s)
    Move {
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
        #[arg(allow_hyphen_values = true)]
        z: i32,
        #[arg(long, default_value_t = 100)]
        velocity: u32,
        /// Wait until all axes are idle
        #[arg(long)]
        wait: bool,
    },
    /// Move along a straight line at a total velocity (µm/s)
    Linear {
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
        #[arg(allow_hyphen_values = true)]
        z: i32,
        #[arg(long, default_value_t = 100.0)]
        velocity: f64,
        #[arg(long)]
        wait: bool,
    },
    /// Home the three axes
    Home {
        #[arg(long)]
        wait: bool,
    },
    /// Stop every axis
    Stop,
    /// Clear a latched error on one axis
    ClearError {
        #[arg(value_parser = parse_axis)]
        axis: Axis,
    },
}

fn parse_axis(value: &str) -> Result<Axis, String> {
    match value.to_ascii_lowercase().as_str() {
        "x" => Ok(Axis::X),
        "y" => Ok(Axis::Y),
        "z" => Ok(Axis::Z),
        other => Err(format!("unknown axis {:?}, expected x, y or z", other)),
    }
}

/// Upper bound for `--wait`
const WAIT_TIMEOUT: Duration = Duration::from_secs(600);

fn report(result: Result<(), ManipulatorError>) -> Result<()> {
    match result {
        Err(ManipulatorError::Partial(failures)) => {
            for axis in failures.succeeded() {
                println!("{}: ok", axis);
            }
            for (axis, error) in failures.failed() {
                println!("{}: FAILED {}", axis, error);
            }
            anyhow::bail!("command failed on some axes")
        }
        other => other.context("manipulator command failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::init_from_env(env_logger::Env::default().filter_or(
        env_logger::DEFAULT_FILTER_ENV,
        if args.verbose { "debug" } else { "info" },
    ));

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    let slaves = args.slaves.as_deref().map(parse_slave_ids).transpose()?;
    config.apply_args(args.host.clone(), args.port, slaves, None, None, None);
    config::utils::validate_specific_rules(&config)?;

    let manipulator = XyzManipulator::connect(&config.client).await?;

    let outcome = match args.command {
        Command::Positions => {
            for (axis, position) in manipulator.poll_positions().await.iter_owned() {
                match position {
                    Ok(position) => println!("{}: {}", axis, position),
                    Err(e) => println!("{}: unavailable ({})", axis, e),
                }
            }
            Ok(())
        }
        Command::Status => {
            let state = manipulator.refresh().await;
            for (axis, axis_state) in state.axes.iter() {
                println!(
                    "{}: {:?} ({:?})",
                    axis,
                    axis_state,
                    state.calibration.get(axis)
                );
            }
            println!("overall: {:?}", state.overall);
            Ok(())
        }
        Command::Move {
            x,
            y,
            z,
            velocity,
            wait,
        } => {
            report(
                manipulator
                    .move_to(Position(x), Position(y), Position(z), Velocity(velocity))
                    .await,
            )?;
            if wait {
                wait_and_print(&manipulator).await?;
            }
            Ok(())
        }
        Command::Linear {
            x,
            y,
            z,
            velocity,
            wait,
        } => {
            let target = PerAxis::new(Position(x), Position(y), Position(z));
            report(manipulator.move_linear(target, velocity).await)?;
            if wait {
                wait_and_print(&manipulator).await?;
            }
            Ok(())
        }
        Command::Home { wait } => {
            report(manipulator.home().await)?;
            if wait {
                wait_and_print(&manipulator).await?;
            }
            Ok(())
        }
        Command::Stop => report(manipulator.stop().await),
        Command::ClearError { axis } => {
            let state = manipulator.axis(axis).clear_error().await?;
            println!("{}: {:?}", axis, state);
            Ok(())
        }
    };

    manipulator.close().await;
    outcome
}

async fn wait_and_print(manipulator: &XyzManipulator) -> Result<()> {
    match manipulator.wait_until_idle(WAIT_TIMEOUT).await {
        Ok(positions) => {
            for (axis, position) in positions.iter() {
                println!("{}: {}", axis, position);
            }
            Ok(())
        }
        Err(e) => {
            warn!("Waiting for the manipulator failed: {}", e);
            report(Err(e))
        }
    }
}
