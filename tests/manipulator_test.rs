// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the smcd14-manipulator project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Three-axis manipulator against the emulator daemon

use std::sync::Arc;
use std::time::Duration;

use smcd14_manipulator::config::{ClientConfig, Config};
use smcd14_manipulator::daemon::Daemon;
use smcd14_manipulator::{
    Axis, AxisState, ManipulatorError, OverallState, PerAxis, Position, Velocity, XyzManipulator,
};

async fn launch_emulator(time_scale: f64) -> anyhow::Result<(Daemon, ClientConfig)> {
    let mut config = Config::default();
    config.emulator.address = "127.0.0.1".to_string();
    config.emulator.port = 0;
    config.emulator.time_scale = time_scale;
    config.emulator.heartbeat_ms = 0;

    let mut daemon = Daemon::new();
    daemon.launch(&config).await?;
    let port = daemon
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("not bound"))?
        .port();

    let client = ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        poll_interval_ms: 20,
        ..Default::default()
    };
    Ok((daemon, client))
}

#[tokio::test]
async fn test_coordinated_move_reaches_every_target() -> anyhow::Result<()> {
    let (daemon, client) = launch_emulator(50.0).await?;
    let manipulator = XyzManipulator::connect(&client).await?;

    manipulator
        .move_to(Position(1000), Position(-2000), Position(500), Velocity(500))
        .await?;
    assert_eq!(manipulator.state().overall, OverallState::Moving);

    let positions = manipulator.wait_until_idle(Duration::from_secs(5)).await?;
    assert_eq!(
        positions,
        PerAxis::new(Position(1000), Position(-2000), Position(500))
    );
    assert_eq!(manipulator.refresh().await.overall, OverallState::Idle);

    let polled = manipulator.poll_positions().await;
    assert!(matches!(polled.get(Axis::Y), Ok(Position(-2000))));

    manipulator.close().await;
    daemon.shutdown();
    daemon.join().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_commands_one_is_refused() -> anyhow::Result<()> {
    let (daemon, client) = launch_emulator(1.0).await?;
    let manipulator = Arc::new(XyzManipulator::connect(&client).await?);

    let first = {
        let manipulator = manipulator.clone();
        async move {
            manipulator
                .move_to(Position(5000), Position(5000), Position(5000), Velocity(10))
                .await
        }
    };
    let second = {
        let manipulator = manipulator.clone();
        async move {
            manipulator
                .move_to(Position(-5000), Position(-5000), Position(-5000), Velocity(10))
                .await
        }
    };
    let (first, second) = tokio::join!(first, second);

    let refused = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Err(ManipulatorError::Busy { .. })))
        .count();
    let accepted = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!((accepted, refused), (1, 1), "{:?} / {:?}", first, second);

    manipulator.stop().await?;
    let state = manipulator.refresh().await;
    assert!(state.axes.iter().all(|(_, s)| *s == AxisState::Idle));

    manipulator.close().await;
    daemon.shutdown();
    daemon.join().await?;
    Ok(())
}

#[tokio::test]
async fn test_home_then_linear_move() -> anyhow::Result<()> {
    let (daemon, client) = launch_emulator(20.0).await?;
    let manipulator = XyzManipulator::connect(&client).await?;

    assert!(!manipulator.is_homed().await);
    manipulator.home().await?;
    manipulator.wait_until_idle(Duration::from_secs(5)).await?;
    assert!(manipulator.is_homed().await);
    assert!(manipulator.refresh().await.is_homed());

    let target = PerAxis::new(Position(3000), Position(4000), Position(0));
    manipulator.move_linear(target, 500.0).await?;
    let positions = manipulator.wait_until_idle(Duration::from_secs(5)).await?;
    assert_eq!(positions, target);

    manipulator.close().await;
    daemon.shutdown();
    daemon.join().await?;
    Ok(())
}

#[tokio::test]
async fn test_misaddressed_axis_is_reported_per_axis() -> anyhow::Result<()> {
    let (daemon, mut client) = launch_emulator(50.0).await?;
    // Z points to a slave the emulator does not serve
    client.slave_ids = vec![1, 2, 9];
    let manipulator = XyzManipulator::connect(&client).await?;

    let err = manipulator
        .move_to(Position(100), Position(100), Position(100), Velocity(100))
        .await
        .unwrap_err();
    match err {
        ManipulatorError::Partial(failures) => {
            assert_eq!(failures.succeeded(), vec![Axis::X, Axis::Y]);
            assert!(failures.error(Axis::Z).is_some());
        }
        other => panic!("expected a partial failure, got {:?}", other),
    }
    assert_eq!(manipulator.state().overall, OverallState::PartialError);

    manipulator.close().await;
    daemon.shutdown();
    daemon.join().await?;
    Ok(())
}

#[tokio::test]
async fn test_connection_refused() {
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..Default::default()
    };
    let outcome = XyzManipulator::connect(&client).await;
    assert!(matches!(outcome, Err(ManipulatorError::Connection(_))));
}
