// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! detectord: userspace control daemon for an X-ray flat-panel detector.
//!
//! Bridges the FPGA/CSI-2 capture path and an authenticated UDP control
//! channel to a single host: accept frames off the sensor, fragment and
//! stream them out, and answer `START_SCAN`/`STOP_SCAN`/`GET_STATUS`/
//! `SET_CONFIG`/`RESET` commands through a serialized scan-control FSM.

pub mod config;
pub mod daemon;
pub mod error;
pub mod hal;
pub mod pidfile;
pub mod protocol;
pub mod ring;
pub mod sequence;
pub mod watchdog;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;
use crate::daemon::Collaborators;
use crate::hal::NullBatteryGauge;

/// Run the daemon until `shutdown` is cancelled. Production `main` wires
/// real collaborators; this entry point is also what integration tests
/// call with fakes substituted in.
pub async fn run(
    config: DetectorConfig,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(
        rows = config.rows,
        cols = config.cols,
        frame_rate = config.frame_rate,
        "detectord starting"
    );
    daemon::run(config, collaborators, shutdown).await
}

/// A battery gauge is the only collaborator this crate ships a default
/// stand-in for; the rest (FPGA registers, CSI-2 capture, UDP sockets)
/// have no safe default and must be wired by the caller.
pub fn null_battery_gauge() -> Arc<dyn crate::hal::BatteryGauge> {
    Arc::new(NullBatteryGauge)
}
