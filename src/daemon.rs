// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level daemon wiring: owns one instance of each hard-core
//! subsystem and spawns the five tasks from the concurrency model
//! (Producer, Consumer, Control, Engine, Health) as `tokio` tasks
//! threaded through one shared `CancellationToken`. The Health thread
//! is split into two tasks, `spawn_liveness_monitor` (pet/liveness) and
//! `spawn_battery_monitor` (battery poll), plus two further ambient
//! tasks the concurrency model's thread table doesn't name: the
//! `SIGHUP` config reload listener and the CONFIGURE/ARM FPGA register
//! sequencer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;
use crate::error::StateFault;
use crate::hal::{log_battery_threshold, BatteryGauge, ControlSocket, DataSocket, FpgaRegisters, FrameSource};
use crate::protocol::control::{self, CommandFrame, ReplayTable, Status};
use crate::protocol::frame::{self, HEADER_LEN};
use crate::ring::FrameRing;
use crate::sequence::{ScanMode, SequenceEngine, SequenceEvent, SequenceState, SequenceStats};
use crate::watchdog::{spawn_liveness_monitor, RuntimeStats, RuntimeStatsSnapshot, Watchdog};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

// -- Engine task: the only owner of the `SequenceEngine` instance -----------

/// A consistent, non-blocking read of the engine's current state, refreshed
/// after every dispatch. `GET_STATUS` reads this instead of talking to the
/// Engine task directly, keeping the status snapshot's 50ms bound trivial.
#[derive(Debug, Clone, Copy)]
pub struct EngineSnapshot {
    pub state: SequenceState,
    pub mode: ScanMode,
    pub retry_budget: u8,
    pub stats: SequenceStats,
}

struct EngineCommand {
    event: SequenceEvent,
    reply: oneshot::Sender<Result<(), StateFault>>,
}

/// Handle shared by every task that needs to submit events to the engine.
/// Cloning is cheap; the underlying channel serializes dispatch.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    snapshot: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    pub async fn dispatch(&self, event: SequenceEvent) -> Result<(), StateFault> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineCommand { event, reply }).await.is_err() {
            return Err(StateFault::InvalidTransition);
        }
        rx.await.unwrap_or(Err(StateFault::InvalidTransition))
    }

    /// Non-blocking snapshot read; never awaits the engine task itself.
    pub fn snapshot(&self) -> EngineSnapshot {
        *self.snapshot.borrow()
    }
}

fn engine_snapshot(engine: &SequenceEngine) -> EngineSnapshot {
    EngineSnapshot {
        state: engine.state(),
        mode: engine.mode(),
        retry_budget: engine.retry_budget(),
        stats: engine.stats(),
    }
}

fn spawn_engine(watchdog: Arc<Watchdog>, shutdown: CancellationToken) -> EngineHandle {
    let mut engine = SequenceEngine::new();
    let (tx, mut rx) = mpsc::channel::<EngineCommand>(256);
    let (snap_tx, snap_rx) = watch::channel(engine_snapshot(&engine));

    tokio::spawn(async move {
        // The engine also pets the watchdog (spec.md §5's thread table),
        // both on every dispatch and on a 1s idle tick so liveness holds
        // even across quiet CONFIGURE/ARM stretches.
        let mut pet_timer = tokio::time::interval(Duration::from_secs(1));
        pet_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = pet_timer.tick() => {
                    watchdog.pet(now_ms());
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let result = engine.dispatch(cmd.event);
                    watchdog.pet(now_ms());
                    let _ = snap_tx.send(engine_snapshot(&engine));
                    let _ = cmd.reply.send(result);
                }
            }
        }
    });

    EngineHandle { tx, snapshot: snap_rx }
}

// -- FPGA register sequencing ------------------------------------------
//
// spec.md's transition table attaches "write FPGA config registers" to
// CONFIG_DONE and "write ARM bit" to ARM_DONE. Those events have to come
// from somewhere: this task watches the engine's published snapshot for
// entry into CONFIGURE/ARM and performs the corresponding SPI register
// write, then raises the completing event itself. The original firmware
// left both writes as a TODO and transitioned unconditionally
// (`handle_configure_state`/`handle_arm_state` in sequence_engine.c); this
// crate's `FpgaRegisters` collaborator makes the real write possible, so
// it is no longer a stub.

const REG_STATUS: u8 = 0x00;
const REG_CONTROL: u8 = 0x01;

const STATUS_BIT_BUSY: u16 = 1 << 0;
const STATUS_BIT_ERROR: u16 = 1 << 1;

const CONTROL_BIT_START: u16 = 1 << 0;
const CONTROL_BIT_STOP: u16 = 1 << 1;

fn control_mode_bits(mode: ScanMode) -> u16 {
    let code: u16 = match mode {
        ScanMode::Single => 0,
        ScanMode::Continuous => 1,
        ScanMode::Calibration => 2,
    };
    code << 2
}

/// Program the control register's mode bits and confirm the FPGA isn't
/// reporting an error before arming. `reg_write` already retries
/// write-then-read-verify internally (spec.md §6); this call only needs
/// to surface the terminal outcome.
fn write_config_registers(fpga: &dyn FpgaRegisters, mode: ScanMode) -> Result<(), StateFault> {
    fpga.reg_write(REG_CONTROL, control_mode_bits(mode))
        .map_err(|_| StateFault::InvalidTransition)?;
    let status = fpga.reg_read(REG_STATUS).map_err(|_| StateFault::InvalidTransition)?;
    if status & STATUS_BIT_ERROR != 0 {
        return Err(StateFault::InvalidTransition);
    }
    Ok(())
}

/// Raise the control register's START bit, leaving the mode bits set by
/// `write_config_registers` untouched.
fn write_arm_bit(fpga: &dyn FpgaRegisters, mode: ScanMode) -> Result<(), StateFault> {
    fpga.reg_write(REG_CONTROL, control_mode_bits(mode) | CONTROL_BIT_START)
        .map_err(|_| StateFault::InvalidTransition)?;
    let status = fpga.reg_read(REG_STATUS).map_err(|_| StateFault::InvalidTransition)?;
    if status & STATUS_BIT_ERROR != 0 {
        return Err(StateFault::InvalidTransition);
    }
    Ok(())
}

/// Lower the control register's START bit and raise STOP, best-effort.
/// Called when the engine leaves SCANNING/STREAMING/ARM any way other
/// than the normal COMPLETE path, so the FPGA doesn't stay armed against
/// a core that has moved to IDLE or ERROR.
fn write_stop_bit(fpga: &dyn FpgaRegisters) {
    if let Err(e) = fpga.reg_write(REG_CONTROL, CONTROL_BIT_STOP) {
        tracing::warn!(err = ?e, "failed to write FPGA stop bit");
    }
}

fn spawn_config_sequencer(
    state: Arc<DaemonState>,
    fpga: Arc<dyn FpgaRegisters>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut snapshot_rx = state.engine.snapshot.clone();
        let mut last_state = snapshot_rx.borrow().state;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = *snapshot_rx.borrow();
                    if snapshot.state == last_state {
                        continue;
                    }
                    last_state = snapshot.state;

                    match snapshot.state {
                        SequenceState::Configure => {
                            match write_config_registers(fpga.as_ref(), snapshot.mode) {
                                Ok(()) => {
                                    let _ = state.engine.dispatch(SequenceEvent::ConfigDone).await;
                                }
                                Err(e) => {
                                    tracing::warn!(err = ?e, "CONFIGURE register write failed");
                                    let _ = state.engine.dispatch(SequenceEvent::Error).await;
                                }
                            }
                        }
                        SequenceState::Arm => {
                            match write_arm_bit(fpga.as_ref(), snapshot.mode) {
                                Ok(()) => {
                                    let _ = state.engine.dispatch(SequenceEvent::ArmDone).await;
                                }
                                Err(e) => {
                                    tracing::warn!(err = ?e, "ARM register write failed");
                                    let _ = state.engine.dispatch(SequenceEvent::Error).await;
                                }
                            }
                        }
                        SequenceState::Idle | SequenceState::Error => write_stop_bit(fpga.as_ref()),
                        SequenceState::Scanning
                        | SequenceState::Streaming
                        | SequenceState::Complete => {}
                    }
                }
            }
        }
    });
}

// -- Collaborators and shared state ------------------------------------

/// The out-of-scope collaborators a running daemon needs; production
/// `main` wires real SPI/V4L2/UDP/battery implementations here, tests
/// wire fakes.
pub struct Collaborators {
    pub frame_source: Arc<dyn FrameSource>,
    pub fpga: Arc<dyn FpgaRegisters>,
    pub data_socket: Arc<dyn DataSocket>,
    pub control_socket: Arc<dyn ControlSocket>,
    pub battery: Arc<dyn BatteryGauge>,
}

/// Everything the five tasks share, bundled so each `spawn_*` function
/// takes one clone instead of a growing parameter list.
pub struct DaemonState {
    pub ring: Arc<FrameRing>,
    pub engine: EngineHandle,
    pub stats: Arc<RuntimeStats>,
    pub watchdog: Arc<Watchdog>,
    pub config: Arc<RwLock<DetectorConfig>>,
    pub started_at: Instant,
}

/// Run the daemon until `shutdown` is cancelled.
pub async fn run(
    config: DetectorConfig,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let config_path = config.source_path.clone();
    let ring = Arc::new(FrameRing::new(config.rows, config.cols, config.bit_depth));
    let stats = Arc::new(RuntimeStats::new());
    let watchdog = Arc::new(Watchdog::new(now_ms()));
    let engine = spawn_engine(Arc::clone(&watchdog), shutdown.clone());

    let state = Arc::new(DaemonState {
        ring,
        engine,
        stats,
        watchdog: Arc::clone(&watchdog),
        config: Arc::new(RwLock::new(config)),
        started_at: Instant::now(),
    });

    if let Some(config_path) = config_path {
        spawn_reload_listener(config_path, Arc::clone(&state), shutdown.clone());
    }

    spawn_liveness_monitor(watchdog, shutdown.clone(), Duration::from_secs(1), now_ms);
    spawn_producer(Arc::clone(&state), Arc::clone(&collaborators.frame_source), shutdown.clone());
    spawn_consumer(Arc::clone(&state), Arc::clone(&collaborators.data_socket), shutdown.clone());
    spawn_control(
        Arc::clone(&state),
        Arc::clone(&collaborators.control_socket),
        Arc::clone(&collaborators.battery),
        shutdown.clone(),
    );
    spawn_config_sequencer(Arc::clone(&state), collaborators.fpga, shutdown.clone());
    spawn_battery_monitor(collaborators.battery, shutdown.clone());

    shutdown.cancelled().await;
    tracing::info!("detectord shutting down");
    Ok(())
}

/// On `SIGHUP`, re-read `config_path` and apply it via
/// `DetectorConfig::apply_reload`. A parse/validate failure or a cold
/// field changed while scanning is logged and the previous config is
/// kept running — never fatal (SPEC_FULL.md §7 AMBIENT note).
fn spawn_reload_listener(config_path: PathBuf, state: Arc<DaemonState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let Ok(mut sighup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("failed to install SIGHUP handler; config reload disabled");
            return;
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = sighup.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    reload_config(&config_path, &state).await;
                }
            }
        }
    });
}

async fn reload_config(config_path: &PathBuf, state: &DaemonState) {
    let next = match DetectorConfig::load(config_path) {
        Ok(next) => next,
        Err(e) => {
            tracing::warn!(err = %e, "SIGHUP reload: failed to load config, keeping previous");
            return;
        }
    };

    let engine_idle = state.engine.snapshot().state == SequenceState::Idle;
    let mut current = state.config.write().await;
    match current.apply_reload(next, engine_idle) {
        Ok(()) => tracing::info!("SIGHUP reload applied"),
        Err(e) => tracing::warn!(err = %e, "SIGHUP reload rejected"),
    }
}

/// The battery-poll half of the Health thread (spec.md §5's thread table:
/// "periodic pet, stat aggregation, battery poll"; the pet/liveness half
/// is `spawn_liveness_monitor`). Polls independent of `GET_STATUS`
/// traffic so SPEC_FULL.md §4.5's WARNING/CRITICAL thresholds log even
/// when no host is polling status.
fn spawn_battery_monitor(battery: Arc<dyn BatteryGauge>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            match battery.read() {
                Ok(metrics) => log_battery_threshold(metrics),
                Err(e) => tracing::warn!(err = ?e, "battery gauge read failed"),
            }
        }
    });
}

fn spawn_producer(state: Arc<DaemonState>, frame_source: Arc<dyn FrameSource>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if state.engine.snapshot().state != SequenceState::Scanning {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }

            let capture_source = Arc::clone(&frame_source);
            let captured = tokio::task::spawn_blocking(move || capture_source.capture(1000)).await;

            match captured {
                Ok(Ok(frame)) => {
                    state.ring.acquire_for_fill(frame.sequence);
                    let _ = state.ring.write_fill(frame.sequence, &frame.data);
                    let _ = state.ring.commit_filled(frame.sequence);
                    frame_source.release(frame.handle);
                    state.stats.apply("frames_received", 1);
                    let _ = state.engine.dispatch(SequenceEvent::FrameReady).await;
                }
                Ok(Err(_fault)) => {
                    state.stats.apply("csi2_errors", 1);
                    let _ = state.engine.dispatch(SequenceEvent::Error).await;
                }
                Err(_join_error) => break,
            }
        }
    });
}

fn spawn_consumer(state: Arc<DaemonState>, data_socket: Arc<dyn DataSocket>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let ready = match state.ring.acquire_ready() {
                Ok(ready) => ready,
                Err(_none_ready) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
            };

            let (dest, payload_cap) = {
                let cfg = state.config.read().await;
                let addr: std::net::Ipv4Addr =
                    cfg.host_ip.parse().unwrap_or(std::net::Ipv4Addr::LOCALHOST);
                let dest = SocketAddr::from((addr, cfg.data_port));
                let cap = (cfg.mtu_payload_cap as usize).saturating_sub(HEADER_LEN).max(1);
                (dest, cap)
            };

            let packets = frame::fragment(&ready.payload, ready.frame_number, payload_cap, now_ns());
            for packet in &packets {
                if data_socket.send_to(&packet.bytes, dest).is_ok() {
                    state.stats.apply("packets_sent", 1);
                    state.stats.apply("bytes_sent", packet.bytes.len() as i64);
                }

                // STOP_SCAN abandons in-flight fragmentation (open question
                // #3): stop sending the rest of this frame's packets.
                let scan_state = state.engine.snapshot().state;
                if scan_state != SequenceState::Streaming && scan_state != SequenceState::Scanning {
                    break;
                }
            }

            let _ = state.ring.release_sent(ready.frame_number);
            state.stats.apply("frames_sent", 1);
            let _ = state.engine.dispatch(SequenceEvent::Complete).await;
        }
    });
}

fn sequence_state_code(state: SequenceState) -> u8 {
    match state {
        SequenceState::Idle => 0,
        SequenceState::Configure => 1,
        SequenceState::Arm => 2,
        SequenceState::Scanning => 3,
        SequenceState::Streaming => 4,
        SequenceState::Complete => 5,
        SequenceState::Error => 6,
    }
}

/// Encode the 44-byte `GET_STATUS` payload. The temperature field has no
/// collaborator interface in this crate's scope (not modeled by
/// `FpgaRegisters` or `BatteryGauge`) and is always reported as zero.
fn build_status_payload(
    engine: EngineSnapshot,
    stats: RuntimeStatsSnapshot,
    battery_soc_pct: u8,
    battery_mv: u16,
    uptime_sec: u32,
) -> [u8; 44] {
    let mut buf = [0u8; 44];
    buf[0] = sequence_state_code(engine.state);
    buf[2..10].copy_from_slice(&(stats.frames_received.max(0) as u64).to_le_bytes());
    buf[10..18].copy_from_slice(&(stats.frames_sent.max(0) as u64).to_le_bytes());
    buf[18..26].copy_from_slice(&(stats.frames_dropped.max(0) as u64).to_le_bytes());
    buf[26..30].copy_from_slice(&(stats.auth_failures.max(0) as u32).to_le_bytes());
    buf[30] = battery_soc_pct;
    buf[32..34].copy_from_slice(&battery_mv.to_le_bytes());
    buf[34..38].copy_from_slice(&uptime_sec.to_le_bytes());
    // fpga_temp_tenths stays zero; reserved3 stays zero.
    buf
}

fn spawn_control(
    state: Arc<DaemonState>,
    control_socket: Arc<dyn ControlSocket>,
    battery: Arc<dyn BatteryGauge>,
    shutdown: CancellationToken,
) {
    tokio::task::spawn_blocking(move || {
        let handle = tokio::runtime::Handle::current();
        let mut replay = ReplayTable::new();
        let mut buf = vec![0u8; 65536];

        while !shutdown.is_cancelled() {
            let recv = control_socket.recv_from(&mut buf, Duration::from_millis(200));
            let Ok(Some((len, source))) = recv else { continue };

            let frame = match CommandFrame::parse(&buf[..len]) {
                Ok(frame) => frame,
                // Truncation and wrong magic are silently dropped
                // (spec.md §7: "only pre-HMAC failures ... are silently
                // dropped").
                Err(_) => continue,
            };

            // Re-read on every datagram so a SIGHUP-reloaded `hmac_key`
            // takes effect immediately, not just at startup.
            let hmac_key = handle.block_on(state.config.read()).hmac_key.clone().into_bytes();

            if !frame.verify_hmac(&hmac_key) {
                state.stats.apply("auth_failures", 1);
                let resp = control::encode_response(&hmac_key, frame.sequence, Status::AuthFailed, &[]);
                let _ = control_socket.send_to(&resp, source);
                continue;
            }

            if replay.check(source.ip(), frame.sequence).is_err() {
                let resp = control::encode_response(&hmac_key, frame.sequence, Status::Replay, &[]);
                let _ = control_socket.send_to(&resp, source);
                continue;
            }

            let (status, payload) =
                dispatch_command(&handle, &state, &battery, frame.command_id, &frame.payload);

            let resp = control::encode_response(&hmac_key, frame.sequence, status, &payload);
            let _ = control_socket.send_to(&resp, source);
            replay.advance(source.ip(), frame.sequence);
        }
    });
}

fn dispatch_command(
    handle: &tokio::runtime::Handle,
    state: &DaemonState,
    battery: &Arc<dyn BatteryGauge>,
    command_id: u16,
    payload: &[u8],
) -> (Status, Vec<u8>) {
    match command_id {
        0x01 => {
            // START_SCAN: one byte, the ScanMode discriminant.
            let Some(&mode_byte) = payload.first() else {
                return (Status::Error, Vec::new());
            };
            let mode = match mode_byte {
                0 => ScanMode::Single,
                1 => ScanMode::Continuous,
                2 => ScanMode::Calibration,
                _ => return (Status::Error, Vec::new()),
            };
            match handle.block_on(state.engine.dispatch(SequenceEvent::StartScan(mode))) {
                Ok(()) => (Status::Ok, Vec::new()),
                Err(StateFault::Busy) => (Status::Busy, Vec::new()),
                Err(_) => (Status::Error, Vec::new()),
            }
        }
        0x02 => {
            // STOP_SCAN: empty payload, never fails.
            let _ = handle.block_on(state.engine.dispatch(SequenceEvent::StopScan));
            (Status::Ok, Vec::new())
        }
        0x10 => {
            let snapshot = state.engine.snapshot();
            let reading = battery.read().unwrap_or(crate::hal::BatteryMetrics {
                soc_pct: 0,
                voltage_mv: 0,
            });
            let uptime_sec = state.started_at.elapsed().as_secs() as u32;
            let payload = build_status_payload(
                snapshot,
                state.stats.snapshot(),
                reading.soc_pct,
                reading.voltage_mv,
                uptime_sec,
            );
            (Status::Ok, payload.to_vec())
        }
        0x20 => {
            if payload.is_empty() || payload.len() % 5 != 0 {
                return (Status::Error, Vec::new());
            }
            let mut cfg = handle.block_on(state.config.write());
            for chunk in payload.chunks_exact(5) {
                let param_id = chunk[0];
                let value = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
                if cfg.set_hot_param(param_id, value).is_err() {
                    return (Status::Error, Vec::new());
                }
            }
            (Status::Ok, Vec::new())
        }
        0x30 => {
            // RESET: force IDLE (the next StartScan re-zeroes retry_budget
            // on its Idle->Configure transition), clear auth_failures,
            // leave replay state untouched.
            let _ = handle.block_on(state.engine.dispatch(SequenceEvent::StopScan));
            let auth_failures = state.stats.snapshot().auth_failures;
            state.stats.apply("auth_failures", -auth_failures);
            (Status::Ok, Vec::new())
        }
        _ => (Status::InvalidCmd, Vec::new()),
    }
}
