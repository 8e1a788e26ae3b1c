// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Drives a running daemon over real loopback UDP sockets, the way a
//! bench host would talk to it: build a command datagram, HMAC it,
//! send, and check the response.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use detectord::config::DetectorConfig;
use detectord::daemon::Collaborators;
use detectord::hal::{NullBatteryGauge, UdpTransport, UnavailableFpgaRegisters, UnavailableFrameSource};
use detectord::protocol::control::{COMMAND_MAGIC, CommandId};

const HMAC_KEY: &[u8] = b"integration-test-key";

fn build_command(sequence: u32, command_id: CommandId, payload: &[u8]) -> Vec<u8> {
    let mut head = [0u8; 12];
    head[0..4].copy_from_slice(&COMMAND_MAGIC.to_le_bytes());
    head[4..8].copy_from_slice(&sequence.to_le_bytes());
    head[8..10].copy_from_slice(&(command_id as u16).to_le_bytes());
    head[10..12].copy_from_slice(&(payload.len() as u16).to_le_bytes());

    let mut mac = Hmac::<Sha256>::new_from_slice(HMAC_KEY).unwrap();
    mac.update(&head);
    mac.update(payload);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::new();
    out.extend_from_slice(&head);
    out.extend_from_slice(&tag);
    out.extend_from_slice(payload);
    out
}

/// Response layout mirrors the command layout: magic(4) + sequence(4) +
/// status(2) + payload_len(2) + hmac(32) + payload.
fn response_status(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[8], buf[9]])
}

fn response_payload(buf: &[u8]) -> &[u8] {
    let payload_len = u16::from_le_bytes([buf[10], buf[11]]) as usize;
    &buf[44..44 + payload_len]
}

struct RunningDaemon {
    control_addr: SocketAddr,
    shutdown: CancellationToken,
}

async fn spawn_daemon() -> RunningDaemon {
    let mut config = DetectorConfig::default();
    config.hmac_key = String::from_utf8(HMAC_KEY.to_vec()).unwrap();

    let control_socket = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let control_addr = control_socket.local_addr().unwrap();
    let data_socket = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let collaborators = Collaborators {
        frame_source: Arc::new(UnavailableFrameSource),
        fpga: Arc::new(UnavailableFpgaRegisters),
        data_socket: Arc::new(data_socket),
        control_socket: Arc::new(control_socket),
        battery: Arc::new(NullBatteryGauge),
    };

    let shutdown = CancellationToken::new();
    let run_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = detectord::run(config, collaborators, run_shutdown).await;
    });

    // Give the control task a moment to start polling its socket.
    tokio::time::sleep(Duration::from_millis(50)).await;

    RunningDaemon { control_addr, shutdown }
}

fn roundtrip(client: &UdpSocket, control_addr: SocketAddr, datagram: &[u8]) -> Vec<u8> {
    client.send_to(datagram, control_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 256];
    let (len, _) = client.recv_from(&mut buf).unwrap();
    buf[..len].to_vec()
}

#[tokio::test]
async fn get_status_reports_idle_state() {
    let daemon = spawn_daemon().await;
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    let cmd = build_command(1, CommandId::GetStatus, &[]);
    let resp = roundtrip(&client, daemon.control_addr, &cmd);

    assert_eq!(response_status(&resp), 0x0000); // Status::Ok
    let payload = response_payload(&resp);
    assert_eq!(payload.len(), 44);
    assert_eq!(payload[0], 0); // SequenceState::Idle

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn unknown_command_id_is_rejected() {
    let daemon = spawn_daemon().await;
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut head = [0u8; 12];
    head[0..4].copy_from_slice(&COMMAND_MAGIC.to_le_bytes());
    head[4..8].copy_from_slice(&1u32.to_le_bytes());
    head[8..10].copy_from_slice(&0x9999u16.to_le_bytes());
    let mut mac = Hmac::<Sha256>::new_from_slice(HMAC_KEY).unwrap();
    mac.update(&head);
    let tag = mac.finalize().into_bytes();
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&head);
    cmd.extend_from_slice(&tag);

    let resp = roundtrip(&client, daemon.control_addr, &cmd);
    assert_eq!(response_status(&resp), 0x0003); // Status::InvalidCmd

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn wrong_hmac_key_is_silently_rejected_with_auth_failed() {
    let daemon = spawn_daemon().await;
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut head = [0u8; 12];
    head[0..4].copy_from_slice(&COMMAND_MAGIC.to_le_bytes());
    head[4..8].copy_from_slice(&1u32.to_le_bytes());
    head[8..10].copy_from_slice(&(CommandId::GetStatus as u16).to_le_bytes());
    let mut mac = Hmac::<Sha256>::new_from_slice(b"wrong-key").unwrap();
    mac.update(&head);
    let tag = mac.finalize().into_bytes();
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&head);
    cmd.extend_from_slice(&tag);

    let resp = roundtrip(&client, daemon.control_addr, &cmd);
    assert_eq!(response_status(&resp), 0x0004); // Status::AuthFailed

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn replayed_sequence_is_rejected() {
    let daemon = spawn_daemon().await;
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    let cmd = build_command(5, CommandId::GetStatus, &[]);
    let first = roundtrip(&client, daemon.control_addr, &cmd);
    assert_eq!(response_status(&first), 0x0000);

    let replay = roundtrip(&client, daemon.control_addr, &cmd);
    assert_eq!(response_status(&replay), 0x0005); // Status::Replay

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn set_config_then_get_status_round_trip() {
    let daemon = spawn_daemon().await;
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    // param_id 0 (frame_rate) = 30.
    let mut payload = vec![0u8];
    payload.extend_from_slice(&30u32.to_le_bytes());
    let cmd = build_command(1, CommandId::SetConfig, &payload);
    let resp = roundtrip(&client, daemon.control_addr, &cmd);
    assert_eq!(response_status(&resp), 0x0000);

    let status_cmd = build_command(2, CommandId::GetStatus, &[]);
    let status_resp = roundtrip(&client, daemon.control_addr, &status_cmd);
    assert_eq!(response_status(&status_resp), 0x0000);

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn start_scan_then_start_scan_again_is_busy() {
    let daemon = spawn_daemon().await;
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    let start = build_command(1, CommandId::StartScan, &[0u8]); // Single mode
    let resp = roundtrip(&client, daemon.control_addr, &start);
    assert_eq!(response_status(&resp), 0x0000);

    let start_again = build_command(2, CommandId::StartScan, &[0u8]);
    let resp2 = roundtrip(&client, daemon.control_addr, &start_again);
    assert_eq!(response_status(&resp2), 0x0002); // Status::Busy

    let stop = build_command(3, CommandId::StopScan, &[]);
    let resp3 = roundtrip(&client, daemon.control_addr, &stop);
    assert_eq!(response_status(&resp3), 0x0000);

    daemon.shutdown.cancel();
}
