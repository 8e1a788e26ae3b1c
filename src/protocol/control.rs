// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated control protocol: command/response framing, HMAC-SHA256
//! verification, and the per-source anti-replay table.

use std::collections::HashMap;
use std::net::IpAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ProtocolFault;

pub const COMMAND_MAGIC: u32 = 0xBEEF_CAFE;
pub const RESPONSE_MAGIC: u32 = 0xCAFE_BEEF;
pub const HMAC_LEN: usize = 32;
/// magic(4) + sequence(4) + command_id/status(2) + payload_len(2) + hmac(32).
pub const FRAME_HEADER_LEN: usize = 44;
/// Bytes covered by the HMAC: everything before the HMAC field itself.
const MAC_COVERED_LEN: usize = 12;

const REPLAY_TABLE_CAPACITY: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandId {
    StartScan = 0x01,
    StopScan = 0x02,
    GetStatus = 0x10,
    SetConfig = 0x20,
    Reset = 0x30,
}

impl CommandId {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x01 => Some(Self::StartScan),
            0x02 => Some(Self::StopScan),
            0x10 => Some(Self::GetStatus),
            0x20 => Some(Self::SetConfig),
            0x30 => Some(Self::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 0x0000,
    Error = 0x0001,
    Busy = 0x0002,
    InvalidCmd = 0x0003,
    AuthFailed = 0x0004,
    Replay = 0x0005,
}

/// A parsed, not-yet-authenticated command datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub sequence: u32,
    pub command_id: u16,
    pub payload: Vec<u8>,
    hmac: [u8; HMAC_LEN],
    mac_covered: Vec<u8>,
}

impl CommandFrame {
    /// Parse and validate magic/length; does not verify the HMAC.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolFault> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolFault::Truncated);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != COMMAND_MAGIC {
            return Err(ProtocolFault::InvalidMagic);
        }
        let sequence = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let command_id = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let payload_len = u16::from_le_bytes(buf[10..12].try_into().unwrap()) as usize;
        let mut hmac = [0u8; HMAC_LEN];
        hmac.copy_from_slice(&buf[12..44]);
        let payload = buf.get(44..44 + payload_len).ok_or(ProtocolFault::Truncated)?.to_vec();

        let mut mac_covered = Vec::with_capacity(MAC_COVERED_LEN + payload.len());
        mac_covered.extend_from_slice(&buf[0..MAC_COVERED_LEN]);
        mac_covered.extend_from_slice(&payload);

        Ok(Self { sequence, command_id, payload, hmac, mac_covered })
    }

    /// Verify the frame's HMAC against `key` using constant-time comparison.
    pub fn verify_hmac(&self, key: &[u8]) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else { return false };
        mac.update(&self.mac_covered);
        mac.verify_slice(&self.hmac).is_ok()
    }
}

/// Encode an outgoing response frame, computing its HMAC over bytes
/// `0..12` (magic, sequence, status, payload_len) plus the payload.
pub fn encode_response(key: &[u8], sequence: u32, status: Status, payload: &[u8]) -> Vec<u8> {
    let mut head = [0u8; MAC_COVERED_LEN];
    head[0..4].copy_from_slice(&RESPONSE_MAGIC.to_le_bytes());
    head[4..8].copy_from_slice(&sequence.to_le_bytes());
    head[8..10].copy_from_slice(&(status as u16).to_le_bytes());
    head[10..12].copy_from_slice(&(payload.len() as u16).to_le_bytes());

    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&head);
    mac.update(payload);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(&tag);
    out.extend_from_slice(payload);
    out
}

/// Per-source last-accepted-sequence table with a fixed capacity. A new
/// source is admitted only if a free slot remains; the table never evicts.
///
/// Keyed by IP address only, not the full socket address: the glossary's
/// "source address" is the canonical host identity, and the original
/// firmware's `find_client_slot(const char *source_ip)` keys the same
/// way, so two commands from the same host on different ephemeral ports
/// share one replay window rather than getting independent ones.
pub struct ReplayTable {
    last_sequence: HashMap<IpAddr, u32>,
}

impl ReplayTable {
    pub fn new() -> Self {
        Self { last_sequence: HashMap::with_capacity(REPLAY_TABLE_CAPACITY) }
    }

    /// Check whether `sequence` from `source` would be admitted, without
    /// advancing any state. Callers must call `advance` after a
    /// successful, fully-dispatched command.
    pub fn check(&self, source: IpAddr, sequence: u32) -> Result<(), ProtocolFault> {
        match self.last_sequence.get(&source) {
            Some(&last) => {
                if sequence > last {
                    Ok(())
                } else {
                    Err(ProtocolFault::Replay)
                }
            }
            None => {
                if self.last_sequence.len() < REPLAY_TABLE_CAPACITY {
                    Ok(())
                } else {
                    Err(ProtocolFault::Replay)
                }
            }
        }
    }

    /// Record `sequence` as the new last-accepted value for `source`.
    /// Only called after a command is authenticated, admitted, and
    /// dispatched successfully.
    pub fn advance(&mut self, source: IpAddr, sequence: u32) {
        self.last_sequence.insert(source, sequence);
    }
}

impl Default for ReplayTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_command(key: &[u8], sequence: u32, command_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut head = [0u8; MAC_COVERED_LEN];
        head[0..4].copy_from_slice(&COMMAND_MAGIC.to_le_bytes());
        head[4..8].copy_from_slice(&sequence.to_le_bytes());
        head[8..10].copy_from_slice(&command_id.to_le_bytes());
        head[10..12].copy_from_slice(&(payload.len() as u16).to_le_bytes());

        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(&head);
        mac.update(payload);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::new();
        out.extend_from_slice(&head);
        out.extend_from_slice(&tag);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parse_and_verify_round_trip() {
        let key = b"shared-secret";
        let buf = build_command(key, 5, 0x01, b"");
        let frame = CommandFrame::parse(&buf).unwrap();
        assert_eq!(frame.sequence, 5);
        assert_eq!(frame.command_id, 0x01);
        assert!(frame.verify_hmac(key));
    }

    #[test]
    fn tampered_payload_fails_hmac() {
        let key = b"shared-secret";
        let mut buf = build_command(key, 5, 0x01, b"abcd");
        *buf.last_mut().unwrap() ^= 0xFF;
        let frame = CommandFrame::parse(&buf).unwrap();
        assert!(!frame.verify_hmac(key));
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut buf = build_command(b"k", 1, 0x01, b"");
        buf[0] ^= 0xFF;
        assert_eq!(CommandFrame::parse(&buf), Err(ProtocolFault::InvalidMagic));
    }

    #[test]
    fn truncated_rejected() {
        let buf = build_command(b"k", 1, 0x01, b"");
        assert_eq!(CommandFrame::parse(&buf[..FRAME_HEADER_LEN - 1]), Err(ProtocolFault::Truncated));
    }

    #[test]
    fn replay_sequence_rules() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let mut table = ReplayTable::new();
        table.check(addr, 5).unwrap();
        table.advance(addr, 5);

        assert_eq!(table.check(addr, 5), Err(ProtocolFault::Replay));
        table.check(addr, 6).unwrap();
        table.advance(addr, 6);
    }

    #[test]
    fn replay_scenario_from_spec() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let mut table = ReplayTable::new();
        table.check(addr, 0xFFFF_FFFE).unwrap();
        table.advance(addr, 0xFFFF_FFFE);
        table.check(addr, 0xFFFF_FFFF).unwrap();
        table.advance(addr, 0xFFFF_FFFF);
        assert_eq!(table.check(addr, 0x0000_0000), Err(ProtocolFault::Replay));
    }

    #[test]
    fn table_capacity_is_sixteen_sources() {
        let mut table = ReplayTable::new();
        for i in 0..16u8 {
            let addr: IpAddr = format!("192.0.2.{i}").parse().unwrap();
            table.check(addr, 1).unwrap();
            table.advance(addr, 1);
        }
        let overflow: IpAddr = "192.0.2.200".parse().unwrap();
        assert_eq!(table.check(overflow, 1), Err(ProtocolFault::Replay));
    }

    #[test]
    fn same_host_different_ports_share_one_replay_window() {
        let mut table = ReplayTable::new();
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        table.check(ip, 5).unwrap();
        table.advance(ip, 5);

        // A command from the same host on a different ephemeral port
        // must see the window this host already advanced.
        assert_eq!(table.check(ip, 5), Err(ProtocolFault::Replay));
    }
}
