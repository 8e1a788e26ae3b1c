// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame header encode/decode and fragmentation.
//!
//! The wire header is 36 bytes: the field list sums to 36 once the
//! timestamp is treated as 8-byte little-endian nanoseconds at offset 24
//! (the encode/decode pair in the original firmware is authoritative over
//! the competing 32-bit truncated variant — see DESIGN.md open question 1).
//! CRC-16/CCITT covers bytes `0..32` (everything before the CRC field
//! itself); the two trailing reserved bytes are excluded same as the CRC.

use crc::{Crc, CRC_16_IBM_3740};

use crate::error::ProtocolFault;

pub const MAGIC: u32 = 0xD7E0_1234;
pub const HEADER_LEN: usize = 36;

pub const FLAG_FIRST_PACKET: u16 = 1 << 0;
pub const FLAG_LAST_PACKET: u16 = 1 << 1;
pub const FLAG_DROP_INDICATOR: u16 = 1 << 15;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_number: u32,
    pub packet_index: u16,
    pub total_packets: u16,
    pub payload_len: u16,
    pub flags: u16,
    pub timestamp_ns: u64,
    pub crc16: u16,
}

impl FrameHeader {
    pub fn first_packet(&self) -> bool {
        self.flags & FLAG_FIRST_PACKET != 0
    }

    pub fn last_packet(&self) -> bool {
        self.flags & FLAG_LAST_PACKET != 0
    }

    pub fn drop_indicator(&self) -> bool {
        self.flags & FLAG_DROP_INDICATOR != 0
    }

    /// Encode into a fixed 36-byte header, computing and writing the CRC
    /// over bytes `0..32` last.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[8..10].copy_from_slice(&self.packet_index.to_le_bytes());
        buf[10..12].copy_from_slice(&self.total_packets.to_le_bytes());
        buf[12..14].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[14..16].copy_from_slice(&self.flags.to_le_bytes());
        // bytes 16..24 stay zero (reserved)
        buf[24..32].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        let crc = CRC.checksum(&buf[0..32]);
        buf[32..34].copy_from_slice(&crc.to_le_bytes());
        // bytes 34..36 stay zero (reserved)
        buf
    }

    /// Decode a header from the first 36 bytes of `buf`. Wrong magic fails
    /// without computing the CRC; a CRC mismatch does not fail decode —
    /// it is reported via the returned `crc_valid`.
    pub fn decode(buf: &[u8]) -> Result<(Self, bool), ProtocolFault> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolFault::Truncated);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ProtocolFault::InvalidMagic);
        }

        let header = Self {
            frame_number: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            packet_index: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            total_packets: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            payload_len: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
            timestamp_ns: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            crc16: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
        };

        let computed = CRC.checksum(&buf[0..32]);
        let crc_valid = computed == header.crc16;
        Ok((header, crc_valid))
    }
}

/// One encoded wire packet: a 36-byte header followed by its payload slice.
pub struct Packet {
    pub header: FrameHeader,
    pub bytes: Vec<u8>,
}

/// Split `payload` into packets of at most `payload_cap` bytes each,
/// per-packet header fields set per REQ-FW §4.3. `payload_cap` is the
/// configured MTU budget minus the 36-byte header.
pub fn fragment(
    payload: &[u8],
    frame_number: u32,
    payload_cap: usize,
    timestamp_ns: u64,
) -> Vec<Packet> {
    assert!(payload_cap > 0, "payload_cap must be positive");
    let total_packets = payload.len().div_ceil(payload_cap).max(1) as u16;

    (0..total_packets)
        .map(|i| {
            let start = i as usize * payload_cap;
            let end = (start + payload_cap).min(payload.len());
            let chunk = &payload[start..end];

            let mut flags = 0u16;
            if i == 0 {
                flags |= FLAG_FIRST_PACKET;
            }
            if i == total_packets - 1 {
                flags |= FLAG_LAST_PACKET;
            }

            let header = FrameHeader {
                frame_number,
                packet_index: i,
                total_packets,
                payload_len: chunk.len() as u16,
                flags,
                timestamp_ns,
                crc16: 0,
            };

            let mut bytes = Vec::with_capacity(HEADER_LEN + chunk.len());
            bytes.extend_from_slice(&header.encode());
            bytes.extend_from_slice(chunk);
            Packet { header, bytes }
        })
        .collect()
}
