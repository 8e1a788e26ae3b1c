// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Collaborator trait interfaces. The daemon core never talks to SPI,
//! V4L2/CSI-2, UDP sockets, or the battery gauge directly — it only
//! depends on these traits, so the hard-core modules stay testable with
//! fakes. Production implementations (not part of this crate's
//! hard-core scope) live behind these same interfaces.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportFault;

/// A captured frame handed back by the capture collaborator, matching
/// spec.md §9's replacement for the source's `void*`-smuggled buffer
/// index: an explicit tagged handle rather than a cast pointer.
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub sequence: u32,
    pub timestamp_ns: u64,
    pub handle: CaptureHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHandle {
    pub buffer_ref: u32,
    pub slot_index: usize,
}

/// FPGA register file over SPI, 7-bit address space (0..0x7F).
pub trait FpgaRegisters: Send + Sync {
    fn reg_read(&self, addr: u8) -> Result<u16, TransportFault>;
    /// Implementations retry write-then-read-verify up to 3 attempts
    /// internally; callers see only the terminal outcome.
    fn reg_write(&self, addr: u8, data: u16) -> Result<(), TransportFault>;
}

/// MIPI CSI-2 frame capture collaborator.
pub trait FrameSource: Send + Sync {
    fn capture(&self, timeout_ms: u32) -> Result<CapturedFrame, TransportFault>;
    fn release(&self, handle: CaptureHandle);
}

/// Outbound UDP data-plane socket (frame streaming).
pub trait DataSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

/// Bidirectional UDP control-plane socket.
pub trait ControlSocket: Send + Sync {
    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

/// Battery gauge readings, grounded in `bq40z50_driver.h`'s SBS register
/// map (SOC and voltage only — current/temperature/capacity are not
/// consumed by `GET_STATUS` and are out of this crate's scope).
#[derive(Debug, Clone, Copy)]
pub struct BatteryMetrics {
    pub soc_pct: u8,
    pub voltage_mv: u16,
}

pub trait BatteryGauge: Send + Sync {
    fn read(&self) -> Result<BatteryMetrics, TransportFault>;
}

/// A fixed healthy reading, used where no real gauge is wired up (tests,
/// bench hardware without a fuel gauge).
pub struct NullBatteryGauge;

impl BatteryGauge for NullBatteryGauge {
    fn read(&self) -> Result<BatteryMetrics, TransportFault> {
        Ok(BatteryMetrics { soc_pct: 100, voltage_mv: 4200 })
    }
}

/// Always-fails stand-ins for the two collaborators with no
/// network-only production path (SPI register file, CSI-2 capture) —
/// wiring a real one means building against the target board's kernel
/// driver, outside this crate's hard-core scope. `main` substitutes one
/// of these only when no hardware backend was configured, so the daemon
/// still starts and its data/control plane is fully exercisable against
/// a bench UDP peer.
pub struct UnavailableFpgaRegisters;

impl FpgaRegisters for UnavailableFpgaRegisters {
    fn reg_read(&self, addr: u8) -> Result<u16, TransportFault> {
        Err(TransportFault::Spi { addr, attempts: 0 })
    }

    fn reg_write(&self, addr: u8, _data: u16) -> Result<(), TransportFault> {
        Err(TransportFault::Spi { addr, attempts: 0 })
    }
}

pub struct UnavailableFrameSource;

impl FrameSource for UnavailableFrameSource {
    fn capture(&self, _timeout_ms: u32) -> Result<CapturedFrame, TransportFault> {
        Err(TransportFault::Capture("no capture backend wired".to_string()))
    }

    fn release(&self, _handle: CaptureHandle) {}
}

/// A UDP socket collaborator, used for both the data and control planes.
/// `recv_timeout` is applied per-call via `set_read_timeout` since
/// `std::net::UdpSocket` has no per-call timeout parameter.
pub struct UdpTransport(std::net::UdpSocket);

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self(std::net::UdpSocket::bind(addr)?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

impl DataSocket for UdpTransport {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, dest)
    }
}

impl ControlSocket for UdpTransport {
    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        self.0.set_read_timeout(Some(timeout))?;
        match self.0.recv_from(buf) {
            Ok((len, source)) => Ok(Some((len, source))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, dest)
    }
}

/// Log (not enforce) REQ-FW-092's warning/emergency thresholds. Acting on
/// the emergency threshold is out of scope — the battery gauge is a
/// collaborator the core only observes.
pub fn log_battery_threshold(metrics: BatteryMetrics) {
    if metrics.soc_pct <= 5 {
        tracing::error!(critical = true, soc_pct = metrics.soc_pct, "battery emergency threshold");
    } else if metrics.soc_pct <= 10 {
        tracing::warn!(soc_pct = metrics.soc_pct, "battery low");
    }
}
