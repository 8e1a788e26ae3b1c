// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the detector daemon.
//!
//! Every fallible core operation returns one of these kinds rather than an
//! opaque string or thread-local message; counters are bucketed by kind so
//! observability does not depend on log retention.

use std::fmt;

use thiserror::Error;

/// Top-level daemon error. Each variant is a distinct error kind with its
/// own propagation policy (see the module docs on each subsystem).
#[derive(Debug, Error)]
pub enum DaemonError {
    /// I/O with a collaborator failed (SPI, capture, socket).
    #[error("transport fault: {0}")]
    Transport(#[from] TransportFault),

    /// Malformed frame, wrong magic, CRC mismatch, HMAC mismatch, replay.
    #[error("protocol fault: {0}")]
    Protocol(#[from] ProtocolFault),

    /// Operation invalid in the current state; a caller contract violation.
    #[error("state fault: {0}")]
    State(#[from] StateFault),

    /// A bounded resource (replay table, retry budget) is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// An invariant was violated. The caller should log a CRITICAL record
    /// and terminate the process.
    #[error("fatal: {0}")]
    Fatal(&'static str),

    /// Configuration failed to load or validate.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl DaemonError {
    /// Coarse kind used to bucket a named runtime counter.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::State(_) => ErrorKind::State,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    State,
    ResourceExhausted,
    Fatal,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::State => "state",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Fatal => "fatal",
            Self::Config => "config",
        };
        f.write_str(s)
    }
}

/// I/O with a collaborator (SPI register file, CSI-2 capture, UDP socket)
/// failed. Surfaced after any component-local retry is exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportFault {
    #[error("spi register {addr:#04x} access failed after {attempts} attempt(s)")]
    Spi { addr: u8, attempts: u8 },
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("socket send/receive failed: {0}")]
    Socket(String),
}

/// Malformed wire data. Reported to the peer when a reply channel exists
/// (the control path); dropped silently for pre-authentication failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("wrong magic number")]
    InvalidMagic,
    #[error("crc-16 mismatch")]
    CrcMismatch,
    #[error("hmac verification failed")]
    AuthFailed,
    #[error("sequence number already seen (replay)")]
    Replay,
    #[error("datagram too short")]
    Truncated,
    #[error("unknown command id")]
    InvalidCommand,
}

/// A caller invoked an operation that is invalid in the current state.
/// Indicates a contract violation; never retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateFault {
    #[error("ring slot is not in the expected state")]
    InvalidSlotState,
    #[error("no ready slot to acquire")]
    NoneReady,
    #[error("sequence engine rejected the transition")]
    InvalidTransition,
    #[error("sequence engine is busy with another scan")]
    Busy,
    #[error("retry budget exhausted")]
    RetryExhausted,
}

/// Configuration failed to load or validate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("field {field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
    #[error("cannot change cold parameter {field} while the sequence engine is not idle")]
    ColdParameterWhileRunning { field: &'static str },
}
