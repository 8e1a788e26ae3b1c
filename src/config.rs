// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Detector configuration: YAML-backed, range-validated, with hot/cold
//! parameter classification for `SIGHUP` reloads.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sequence::ScanMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            // CRITICAL has no native tracing level; callers attach a
            // `critical = true` field to an ERROR event instead.
            Self::Error | Self::Critical => tracing::Level::ERROR,
        }
    }
}

impl TryFrom<u32> for LogLevel {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, <Self as TryFrom<u32>>::Error> {
        match value {
            0 => Ok(Self::Debug),
            1 => Ok(Self::Info),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Error),
            4 => Ok(Self::Critical),
            other => Err(ConfigError::OutOfRange {
                field: "log_level",
                detail: format!("{other} not in 0..=4"),
            }),
        }
    }
}

/// The cold+hot parameter set loaded from a YAML file at startup and
/// partially reloadable on `SIGHUP`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub rows: u16,
    pub cols: u16,
    pub bit_depth: u8,
    pub frame_rate: u16,
    pub csi2_lane_speed_mbps: u32,
    pub csi2_lanes: u8,
    pub spi_speed_hz: u32,
    pub host_ip: String,
    pub data_port: u16,
    pub control_port: u16,
    pub mtu_payload_cap: u32,
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,
    pub log_level: LogLevel,
    pub hmac_key: String,
    /// Where this config was loaded from, so a `SIGHUP` reload knows what
    /// to re-read. `None` for configs built in-memory (tests).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

fn default_scan_mode() -> ScanMode {
    ScanMode::Single
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rows: 2048,
            cols: 2048,
            bit_depth: 16,
            frame_rate: 15,
            csi2_lane_speed_mbps: 800,
            csi2_lanes: 4,
            spi_speed_hz: 50_000_000,
            host_ip: "192.168.1.100".to_string(),
            data_port: 8000,
            control_port: 8001,
            mtu_payload_cap: 8192,
            scan_mode: ScanMode::Single,
            log_level: LogLevel::Info,
            hmac_key: String::new(),
            source_path: None,
        }
    }
}

/// Whether a named field is hot-swappable (can change without stopping a
/// scan) or cold (requires the sequence engine to be IDLE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamClass {
    Hot,
    Cold,
}

const HOT_FIELDS: &[&str] =
    &["frame_rate", "host_ip", "data_port", "control_port", "log_level"];

/// Classify a config field by name. Fields outside the hot list (e.g.
/// `spi_speed_hz`, `mtu_payload_cap`, `hmac_key`) are cold — they
/// configure an external collaborator or are fixed at startup.
pub fn classify(field: &str) -> ParamClass {
    if HOT_FIELDS.contains(&field) {
        ParamClass::Hot
    } else {
        ParamClass::Cold
    }
}

impl DetectorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let mut config: Self =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Range-check every field per the table in REQ-FW-130. Returns the
    /// first violated field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn range_err(field: &'static str, detail: impl Into<String>) -> ConfigError {
            ConfigError::OutOfRange { field, detail: detail.into() }
        }

        if !(128..=4096).contains(&self.rows) {
            return Err(range_err("rows", format!("{} not in 128..=4096", self.rows)));
        }
        if !(128..=4096).contains(&self.cols) {
            return Err(range_err("cols", format!("{} not in 128..=4096", self.cols)));
        }
        if self.bit_depth != 14 && self.bit_depth != 16 {
            return Err(range_err("bit_depth", format!("{} not in {{14, 16}}", self.bit_depth)));
        }
        if !(1..=60).contains(&self.frame_rate) {
            return Err(range_err(
                "frame_rate",
                format!("{} not in 1..=60", self.frame_rate),
            ));
        }
        if self.csi2_lane_speed_mbps != 400 && self.csi2_lane_speed_mbps != 800 {
            return Err(range_err(
                "csi2_lane_speed_mbps",
                format!("{} not in {{400, 800}}", self.csi2_lane_speed_mbps),
            ));
        }
        if !(1..=4).contains(&self.csi2_lanes) {
            return Err(range_err(
                "csi2_lanes",
                format!("{} not in 1..=4", self.csi2_lanes),
            ));
        }
        if !(1_000_000..=50_000_000).contains(&self.spi_speed_hz) {
            return Err(range_err(
                "spi_speed_hz",
                format!("{} not in 1_000_000..=50_000_000", self.spi_speed_hz),
            ));
        }
        if self.host_ip.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(range_err(
                "host_ip",
                format!("{:?} is not a dotted-quad IPv4 address", self.host_ip),
            ));
        }
        if !(1024..=65535).contains(&self.data_port) {
            return Err(range_err(
                "data_port",
                format!("{} not in 1024..=65535", self.data_port),
            ));
        }
        if !(1024..=65535).contains(&self.control_port) {
            return Err(range_err(
                "control_port",
                format!("{} not in 1024..=65535", self.control_port),
            ));
        }
        if self.mtu_payload_cap > 8192 {
            return Err(range_err(
                "mtu_payload_cap",
                format!("{} exceeds 8192", self.mtu_payload_cap),
            ));
        }
        Ok(())
    }

    /// Apply one `SET_CONFIG` `(param_id, value)` tuple. Only the five
    /// hot params are addressable this way; any other `param_id` is a
    /// caller error, not a cold-parameter rejection (the control
    /// protocol has no cold-parameter path — those are config-file only).
    pub fn set_hot_param(&mut self, param_id: u8, value: u32) -> Result<(), ConfigError> {
        match param_id {
            0 => self.frame_rate = value as u16,
            1 => {
                let octets = value.to_le_bytes();
                self.host_ip = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
            }
            2 => self.data_port = value as u16,
            3 => self.control_port = value as u16,
            4 => self.log_level = LogLevel::try_from(value)?,
            other => {
                return Err(ConfigError::OutOfRange {
                    field: "param_id",
                    detail: format!("unknown param_id {other}"),
                })
            }
        }
        self.validate()
    }

    /// Apply a `SIGHUP` reload. Hot fields from `next` always replace
    /// `self`'s; cold fields may only change while `engine_idle` is true.
    pub fn apply_reload(&mut self, next: Self, engine_idle: bool) -> Result<(), ConfigError> {
        next.validate()?;

        macro_rules! cold_field {
            ($field:ident) => {
                if self.$field != next.$field {
                    if !engine_idle {
                        return Err(ConfigError::ColdParameterWhileRunning {
                            field: stringify!($field),
                        });
                    }
                    self.$field = next.$field;
                }
            };
        }

        cold_field!(rows);
        cold_field!(cols);
        cold_field!(bit_depth);
        cold_field!(csi2_lane_speed_mbps);
        cold_field!(csi2_lanes);
        cold_field!(spi_speed_hz);
        cold_field!(mtu_payload_cap);
        cold_field!(hmac_key);

        self.frame_rate = next.frame_rate;
        self.host_ip = next.host_ip;
        self.data_port = next.data_port;
        self.control_port = next.control_port;
        self.log_level = next.log_level;
        Ok(())
    }
}

/// Default location a freshly installed daemon expects its config at;
/// carried only for CLI help text.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/detectord/detector_config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(DetectorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_rows() {
        let mut c = DetectorConfig::default();
        c.rows = 64;
        assert!(matches!(c.validate(), Err(ConfigError::OutOfRange { field: "rows", .. })));
    }

    #[test]
    fn rejects_bad_bit_depth() {
        let mut c = DetectorConfig::default();
        c.bit_depth = 12;
        assert!(matches!(c.validate(), Err(ConfigError::OutOfRange { field: "bit_depth", .. })));
    }

    #[test]
    fn hot_field_reload_always_applies() {
        let mut c = DetectorConfig::default();
        let mut next = c.clone();
        next.frame_rate = 30;
        c.apply_reload(next, false).unwrap();
        assert_eq!(c.frame_rate, 30);
    }

    #[test]
    fn cold_field_reload_rejected_while_busy() {
        let mut c = DetectorConfig::default();
        let mut next = c.clone();
        next.rows = 1024;
        let err = c.apply_reload(next, false).unwrap_err();
        assert!(matches!(err, ConfigError::ColdParameterWhileRunning { field: "rows" }));
        assert_eq!(c.rows, 2048);
    }

    #[test]
    fn cold_field_reload_applies_when_idle() {
        let mut c = DetectorConfig::default();
        let mut next = c.clone();
        next.rows = 1024;
        c.apply_reload(next, true).unwrap();
        assert_eq!(c.rows, 1024);
    }

    #[test]
    fn classify_matches_req_fw_131() {
        assert_eq!(classify("frame_rate"), ParamClass::Hot);
        assert_eq!(classify("rows"), ParamClass::Cold);
        assert_eq!(classify("hmac_key"), ParamClass::Cold);
    }

    #[test]
    fn set_hot_param_frame_rate() {
        let mut c = DetectorConfig::default();
        c.set_hot_param(0, 30).unwrap();
        assert_eq!(c.frame_rate, 30);
    }

    #[test]
    fn set_hot_param_host_ip_packs_octets() {
        let mut c = DetectorConfig::default();
        let packed = u32::from_le_bytes([10, 0, 0, 1]);
        c.set_hot_param(1, packed).unwrap();
        assert_eq!(c.host_ip, "10.0.0.1");
    }

    #[test]
    fn set_hot_param_unknown_id_errors() {
        let mut c = DetectorConfig::default();
        assert!(c.set_hot_param(99, 0).is_err());
    }
}
