//! Configuration surface consumed by the orchestrator and every task.
//!
//! Mirrors the reference implementation's `ConfigManager` structure
//! (hardware / tinybms / victron / cvl / watchdog sections), but loaded as a
//! single JSON document via `serde` instead of a hand-rolled JSON walk.
//! Every field is defaulted so a missing or partial file still produces a
//! fully usable configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub tinybms: TinyBmsConfig,
    #[serde(default)]
    pub victron: VictronConfig,
    #[serde(default)]
    pub cvl: CvlConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            hardware: HardwareConfig::default(),
            tinybms: TinyBmsConfig::default(),
            victron: VictronConfig::default(),
            cvl: CvlConfig::default(),
            watchdog: WatchdogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    #[serde(default = "default_uart_device")]
    pub uart_device: String,
    #[serde(default = "default_uart_baud")]
    pub uart_baud: u32,
    #[serde(default = "default_uart_timeout_ms")]
    pub uart_timeout_ms: u64,
    #[serde(default = "default_can_interface")]
    pub can_interface: String,
    #[serde(default = "default_can_bitrate")]
    pub can_bitrate: u32,
}

fn default_uart_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_uart_baud() -> u32 {
    115200
}
fn default_uart_timeout_ms() -> u64 {
    1000
}
fn default_can_interface() -> String {
    "can0".to_string()
}
fn default_can_bitrate() -> u32 {
    250_000
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            uart_device: default_uart_device(),
            uart_baud: default_uart_baud(),
            uart_timeout_ms: default_uart_timeout_ms(),
            can_interface: default_can_interface(),
            can_bitrate: default_can_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BmsProtocol {
    Native,
    Modbus,
}

impl Default for BmsProtocol {
    fn default() -> Self {
        BmsProtocol::Native
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TinyBmsConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u32,
    #[serde(default = "default_uart_retry_count")]
    pub uart_retry_count: u8,
    #[serde(default = "default_uart_retry_delay_ms")]
    pub uart_retry_delay_ms: u32,
    #[serde(default)]
    pub protocol: BmsProtocol,
    /// Consecutive failed polling rounds before BmsOffline is raised.
    #[serde(default = "default_offline_failure_threshold")]
    pub offline_failure_threshold: u32,
}

fn default_poll_interval_ms() -> u32 {
    100
}
fn default_uart_retry_count() -> u8 {
    3
}
fn default_uart_retry_delay_ms() -> u32 {
    50
}
fn default_offline_failure_threshold() -> u32 {
    5
}

impl Default for TinyBmsConfig {
    fn default() -> Self {
        TinyBmsConfig {
            poll_interval_ms: default_poll_interval_ms(),
            uart_retry_count: default_uart_retry_count(),
            uart_retry_delay_ms: default_uart_retry_delay_ms(),
            protocol: BmsProtocol::default(),
            offline_failure_threshold: default_offline_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VictronThresholds {
    #[serde(default = "default_undervoltage_v")]
    pub undervoltage_v: f32,
    #[serde(default = "default_overvoltage_v")]
    pub overvoltage_v: f32,
    #[serde(default = "default_overtemp_c")]
    pub overtemp_c: f32,
    #[serde(default = "default_low_temp_charge_c")]
    pub low_temp_charge_c: f32,
    #[serde(default = "default_imbalance_warn_mv")]
    pub imbalance_warn_mv: u16,
    #[serde(default = "default_imbalance_alarm_mv")]
    pub imbalance_alarm_mv: u16,
    #[serde(default = "default_soc_low_percent")]
    pub soc_low_percent: f32,
    #[serde(default = "default_soc_high_percent")]
    pub soc_high_percent: f32,
    #[serde(default = "default_derate_current_a")]
    pub derate_current_a: f32,
}

fn default_undervoltage_v() -> f32 {
    44.0
}
fn default_overvoltage_v() -> f32 {
    58.4
}
fn default_overtemp_c() -> f32 {
    55.0
}
fn default_low_temp_charge_c() -> f32 {
    0.0
}
fn default_imbalance_warn_mv() -> u16 {
    100
}
fn default_imbalance_alarm_mv() -> u16 {
    200
}
fn default_soc_low_percent() -> f32 {
    10.0
}
fn default_soc_high_percent() -> f32 {
    99.0
}
fn default_derate_current_a() -> f32 {
    1.0
}

impl Default for VictronThresholds {
    fn default() -> Self {
        VictronThresholds {
            undervoltage_v: default_undervoltage_v(),
            overvoltage_v: default_overvoltage_v(),
            overtemp_c: default_overtemp_c(),
            low_temp_charge_c: default_low_temp_charge_c(),
            imbalance_warn_mv: default_imbalance_warn_mv(),
            imbalance_alarm_mv: default_imbalance_alarm_mv(),
            soc_low_percent: default_soc_low_percent(),
            soc_high_percent: default_soc_high_percent(),
            derate_current_a: default_derate_current_a(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VictronConfig {
    #[serde(default = "default_pgn_interval_ms")]
    pub pgn_interval_ms: u32,
    #[serde(default = "default_cvl_interval_ms")]
    pub cvl_interval_ms: u32,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u32,
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u32,
    #[serde(default)]
    pub thresholds: VictronThresholds,
    #[serde(default = "default_manufacturer_name")]
    pub manufacturer_name: String,
    #[serde(default = "default_battery_name")]
    pub battery_name: String,
}

fn default_pgn_interval_ms() -> u32 {
    1000
}
fn default_cvl_interval_ms() -> u32 {
    20_000
}
fn default_keepalive_interval_ms() -> u32 {
    1000
}
fn default_keepalive_timeout_ms() -> u32 {
    10_000
}
fn default_manufacturer_name() -> String {
    "TinyBMS".to_string()
}
fn default_battery_name() -> String {
    "Lithium Battery".to_string()
}

impl Default for VictronConfig {
    fn default() -> Self {
        VictronConfig {
            pgn_interval_ms: default_pgn_interval_ms(),
            cvl_interval_ms: default_cvl_interval_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            thresholds: VictronThresholds::default(),
            manufacturer_name: default_manufacturer_name(),
            battery_name: default_battery_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CvlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bulk_target_v")]
    pub bulk_target_v: f32,
    #[serde(default = "default_bulk_soc_threshold")]
    pub bulk_soc_threshold: f32,
    #[serde(default = "default_transition_soc_threshold")]
    pub transition_soc_threshold: f32,
    #[serde(default = "default_float_soc_threshold")]
    pub float_soc_threshold: f32,
    #[serde(default = "default_float_exit_soc")]
    pub float_exit_soc: f32,
    #[serde(default = "default_float_approach_offset_mv")]
    pub float_approach_offset_mv: f32,
    #[serde(default = "default_float_offset_mv")]
    pub float_offset_mv: f32,
    #[serde(default = "default_minimum_ccl_in_float_a")]
    pub minimum_ccl_in_float_a: f32,
    #[serde(default = "default_imbalance_hold_threshold_mv")]
    pub imbalance_hold_threshold_mv: u16,
    #[serde(default = "default_imbalance_release_threshold_mv")]
    pub imbalance_release_threshold_mv: u16,
    #[serde(default = "default_series_cell_count")]
    pub series_cell_count: u8,
}

fn default_series_cell_count() -> u8 {
    16
}

fn default_true() -> bool {
    true
}
fn default_bulk_target_v() -> f32 {
    58.4
}
fn default_bulk_soc_threshold() -> f32 {
    90.0
}
fn default_transition_soc_threshold() -> f32 {
    95.0
}
fn default_float_soc_threshold() -> f32 {
    98.0
}
fn default_float_exit_soc() -> f32 {
    95.0
}
fn default_float_approach_offset_mv() -> f32 {
    50.0
}
fn default_float_offset_mv() -> f32 {
    100.0
}
fn default_minimum_ccl_in_float_a() -> f32 {
    5.0
}
fn default_imbalance_hold_threshold_mv() -> u16 {
    100
}
fn default_imbalance_release_threshold_mv() -> u16 {
    50
}

impl Default for CvlConfig {
    fn default() -> Self {
        CvlConfig {
            enabled: default_true(),
            bulk_target_v: default_bulk_target_v(),
            bulk_soc_threshold: default_bulk_soc_threshold(),
            transition_soc_threshold: default_transition_soc_threshold(),
            float_soc_threshold: default_float_soc_threshold(),
            float_exit_soc: default_float_exit_soc(),
            float_approach_offset_mv: default_float_approach_offset_mv(),
            float_offset_mv: default_float_offset_mv(),
            minimum_ccl_in_float_a: default_minimum_ccl_in_float_a(),
            imbalance_hold_threshold_mv: default_imbalance_hold_threshold_mv(),
            imbalance_release_threshold_mv: default_imbalance_release_threshold_mv(),
            series_cell_count: default_series_cell_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_timeout_ms")]
    pub timeout_ms: u32,
    #[serde(default = "default_min_feed_interval_ms")]
    pub min_feed_interval_ms: u32,
    /// Marker file left behind for the duration of a run; its presence at
    /// the next boot stands in for the firmware's reset-cause register.
    #[serde(default = "default_watchdog_marker_path")]
    pub marker_path: String,
}

fn default_watchdog_timeout_ms() -> u32 {
    5000
}
fn default_min_feed_interval_ms() -> u32 {
    100
}
fn default_watchdog_marker_path() -> String {
    "/run/tinybms-bridge.running".to_string()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            timeout_ms: default_watchdog_timeout_ms(),
            min_feed_interval_ms: default_min_feed_interval_ms(),
            marker_path: default_watchdog_marker_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file, falling back to compiled-in
    /// defaults for anything the file omits. Malformed JSON is rejected
    /// rather than partially applied.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: BridgeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hardware.uart_baud == 0 {
            return Err(ConfigError::Invalid("hardware.uart_baud must be > 0".into()));
        }
        if self.hardware.can_bitrate == 0 {
            return Err(ConfigError::Invalid("hardware.can_bitrate must be > 0".into()));
        }
        if self.victron.keepalive_timeout_ms < 2 * self.victron.keepalive_interval_ms {
            return Err(ConfigError::Invalid(
                "victron.keepalive_timeout_ms must be at least 2x keepalive_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let config = BridgeConfig::default();
        assert_eq!(config.hardware.uart_baud, 115200);
        assert_eq!(config.hardware.can_bitrate, 250_000);
        assert_eq!(config.tinybms.poll_interval_ms, 100);
        assert_eq!(config.victron.pgn_interval_ms, 1000);
        assert_eq!(config.cvl.bulk_target_v, 58.4);
        assert_eq!(config.watchdog.timeout_ms, 5000);
        assert_eq!(config.tinybms.offline_failure_threshold, 5);
        assert_eq!(config.watchdog.marker_path, "/run/tinybms-bridge.running");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let json = r#"{"cvl": {"bulk_target_v": 55.2}}"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cvl.bulk_target_v, 55.2);
        assert_eq!(config.cvl.bulk_soc_threshold, 90.0);
        assert_eq!(config.hardware.uart_baud, 115200);
    }

    #[test]
    fn rejects_short_keepalive_timeout() {
        let mut config = BridgeConfig::default();
        config.victron.keepalive_timeout_ms = config.victron.keepalive_interval_ms;
        assert!(config.validate().is_err());
    }
}
