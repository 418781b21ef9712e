//! Layered configuration for o3diag
//!
//! Defaults, then `o3diag.toml` (or the file given with `--config`), then
//! `O3DIAG_*` environment variables. Command-line flags are applied last
//! by the caller.

use anyhow::{ensure, Context, Result};
use obd_protocol::{ObdProtocol, SerialConfig};
use obd_sequencer::{is_valid_rate, InitProfile, PollerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base name of the configuration file looked up in the working directory
pub const DEFAULT_CONFIG_NAME: &str = "o3diag";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "O3DIAG";

/// Resolved settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagConfig {
    /// Serial device of the adapter
    pub port: String,
    pub baud_rate: u32,
    /// Wait after opening the port before the first command
    pub settle_delay_ms: u64,
    /// Session worker cadence
    pub poll_interval_ms: u64,
    pub protocol: ObdProtocol,
    pub init_profile: InitProfile,
    /// Run the init profile before every command
    pub auto_init: bool,
    /// o3script file with DTC descriptions
    pub dtc_table: Option<PathBuf>,
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Live polling rate for engine PIDs (Hz)
    pub base_rate_hz: f64,
    /// Live polling rate for control module voltage (Hz)
    pub voltage_rate_hz: f64,
}

impl Default for DiagConfig {
    fn default() -> Self {
        let serial = SerialConfig::default();
        let poller = PollerConfig::default();
        Self {
            port: serial.device,
            baud_rate: serial.baud_rate,
            settle_delay_ms: serial.settle_delay.as_millis() as u64,
            poll_interval_ms: serial.poll_interval.as_millis() as u64,
            protocol: ObdProtocol::default(),
            init_profile: InitProfile::default(),
            auto_init: true,
            dtc_table: None,
            log_level: "info".to_string(),
            base_rate_hz: poller.base_rate_hz,
            voltage_rate_hz: poller.voltage_rate_hz,
        }
    }
}

impl DiagConfig {
    /// Load settings from an explicit file or the default lookup
    ///
    /// An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let loaded: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the session or poller cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            is_valid_rate(self.base_rate_hz),
            "base_rate_hz must be a positive number, got {}",
            self.base_rate_hz
        );
        ensure!(
            is_valid_rate(self.voltage_rate_hz),
            "voltage_rate_hz must be a positive number, got {}",
            self.voltage_rate_hz
        );
        ensure!(self.baud_rate > 0, "baud_rate must be non-zero");
        Ok(())
    }

    /// Apply command-line flags on top of the loaded settings
    pub fn apply_overrides(
        &mut self,
        port: Option<&str>,
        baud_rate: Option<u32>,
        dtc_table: Option<&Path>,
    ) {
        if let Some(port) = port {
            self.port = port.to_string();
        }
        if let Some(baud_rate) = baud_rate {
            self.baud_rate = baud_rate;
        }
        if let Some(dtc_table) = dtc_table {
            self.dtc_table = Some(dtc_table.to_path_buf());
        }
    }

    /// Serial settings for opening the session
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..SerialConfig::new(self.port.clone(), self.baud_rate)
        }
    }

    /// Rates for the live poller
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            base_rate_hz: self.base_rate_hz,
            voltage_rate_hz: self.voltage_rate_hz,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = DiagConfig::default();
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.settle_delay_ms, 2000);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.init_profile, InitProfile::Adaptive);
        assert!(config.auto_init);
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let path = write_temp(
            "o3diag-config",
            r#"
port = "COM3"
baud_rate = 9600
protocol = "iso9141_2"
init_profile = "basic"
dtc_table = "codes.o3script"
"#,
        );

        let config = DiagConfig::load(Some(&path)).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.port, "COM3");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.protocol, ObdProtocol::Iso9141_2);
        assert_eq!(config.init_profile, InitProfile::Basic);
        assert_eq!(config.dtc_table, Some(PathBuf::from("codes.o3script")));
        // Untouched keys keep their defaults
        assert_eq!(config.poll_interval_ms, 50);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let path = std::env::temp_dir().join("o3diag-does-not-exist.toml");
        assert!(DiagConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = write_temp(
            "o3diag-env",
            r#"
log_level = "warn"
settle_delay_ms = 500
"#,
        );

        std::env::set_var("O3DIAG_LOG_LEVEL", "trace");
        std::env::set_var("O3DIAG_SETTLE_DELAY_MS", "0");
        let loaded = DiagConfig::load(Some(&path));
        std::env::remove_var("O3DIAG_LOG_LEVEL");
        std::env::remove_var("O3DIAG_SETTLE_DELAY_MS");
        fs::remove_file(&path).ok();

        let config = loaded.unwrap();
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.settle_delay_ms, 0);
    }

    #[test]
    fn test_flags_override_file() {
        let path = write_temp(
            "o3diag-flags",
            r#"
port = "COM3"
baud_rate = 9600
dtc_table = "file.o3script"
"#,
        );
        let mut config = DiagConfig::load(Some(&path)).unwrap();
        fs::remove_file(&path).ok();

        config.apply_overrides(Some("/dev/rfcomm0"), None, Some(Path::new("flag.o3script")));
        assert_eq!(config.port, "/dev/rfcomm0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.dtc_table, Some(PathBuf::from("flag.o3script")));

        config.apply_overrides(None, Some(115200), None);
        assert_eq!(config.port, "/dev/rfcomm0");
        assert_eq!(config.baud_rate, 115200);
    }

    #[test]
    fn test_unusable_rates_rejected() {
        let path = write_temp("o3diag-rates", "voltage_rate_hz = 0\n");
        let err = DiagConfig::load(Some(&path)).unwrap_err();
        fs::remove_file(&path).ok();
        assert!(err.to_string().contains("voltage_rate_hz"), "{:#}", err);

        for rate in [-1.0, f64::NAN, f64::INFINITY] {
            let config = DiagConfig {
                base_rate_hz: rate,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "rate {}", rate);
        }
        assert!(DiagConfig::default().validate().is_ok());
    }

    #[test]
    fn test_serial_config_conversion() {
        let config = DiagConfig {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115200,
            settle_delay_ms: 0,
            ..Default::default()
        };
        let serial = config.serial_config();
        assert_eq!(serial.device, "/dev/ttyACM0");
        assert_eq!(serial.baud_rate, 115200);
        assert_eq!(serial.settle_delay, Duration::ZERO);
        assert_eq!(serial.poll_interval, Duration::from_millis(50));
    }
}
