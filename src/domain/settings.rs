use crate::domain::models::DEFAULT_SALINITY;
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::protocol::{self, parse_uuid};
use crate::infrastructure::bluetooth::scanner::ScanConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "phyter_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Identifiers
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_data_uuid")]
    pub ble_data_char_uuid: String,
    #[serde(default = "default_client_config_uuid")]
    pub ble_client_config_uuid: String,

    // Discovery
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,

    // Instrument
    #[serde(default = "default_salinity")]
    pub default_salinity: f32,
    /// `None` waits for responses indefinitely
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub high_priority_connection: bool,

    // Known instruments
    #[serde(default)]
    pub known_instrument_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_data_char_uuid: default_data_uuid(),
            ble_client_config_uuid: default_client_config_uuid(),
            scan_duration_ms: default_scan_duration_ms(),
            default_salinity: default_salinity(),
            command_timeout_ms: None,
            high_priority_connection: true,
            known_instrument_addresses: Vec::new(),
            last_connected_address: None,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_data_uuid() -> String {
    protocol::DATA_CHAR_UUID.to_string()
}
fn default_client_config_uuid() -> String {
    protocol::CLIENT_CONFIG_UUID.to_string()
}
fn default_scan_duration_ms() -> u64 {
    10_000
}
fn default_salinity() -> f32 {
    DEFAULT_SALINITY
}

impl Settings {
    /// Discovery parameters
    pub fn scan_config(&self) -> anyhow::Result<ScanConfig> {
        Ok(ScanConfig {
            duration: Duration::from_millis(self.scan_duration_ms),
            service_uuid: Some(parse_uuid(&self.ble_service_uuid)?),
        })
    }

    /// Per-instrument connection parameters
    pub fn connection_config(&self) -> anyhow::Result<ConnectionConfig> {
        Ok(ConnectionConfig {
            service_uuid: parse_uuid(&self.ble_service_uuid)?,
            data_char_uuid: parse_uuid(&self.ble_data_char_uuid)?,
            client_config_uuid: parse_uuid(&self.ble_client_config_uuid)?,
            high_priority: self.high_priority_connection,
            command_timeout: self.command_timeout_ms.map(Duration::from_millis),
            initial_salinity: self.default_salinity,
        })
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from (and save to) an explicit file
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("PhyterLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a successful connection
    pub fn remember_instrument(&mut self, address: &str) -> anyhow::Result<()> {
        if !self
            .settings
            .known_instrument_addresses
            .iter()
            .any(|a| a == address)
        {
            self.settings
                .known_instrument_addresses
                .push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("phyter_link_test_{}_{}", name, std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn test_defaults_match_protocol() {
        let settings = Settings::default();
        let connection = settings.connection_config().unwrap();
        assert_eq!(connection.service_uuid, protocol::SERVICE_UUID);
        assert_eq!(connection.data_char_uuid, protocol::DATA_CHAR_UUID);
        assert_eq!(connection.client_config_uuid, protocol::CLIENT_CONFIG_UUID);
        assert_eq!(connection.command_timeout, None);
        assert_eq!(connection.initial_salinity, 35.0);

        let scan = settings.scan_config().unwrap();
        assert_eq!(scan.duration, Duration::from_secs(10));
        assert_eq!(scan.service_uuid, Some(protocol::SERVICE_UUID));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "command_timeout_ms": 2500, "scan_duration_ms": 4000 }"#)
                .unwrap();
        assert_eq!(settings.command_timeout_ms, Some(2500));
        assert_eq!(settings.scan_duration_ms, 4000);
        assert_eq!(settings.default_salinity, DEFAULT_SALINITY);
        assert!(settings.high_priority_connection);
        assert_eq!(settings.log_settings.file_name_prefix, "phyter_link");
        assert_eq!(
            settings.connection_config().unwrap().command_timeout,
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        let settings = Settings {
            ble_service_uuid: "ffe0".to_string(),
            ..Settings::default()
        };
        assert!(settings.connection_config().is_err());
        assert!(settings.scan_config().is_err());
    }

    #[test]
    fn test_remember_instrument_persists() {
        let path = temp_settings_path("remember");
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::with_path(path.clone());
        service.remember_instrument("C4:64:E3:00:00:01").unwrap();
        service.remember_instrument("C4:64:E3:00:00:02").unwrap();
        service.remember_instrument("C4:64:E3:00:00:01").unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(
            reloaded.get().known_instrument_addresses,
            vec!["C4:64:E3:00:00:01", "C4:64:E3:00:00:02"]
        );
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("C4:64:E3:00:00:01")
        );

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_unreadable_file_falls_back_to_defaults() {
        let path = temp_settings_path("corrupt");
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::with_path(path.clone());
        assert_eq!(service.get().scan_duration_ms, 10_000);

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}
