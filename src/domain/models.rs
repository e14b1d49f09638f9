use serde::{Deserialize, Serialize};
use std::fmt;

/// Display name used when an instrument does not advertise one
pub const NAME_UNKNOWN: &str = "Unknown";

/// Salinity assumed until the instrument confirms a different value
pub const DEFAULT_SALINITY: f32 = 35.0;

/// One discovery sighting of an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedInstrument {
    /// Transport address, unique per radio stack
    pub address: String,
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i16,
}

impl ScannedInstrument {
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| NAME_UNKNOWN.to_string()),
            rssi,
        }
    }
}

/// Result of a two-part measurement exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub ph: f32,
    pub temperature: f32,
    pub a578: f32,
    pub a434: f32,
    pub dark: f32,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Measurement(ph={}, temp={}, a578={}, a434={}, dark={})",
            self.ph, self.temperature, self.a578, self.a434, self.dark
        )
    }
}

/// Connection lifecycle. `Ready` is the only state accepting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnecting,
}
