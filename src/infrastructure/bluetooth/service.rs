//! Bluetooth Service Module
//!
//! Session-level coordinator: owns the radio adapter and the scanner and
//! keeps track of the instrument the user selected.

use crate::domain::models::ScannedInstrument;
use crate::domain::settings::Settings;
use crate::error::Result;
use crate::infrastructure::bluetooth::{
    connection::ConnectionConfig,
    instrument::Instrument,
    scanner::{ScanConfig, ScanStream, Scanner},
    transport::BleAdapter,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Main service coordinating discovery and the active instrument
pub struct InstrumentService {
    adapter: Arc<dyn BleAdapter>,
    scanner: Scanner,
    connection_config: ConnectionConfig,
    active: Mutex<Option<Arc<Instrument>>>,
}

impl InstrumentService {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        scan_config: ScanConfig,
        connection_config: ConnectionConfig,
    ) -> Self {
        Self {
            scanner: Scanner::new(adapter.clone(), scan_config),
            adapter,
            connection_config,
            active: Mutex::new(None),
        }
    }

    /// Build from persisted settings
    pub fn from_settings(adapter: Arc<dyn BleAdapter>, settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self::new(
            adapter,
            settings.scan_config()?,
            settings.connection_config()?,
        ))
    }

    /// Whether the radio is present and switched on
    pub fn is_enabled(&self) -> bool {
        self.adapter.is_enabled()
    }

    /// Start scanning, or join the scan already running
    pub fn scan(&self) -> Result<ScanStream> {
        self.scanner.scan()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Make `sighting` the active instrument. A previously active
    /// instrument is disconnected.
    pub fn select(&self, sighting: &ScannedInstrument) -> Arc<Instrument> {
        let instrument = Arc::new(Instrument::new(
            sighting,
            self.adapter.clone(),
            self.connection_config.clone(),
        ));
        let previous = self.active.lock().replace(instrument.clone());
        if let Some(previous) = previous {
            info!("Replacing active instrument {}", previous.address());
            previous.disconnect();
        }
        info!("Selected instrument {}", instrument);
        instrument
    }

    pub fn active(&self) -> Option<Arc<Instrument>> {
        self.active.lock().clone()
    }

    /// Disconnect and forget the active instrument
    pub fn release(&self) {
        let previous = self.active.lock().take();
        if let Some(instrument) = previous {
            info!("Releasing instrument {}", instrument.address());
            instrument.disconnect();
        }
    }
}

impl Drop for InstrumentService {
    fn drop(&mut self) {
        self.release();
    }
}
