//! Instrument Facade
//!
//! High-level operations on one pHyter instrument, built on a
//! [`Connection`]. Each operation sends one command and resolves with the
//! correlated response.

use crate::domain::models::{ConnectionState, Measurement, ScannedInstrument};
use crate::error::{InstrumentError, Result};
use crate::infrastructure::bluetooth::connection::{Connection, ConnectionConfig, Reply};
use crate::infrastructure::bluetooth::protocol::CommandKind;
use crate::infrastructure::bluetooth::transport::BleAdapter;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// A selected instrument
pub struct Instrument {
    name: String,
    rssi: i16,
    connection: Connection,
}

impl Instrument {
    pub fn new(
        sighting: &ScannedInstrument,
        adapter: Arc<dyn BleAdapter>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            name: sighting.name.clone(),
            rssi: sighting.rssi,
            connection: Connection::new(sighting.address.clone(), adapter, config),
        }
    }

    pub fn address(&self) -> &str {
        self.connection.address()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal strength at the time of the sighting
    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Last salinity confirmed by the instrument
    pub fn salinity(&self) -> f32 {
        self.connection.salinity()
    }

    pub fn subscribe_salinity(&self) -> watch::Receiver<f32> {
        self.connection.subscribe_salinity()
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Set the sample salinity. Resolves with the value the instrument echoed.
    pub async fn set_salinity(&self, salinity: f32) -> Result<f32> {
        info!("Setting salinity to {}", salinity);
        match self
            .connection
            .request(CommandKind::SetSalinity, &[salinity])
            .await?
        {
            Reply::Salinity(confirmed) => Ok(confirmed),
            other => Err(unexpected(CommandKind::SetSalinity, other)),
        }
    }

    /// Take a background (blank) reading
    pub async fn background(&self) -> Result<()> {
        info!("Measuring background");
        self.acknowledged(CommandKind::Background).await
    }

    /// Take a sample measurement
    pub async fn measure(&self) -> Result<Measurement> {
        info!("Measuring sample");
        match self.connection.request(CommandKind::Measure, &[]).await? {
            Reply::Measurement(measurement) => {
                debug!("Measurement complete: {}", measurement);
                Ok(measurement)
            }
            other => Err(unexpected(CommandKind::Measure, other)),
        }
    }

    pub async fn led_intensity_check(&self) -> Result<()> {
        info!("Checking LED intensity");
        self.acknowledged(CommandKind::LedIntensityCheck).await
    }

    async fn acknowledged(&self, kind: CommandKind) -> Result<()> {
        match self.connection.request(kind, &[]).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(kind, other)),
        }
    }
}

fn unexpected(kind: CommandKind, reply: Reply) -> InstrumentError {
    InstrumentError::MalformedFrame(format!("unexpected reply to {:?}: {:?}", kind, reply))
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) rssi {} dBm, salinity {}",
            self.name,
            self.address(),
            self.rssi,
            self.salinity()
        )
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("address", &self.address())
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
