//! BLE Transport Boundary
//!
//! Traits implemented by a radio stack so the instrument core can drive it.
//! Every call only *initiates* an operation; outcomes arrive later as events
//! on a [`GattEventSink`] or [`ScanEventSink`].
//!
//! Implementations must deliver events from their own callback context and
//! never synchronously from inside one of these calls. The state machine
//! holds its lock while calling into the transport.

use crate::error::TransportError;
use std::sync::Arc;
use uuid::Uuid;

pub use crate::infrastructure::bluetooth::connection::GattEventSink;
pub use crate::infrastructure::bluetooth::scanner::ScanEventSink;

/// Status code reported by successful GATT operations
pub const GATT_SUCCESS: i32 = 0;

/// A characteristic and the descriptors it exposes
#[derive(Debug, Clone, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// A discovered service
#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Callbacks delivered for one GATT connection
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged { connected: bool, status: i32 },
    ServicesDiscovered { status: i32, services: Vec<GattService> },
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        status: i32,
    },
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
}

/// Discovery restriction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    /// Only report devices advertising this service
    pub service_uuid: Option<Uuid>,
}

/// Radio adapter: discovery and connection establishment
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is present and switched on
    fn is_enabled(&self) -> bool;

    /// Begin discovery; sightings and failures arrive on `sink`
    fn start_scan(&self, filter: &ScanFilter, sink: ScanEventSink) -> Result<(), TransportError>;

    fn stop_scan(&self);

    /// Open a GATT connection to `address`; state changes arrive on `sink`
    fn connect(
        &self,
        address: &str,
        sink: GattEventSink,
    ) -> Result<Arc<dyn GattClient>, TransportError>;
}

/// One open GATT connection
pub trait GattClient: Send + Sync {
    /// Start service discovery; completes with [`GattEvent::ServicesDiscovered`]
    fn discover_services(&self) -> Result<(), TransportError>;

    /// Services already known for this connection (empty before discovery)
    fn services(&self) -> Vec<GattService>;

    fn request_high_priority(&self) -> Result<(), TransportError>;

    /// Enable or disable local delivery of notifications for a characteristic
    fn set_notification(&self, characteristic: Uuid, enable: bool) -> Result<(), TransportError>;

    /// Completes with [`GattEvent::DescriptorWritten`]
    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn write_characteristic(&self, characteristic: Uuid, value: &[u8])
        -> Result<(), TransportError>;

    fn disconnect(&self);

    /// Release the connection. No events are delivered afterwards.
    fn close(&self);
}
