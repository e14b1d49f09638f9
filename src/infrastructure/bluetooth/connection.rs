//! BLE Connection Module
//!
//! Connection state machine for one instrument: opens the GATT link, locates
//! the serial service, enables notifications on the data characteristic and
//! correlates response frames with the commands waiting for them.
//!
//! ```text
//! Disconnected -> Connecting -> DiscoveringServices -> Ready -> Disconnecting -> Disconnected
//!       ^______________________________|___________________|
//!                     transport failure from any state
//! ```
//!
//! Public calls and transport callbacks serialize through one mutex per
//! connection. Callbacks enter through [`GattEventSink::deliver`].

use crate::domain::models::{ConnectionState, Measurement, DEFAULT_SALINITY};
use crate::error::{InstrumentError, Result};
use crate::infrastructure::bluetooth::correlator::{RequestCorrelator, Ticket};
use crate::infrastructure::bluetooth::protocol::{self, Command, CommandKind, Response};
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, GattClient, GattEvent, GattService, GATT_SUCCESS,
};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Data characteristic UUID
    pub data_char_uuid: Uuid,
    /// Client configuration descriptor on the data characteristic
    pub client_config_uuid: Uuid,
    /// Request a high priority connection once the service is found
    pub high_priority: bool,
    /// Give up waiting for a response after this long. `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// Salinity reported before the instrument confirms one
    pub initial_salinity: f32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            data_char_uuid: protocol::DATA_CHAR_UUID,
            client_config_uuid: protocol::CLIENT_CONFIG_UUID,
            high_priority: true,
            command_timeout: None,
            initial_salinity: DEFAULT_SALINITY,
        }
    }
}

/// Value a command resolves with
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Ack,
    Salinity(f32),
    Measurement(Measurement),
}

struct Inner {
    state: ConnectionState,
    /// Bumped whenever the transport handle is replaced or released
    generation: u64,
    client: Option<Arc<dyn GattClient>>,
    connect_tx: Option<oneshot::Sender<Result<()>>>,
    awaiting_descriptor: bool,
    correlator: RequestCorrelator<Reply>,
    /// pH and temperature from part 1 of an in-progress measurement
    partial: Option<(f32, f32)>,
}

struct Shared {
    address: String,
    adapter: Arc<dyn BleAdapter>,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    salinity_tx: watch::Sender<f32>,
}

/// Connection to a single instrument
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection handler. Nothing touches the radio until [`connect`](Self::connect).
    pub fn new(
        address: impl Into<String>,
        adapter: Arc<dyn BleAdapter>,
        config: ConnectionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (salinity_tx, _) = watch::channel(config.initial_salinity);
        Self {
            shared: Arc::new(Shared {
                address: address.into(),
                adapter,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    client: None,
                    connect_tx: None,
                    awaiting_descriptor: false,
                    correlator: RequestCorrelator::new(),
                    partial: None,
                }),
                state_tx,
                salinity_tx,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Last salinity confirmed by the instrument
    pub fn salinity(&self) -> f32 {
        *self.shared.salinity_tx.borrow()
    }

    /// Emits the last known salinity and every later salinity acknowledgement
    pub fn subscribe_salinity(&self) -> watch::Receiver<f32> {
        self.shared.salinity_tx.subscribe()
    }

    /// Connect to the instrument.
    ///
    /// Any previous link is torn down first. Resolves once the serial service
    /// is located and notifications on the data characteristic are enabled.
    pub async fn connect(&self) -> Result<()> {
        self.disconnect();

        let rx = {
            let mut inner = self.shared.inner.lock();
            if !self.shared.adapter.is_enabled() {
                warn!("Cannot connect, bluetooth adapter unavailable");
                return Err(InstrumentError::TransportUnavailable);
            }

            inner.generation += 1;
            let sink = GattEventSink {
                shared: Arc::downgrade(&self.shared),
                generation: inner.generation,
            };
            let (tx, rx) = oneshot::channel();
            inner.connect_tx = Some(tx);
            self.shared.set_state(&mut inner, ConnectionState::Connecting);

            info!(address = %self.shared.address, "Connecting to instrument");
            match self.shared.adapter.connect(&self.shared.address, sink) {
                Ok(client) => inner.client = Some(client),
                Err(e) => {
                    error!(address = %self.shared.address, "Failed to open GATT connection: {}", e);
                    let err = InstrumentError::from(e);
                    self.shared.teardown(&mut inner, err.clone());
                    return Err(err);
                }
            }
            rx
        };

        rx.await.unwrap_or(Err(InstrumentError::ConnectionLost))
    }

    /// Disconnect from the instrument. Idempotent.
    ///
    /// Every pending request fails with [`InstrumentError::ConnectionLost`].
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.client.is_some() {
            info!(address = %self.shared.address, "Disconnecting gatt");
            self.shared
                .set_state(&mut inner, ConnectionState::Disconnecting);
        }
        self.shared
            .teardown(&mut inner, InstrumentError::ConnectionLost);
    }

    /// Write a command and register for its response.
    ///
    /// Fails immediately with [`InstrumentError::NotConnected`] outside
    /// `Ready` and with [`InstrumentError::RequestAlreadyInFlight`] if a
    /// request of the same kind is outstanding.
    pub fn send_command(&self, kind: CommandKind, args: &[f32]) -> Result<CommandHandle> {
        let command = Command::from_parts(kind, args)?;

        let mut inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Ready {
            warn!("Cannot send {:?}, not connected", kind);
            return Err(InstrumentError::NotConnected);
        }
        let client = inner.client.clone().ok_or(InstrumentError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        let ticket = inner.correlator.register(kind, tx)?;
        if kind == CommandKind::Measure {
            inner.partial = None;
        }

        let bytes = command.encode();
        if let Err(e) = client.write_characteristic(self.shared.config.data_char_uuid, &bytes) {
            error!("Failed to write {:?} command: {}", kind, e);
            self.shared
                .teardown(&mut inner, InstrumentError::ConnectionLost);
            return Err(InstrumentError::ConnectionLost);
        }
        debug!("Wrote {:?} command ({} bytes)", kind, bytes.len());

        Ok(CommandHandle {
            kind,
            ticket,
            rx,
            shared: Arc::downgrade(&self.shared),
            finished: false,
            cancelled: false,
        })
    }

    /// Send a command and wait for its reply, honouring the configured timeout
    pub async fn request(&self, kind: CommandKind, args: &[f32]) -> Result<Reply> {
        let handle = self.send_command(kind, args)?;
        match self.shared.config.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!("No {:?} response within {:?}", kind, limit);
                    Err(InstrumentError::Timeout)
                }
            },
            None => handle.await,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!(address = %self.address, "Connection state {:?} -> {:?}", inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Release the transport and fail everything waiting on it
    fn teardown(&self, inner: &mut Inner, error: InstrumentError) {
        inner.generation += 1;
        if let Some(client) = inner.client.take() {
            client.disconnect();
            client.close();
        }
        if let Some(tx) = inner.connect_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
        inner.awaiting_descriptor = false;
        inner.partial = None;
        let failed = inner.correlator.fail_all(error);
        if failed > 0 {
            info!("Failed {} pending request(s) on disconnect", failed);
        }
        self.set_state(inner, ConnectionState::Disconnected);
    }

    fn complete_connect(&self, inner: &mut Inner) {
        self.set_state(inner, ConnectionState::Ready);
        info!(address = %self.address, "Instrument ready");
        if let Some(tx) = inner.connect_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn handle_event(&self, generation: u64, event: GattEvent) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            trace!("Ignoring event from superseded connection: {:?}", event);
            return;
        }

        match event {
            GattEvent::ConnectionStateChanged {
                connected: true,
                status,
            } => {
                debug!("gatt connected (status {})", status);
                self.on_link_up(&mut inner);
            }
            GattEvent::ConnectionStateChanged {
                connected: false,
                status,
            } => {
                info!(address = %self.address, "gatt disconnected (status {})", status);
                self.teardown(&mut inner, InstrumentError::ConnectionLost);
            }
            GattEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(&mut inner, status, &services);
            }
            GattEvent::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            } => {
                self.on_descriptor_written(&mut inner, characteristic, descriptor, status);
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                if characteristic == self.config.data_char_uuid {
                    self.on_notification(&mut inner, &value);
                } else {
                    trace!("Ignoring notification from {}", characteristic);
                }
            }
        }
    }

    fn find_service<'a>(&self, services: &'a [GattService]) -> Option<&'a GattService> {
        services.iter().find(|s| s.uuid == self.config.service_uuid)
    }

    fn on_link_up(&self, inner: &mut Inner) {
        if inner.state != ConnectionState::Connecting {
            debug!("Link up while {:?}, ignoring", inner.state);
            return;
        }
        let Some(client) = inner.client.clone() else {
            return;
        };
        self.set_state(inner, ConnectionState::DiscoveringServices);

        let known = client.services();
        if let Some(service) = self.find_service(&known) {
            debug!("Service already known, skipping discovery");
            self.configure(inner, client.as_ref(), service);
            return;
        }

        if let Err(e) = client.discover_services() {
            error!("Failed to start service discovery: {}", e);
            self.teardown(inner, InstrumentError::DiscoveryFailed(e.to_string()));
        }
    }

    fn on_services_discovered(&self, inner: &mut Inner, status: i32, services: &[GattService]) {
        if inner.state != ConnectionState::DiscoveringServices || inner.awaiting_descriptor {
            debug!("Unexpected service discovery result, ignoring");
            return;
        }
        if status == GATT_SUCCESS {
            trace!("Successfully discovered services");
        } else {
            warn!("Unknown service discovery status {}", status);
        }
        debug!(
            "Inspecting services: {:?}",
            services.iter().map(|s| s.uuid).collect::<Vec<_>>()
        );

        let Some(client) = inner.client.clone() else {
            return;
        };
        match self.find_service(services) {
            Some(service) => self.configure(inner, client.as_ref(), service),
            None => {
                error!(address = %self.address, "Instrument service not found");
                self.teardown(inner, InstrumentError::ServiceNotFound);
            }
        }
    }

    /// Per-service setup: priority, then local and remote notification
    fn configure(&self, inner: &mut Inner, client: &dyn GattClient, service: &GattService) {
        info!("Found instrument service");

        if self.config.high_priority {
            trace!("Requesting high priority connection");
            if let Err(e) = client.request_high_priority() {
                warn!("Error requesting high priority connection: {}", e);
            }
        }

        let data_uuid = self.config.data_char_uuid;
        let Some(characteristic) = service.characteristic(data_uuid) else {
            error!("Data characteristic not found");
            self.teardown(inner, InstrumentError::ServiceNotFound);
            return;
        };

        trace!("Enabling local data notifications");
        if let Err(e) = client.set_notification(data_uuid, true) {
            self.teardown(inner, InstrumentError::DiscoveryFailed(e.to_string()));
            return;
        }

        let cccd = self.config.client_config_uuid;
        if !characteristic.descriptors.contains(&cccd) {
            warn!("Data characteristic has no client configuration descriptor");
            self.complete_connect(inner);
            return;
        }

        trace!("Enabling remote data notifications");
        match client.write_descriptor(data_uuid, cccd, &protocol::ENABLE_NOTIFICATION_VALUE) {
            Ok(()) => inner.awaiting_descriptor = true,
            Err(e) => {
                error!("Failed to write client configuration: {}", e);
                self.teardown(inner, InstrumentError::DiscoveryFailed(e.to_string()));
            }
        }
    }

    fn on_descriptor_written(
        &self,
        inner: &mut Inner,
        characteristic: Uuid,
        descriptor: Uuid,
        status: i32,
    ) {
        if !inner.awaiting_descriptor
            || characteristic != self.config.data_char_uuid
            || descriptor != self.config.client_config_uuid
        {
            trace!("Ignoring descriptor write for {}/{}", characteristic, descriptor);
            return;
        }
        inner.awaiting_descriptor = false;

        if status == GATT_SUCCESS {
            self.complete_connect(inner);
        } else {
            error!("Enabling notifications failed with status {}", status);
            self.teardown(
                inner,
                InstrumentError::DiscoveryFailed(format!(
                    "notification setup failed with status {status}"
                )),
            );
        }
    }

    fn on_notification(&self, inner: &mut Inner, value: &[u8]) {
        trace!("Parsing {} bytes", value.len());
        let Some(response) = Response::decode(value) else {
            let err = InstrumentError::MalformedFrame(format!("{:02X?}", value));
            warn!("Dropping frame: {}", err);
            return;
        };

        match response {
            Response::SalinitySet(salinity) => {
                debug!("Salinity response: {}", salinity);
                self.salinity_tx.send_replace(salinity);
                inner
                    .correlator
                    .resolve(CommandKind::SetSalinity, Reply::Salinity(salinity));
            }
            Response::BackgroundComplete => {
                debug!("Background response");
                inner.correlator.resolve(CommandKind::Background, Reply::Ack);
            }
            Response::MeasurePart1 { ph, temperature } => {
                if !inner.correlator.is_pending(CommandKind::Measure) {
                    debug!("Measurement part 1 with no pending measure, dropping");
                    return;
                }
                if inner.partial.replace((ph, temperature)).is_some() {
                    debug!("Repeated measurement part 1, replacing");
                }
            }
            Response::MeasurePart2 { a578, a434, dark } => {
                let Some((ph, temperature)) = inner.partial.take() else {
                    debug!("Measurement part 2 without part 1, dropping");
                    return;
                };
                let measurement = Measurement {
                    ph,
                    temperature,
                    a578,
                    a434,
                    dark,
                };
                debug!("Measure response: {}", measurement);
                inner
                    .correlator
                    .resolve(CommandKind::Measure, Reply::Measurement(measurement));
            }
            Response::LedIntensityCheck => {
                debug!("LED intensity check response");
                inner
                    .correlator
                    .resolve(CommandKind::LedIntensityCheck, Reply::Ack);
            }
            Response::Error => {
                warn!(address = %self.address, "Instrument reported an error");
                inner.partial = None;
                inner.correlator.fail_all(InstrumentError::Rejected);
            }
        }
    }
}

/// Entry point for transport callbacks of one GATT connection.
///
/// Holds only a weak reference; events for a dropped connection or a
/// superseded link are ignored.
#[derive(Clone)]
pub struct GattEventSink {
    shared: Weak<Shared>,
    generation: u64,
}

impl GattEventSink {
    pub fn deliver(&self, event: GattEvent) {
        match self.shared.upgrade() {
            Some(shared) => shared.handle_event(self.generation, event),
            None => trace!("Connection released, dropping {:?}", event),
        }
    }

    /// Whether the owning connection is still alive
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl fmt::Debug for GattEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattEventSink")
            .field("generation", &self.generation)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Pending command. Resolves with the correlated reply.
///
/// Cancelling (or dropping) it releases the request slot; a response that
/// arrives afterwards is dropped.
#[must_use = "a command handle does nothing unless awaited"]
pub struct CommandHandle {
    kind: CommandKind,
    ticket: Ticket,
    rx: oneshot::Receiver<Result<Reply>>,
    shared: Weak<Shared>,
    finished: bool,
    cancelled: bool,
}

impl CommandHandle {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Stop waiting. The radio write cannot be recalled; the handle resolves
    /// with [`InstrumentError::Cancelled`].
    pub fn cancel(&mut self) {
        if self.finished || self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(shared) = self.shared.upgrade() {
            if shared.inner.lock().correlator.cancel(self.kind, self.ticket) {
                debug!("Cancelled pending {:?} request", self.kind);
            }
        }
    }
}

impl Future for CommandHandle {
    type Output = Result<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cancelled {
            this.finished = true;
            return Poll::Ready(Err(InstrumentError::Cancelled));
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or(Err(InstrumentError::ConnectionLost)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulator::{
        GattFault, SimulatedAdapter, SimulatedInstrument,
    };

    const ADDRESS: &str = "C4:64:E3:00:00:01";

    fn setup() -> (Arc<SimulatedAdapter>, Connection) {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(SimulatedInstrument::new(ADDRESS, Some("pHyter 1".into())));
        adapter.set_auto_respond(false);
        let connection = Connection::new(ADDRESS, adapter.clone(), ConnectionConfig::default());
        (adapter, connection)
    }

    fn part1(ph: f32, temperature: f32) -> Vec<u8> {
        Response::MeasurePart1 { ph, temperature }.encode()
    }

    fn part2(a578: f32, a434: f32, dark: f32) -> Vec<u8> {
        Response::MeasurePart2 { a578, a434, dark }.encode()
    }

    #[tokio::test]
    async fn test_connect_enables_notifications() {
        let (adapter, connection) = setup();
        let mut states = connection.subscribe_state();

        connection.connect().await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        assert!(adapter.notifications_enabled(ADDRESS));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_connect_without_service() {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(SimulatedInstrument::new(ADDRESS, None).without_service());
        let connection = Connection::new(ADDRESS, adapter.clone(), ConnectionConfig::default());

        assert_eq!(
            connection.connect().await,
            Err(InstrumentError::ServiceNotFound)
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    async fn connect_with(
        instrument: SimulatedInstrument,
    ) -> (Arc<SimulatedAdapter>, Connection, Result<()>) {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(instrument);
        let connection = Connection::new(ADDRESS, adapter.clone(), ConnectionConfig::default());
        let result = connection.connect().await;
        (adapter, connection, result)
    }

    #[tokio::test]
    async fn test_connect_discovery_refused() {
        let (adapter, connection, result) =
            connect_with(SimulatedInstrument::new(ADDRESS, None).with_fault(GattFault::Discovery))
                .await;

        assert!(matches!(result, Err(InstrumentError::DiscoveryFailed(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!adapter.is_connected(ADDRESS));
    }

    #[tokio::test]
    async fn test_connect_notification_refused() {
        let (_adapter, connection, result) = connect_with(
            SimulatedInstrument::new(ADDRESS, None).with_fault(GattFault::Notification),
        )
        .await;

        assert!(matches!(result, Err(InstrumentError::DiscoveryFailed(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_descriptor_write_refused() {
        let (_adapter, connection, result) = connect_with(
            SimulatedInstrument::new(ADDRESS, None).with_fault(GattFault::DescriptorWrite),
        )
        .await;

        assert!(matches!(result, Err(InstrumentError::DiscoveryFailed(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_descriptor_status_failure() {
        // GATT_INSUFFICIENT_AUTHENTICATION
        let (adapter, connection, result) =
            connect_with(SimulatedInstrument::new(ADDRESS, None).with_descriptor_status(5)).await;

        match result {
            Err(InstrumentError::DiscoveryFailed(reason)) => assert!(reason.contains('5')),
            other => panic!("expected DiscoveryFailed, got {:?}", other),
        }
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!adapter.notifications_enabled(ADDRESS));
    }

    #[tokio::test]
    async fn test_connect_with_cached_services_skips_discovery() {
        let (adapter, connection, result) = connect_with(
            SimulatedInstrument::new(ADDRESS, None)
                .with_cached_services()
                .with_fault(GattFault::Discovery),
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(adapter.discovery_count(), 0);
        assert!(adapter.notifications_enabled(ADDRESS));
    }

    #[tokio::test]
    async fn test_connect_runs_discovery_once() {
        let (adapter, _connection, result) =
            connect_with(SimulatedInstrument::new(ADDRESS, None)).await;
        assert_eq!(result, Ok(()));
        assert_eq!(adapter.discovery_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_client_config() {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(SimulatedInstrument::new(ADDRESS, None).without_client_config());
        let connection = Connection::new(ADDRESS, adapter.clone(), ConnectionConfig::default());

        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
        // Only local delivery was switched on
        assert!(!adapter.notifications_enabled(ADDRESS));
    }

    #[tokio::test]
    async fn test_connect_link_drops_before_setup() {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(SimulatedInstrument::new(ADDRESS, None).unreachable());
        let connection = Connection::new(ADDRESS, adapter.clone(), ConnectionConfig::default());

        assert_eq!(
            connection.connect().await,
            Err(InstrumentError::ConnectionLost)
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_with_adapter_disabled() {
        let (adapter, connection) = setup();
        adapter.set_enabled(false);
        assert_eq!(
            connection.connect().await,
            Err(InstrumentError::TransportUnavailable)
        );
    }

    #[tokio::test]
    async fn test_command_requires_ready() {
        let (_adapter, connection) = setup();
        assert!(matches!(
            connection.send_command(CommandKind::Background, &[]),
            Err(InstrumentError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_command_frame_written() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let handle = connection
            .send_command(CommandKind::SetSalinity, &[35.0])
            .unwrap();
        assert_eq!(handle.kind(), CommandKind::SetSalinity);
        assert_eq!(
            adapter.written_frames(ADDRESS),
            vec![vec![0x01, 0x00, 0x00, 0x0C, 0x42]]
        );
    }

    #[tokio::test]
    async fn test_second_measure_rejected() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let first = connection.send_command(CommandKind::Measure, &[]).unwrap();
        assert!(matches!(
            connection.send_command(CommandKind::Measure, &[]),
            Err(InstrumentError::RequestAlreadyInFlight(CommandKind::Measure))
        ));
        // Only the first command reached the radio
        assert_eq!(adapter.written_frames(ADDRESS).len(), 1);

        adapter.inject_notification(ADDRESS, part1(7.0, 25.0));
        adapter.inject_notification(ADDRESS, part2(0.5, 0.3, 0.01));

        assert_eq!(
            first.await,
            Ok(Reply::Measurement(Measurement {
                ph: 7.0,
                temperature: 25.0,
                a578: 0.5,
                a434: 0.3,
                dark: 0.01,
            }))
        );
    }

    #[tokio::test]
    async fn test_part2_without_part1_is_dropped() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let mut handle = connection.send_command(CommandKind::Measure, &[]).unwrap();
        adapter.inject_notification(ADDRESS, part2(0.5, 0.3, 0.01));
        adapter.settle().await;

        assert!(still_pending(&mut handle).await);

        adapter.inject_notification(ADDRESS, part1(8.1, 20.0));
        adapter.inject_notification(ADDRESS, part2(0.4, 0.2, 0.02));
        let reply = handle.await.unwrap();
        assert_eq!(
            reply,
            Reply::Measurement(Measurement {
                ph: 8.1,
                temperature: 20.0,
                a578: 0.4,
                a434: 0.2,
                dark: 0.02,
            })
        );
    }

    #[tokio::test]
    async fn test_disconnect_between_parts_discards_partial() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let handle = connection.send_command(CommandKind::Measure, &[]).unwrap();
        adapter.inject_notification(ADDRESS, part1(7.0, 25.0));
        adapter.settle().await;
        adapter.drop_link(ADDRESS);
        assert_eq!(handle.await, Err(InstrumentError::ConnectionLost));

        connection.connect().await.unwrap();
        let mut handle = connection.send_command(CommandKind::Measure, &[]).unwrap();
        adapter.inject_notification(ADDRESS, part2(0.5, 0.3, 0.01));
        adapter.settle().await;
        assert!(still_pending(&mut handle).await);
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_pending() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let salinity = connection
            .send_command(CommandKind::SetSalinity, &[33.0])
            .unwrap();
        let background = connection
            .send_command(CommandKind::Background, &[])
            .unwrap();

        connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(salinity.await, Err(InstrumentError::ConnectionLost));
        assert_eq!(background.await, Err(InstrumentError::ConnectionLost));
        assert_eq!(adapter.written_frames(ADDRESS).len(), 2);

        // Disconnect is idempotent
        connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_events_from_superseded_link_ignored() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        // Queued on the first link, delivered only after the reconnect started
        adapter.inject_notification(ADDRESS, Response::SalinitySet(33.0).encode());
        connection.disconnect();
        connection.connect().await.unwrap();

        let mut handle = connection
            .send_command(CommandKind::SetSalinity, &[31.0])
            .unwrap();
        adapter.settle().await;

        assert_eq!(connection.salinity(), DEFAULT_SALINITY);
        assert!(still_pending(&mut handle).await);
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_write_failure_tears_down() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let salinity = connection
            .send_command(CommandKind::SetSalinity, &[33.0])
            .unwrap();
        // The link is gone before its loss has been reported
        adapter.drop_link(ADDRESS);

        assert!(matches!(
            connection.send_command(CommandKind::Background, &[]),
            Err(InstrumentError::ConnectionLost)
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(salinity.await, Err(InstrumentError::ConnectionLost));

        // The late link-loss callback changes nothing
        adapter.settle().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_break_connection() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let handle = connection
            .send_command(CommandKind::Background, &[])
            .unwrap();
        adapter.inject_notification(ADDRESS, vec![0x82, 0x01]);
        adapter.inject_notification(ADDRESS, vec![0x42]);
        adapter.inject_notification(ADDRESS, Vec::new());
        adapter.inject_notification(ADDRESS, Response::BackgroundComplete.encode());

        assert_eq!(handle.await, Ok(Reply::Ack));
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_salinity_updates_are_broadcast() {
        let (adapter, connection) = setup();
        let mut salinity = connection.subscribe_salinity();
        assert_eq!(*salinity.borrow(), DEFAULT_SALINITY);
        connection.connect().await.unwrap();

        // Unsolicited acknowledgement still updates the observable value
        adapter.inject_notification(ADDRESS, Response::SalinitySet(30.5).encode());
        salinity.changed().await.unwrap();
        assert_eq!(*salinity.borrow_and_update(), 30.5);
        assert_eq!(connection.salinity(), 30.5);
    }

    #[tokio::test]
    async fn test_cancelled_request_ignores_late_response() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let mut handle = connection
            .send_command(CommandKind::Background, &[])
            .unwrap();
        handle.cancel();
        assert_eq!(handle.await, Err(InstrumentError::Cancelled));

        let next = connection
            .send_command(CommandKind::Background, &[])
            .unwrap();
        adapter.inject_notification(ADDRESS, Response::BackgroundComplete.encode());
        assert_eq!(next.await, Ok(Reply::Ack));
    }

    #[tokio::test]
    async fn test_request_timeout_releases_slot() {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(SimulatedInstrument::new(ADDRESS, None));
        adapter.set_auto_respond(false);
        let config = ConnectionConfig {
            command_timeout: Some(Duration::from_millis(20)),
            ..ConnectionConfig::default()
        };
        let connection = Connection::new(ADDRESS, adapter.clone(), config);
        assert_eq!(
            connection.config().command_timeout,
            Some(Duration::from_millis(20))
        );
        connection.connect().await.unwrap();

        assert_eq!(
            connection.request(CommandKind::LedIntensityCheck, &[]).await,
            Err(InstrumentError::Timeout)
        );
        // The slot is free again
        let handle = connection
            .send_command(CommandKind::LedIntensityCheck, &[])
            .unwrap();
        adapter.inject_notification(ADDRESS, Response::LedIntensityCheck.encode());
        assert_eq!(handle.await, Ok(Reply::Ack));
    }

    #[tokio::test]
    async fn test_error_frame_rejects_pending() {
        let (adapter, connection) = setup();
        connection.connect().await.unwrap();

        let handle = connection.send_command(CommandKind::Measure, &[]).unwrap();
        adapter.inject_notification(ADDRESS, Response::Error.encode());
        assert_eq!(handle.await, Err(InstrumentError::Rejected));
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_round_trip_with_responder() {
        let (adapter, connection) = setup();
        adapter.set_auto_respond(true);
        connection.connect().await.unwrap();

        assert_eq!(
            connection.request(CommandKind::SetSalinity, &[31.0]).await,
            Ok(Reply::Salinity(31.0))
        );
        assert_eq!(connection.salinity(), 31.0);
        assert!(matches!(
            connection.request(CommandKind::Measure, &[]).await,
            Ok(Reply::Measurement(_))
        ));
    }

    /// True if the handle is still unresolved after a short wait
    async fn still_pending(handle: &mut CommandHandle) -> bool {
        tokio::time::timeout(Duration::from_millis(20), handle)
            .await
            .is_err()
    }
}
