//! Simulated Radio
//!
//! In-process implementation of the transport traits with a peer-side
//! instrument responder. Used by the tests and the demo binary.
//!
//! Every callback is queued and delivered from a single pump task in the
//! order it was produced, never from inside a transport call.

use crate::domain::models::Measurement;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{self, Command, Response};
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, GattCharacteristic, GattClient, GattEvent, GattEventSink, GattService,
    ScanEventSink, ScanFilter, GATT_SUCCESS,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Status reported when the simulated link drops (connection timeout)
const LINK_LOST_STATUS: i32 = 8;

/// GATT operation a simulated instrument refuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattFault {
    /// Service discovery cannot be started
    Discovery,
    /// Local notification delivery cannot be enabled
    Notification,
    /// The client configuration write cannot be issued
    DescriptorWrite,
}

/// A peer device known to the simulated radio
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    /// Advertises and exposes the serial service
    pub exposes_service: bool,
    /// Data characteristic carries a client configuration descriptor
    pub has_client_config: bool,
    /// Link comes up when connecting
    pub reachable: bool,
    /// Values returned for a measurement
    pub reading: Measurement,
    /// Services are reported as soon as the link is up, without discovery
    pub cached_services: bool,
    /// Status reported for the client configuration write
    pub descriptor_status: i32,
    pub fault: Option<GattFault>,
}

impl SimulatedInstrument {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
            rssi: -60,
            exposes_service: true,
            has_client_config: true,
            reachable: true,
            reading: Measurement {
                ph: 7.95,
                temperature: 21.4,
                a578: 0.512,
                a434: 0.348,
                dark: 0.012,
            },
            cached_services: false,
            descriptor_status: GATT_SUCCESS,
            fault: None,
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn without_service(mut self) -> Self {
        self.exposes_service = false;
        self
    }

    pub fn without_client_config(mut self) -> Self {
        self.has_client_config = false;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn with_reading(mut self, reading: Measurement) -> Self {
        self.reading = reading;
        self
    }

    /// Report services at link-up, as a stack with a warm GATT cache does
    pub fn with_cached_services(mut self) -> Self {
        self.cached_services = true;
        self
    }

    pub fn with_descriptor_status(mut self, status: i32) -> Self {
        self.descriptor_status = status;
        self
    }

    pub fn with_fault(mut self, fault: GattFault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn refuses(&self, fault: GattFault) -> Result<(), TransportError> {
        if self.fault == Some(fault) {
            return Err(TransportError::OperationFailed(format!("{:?} refused", fault)));
        }
        Ok(())
    }

    fn advertises(&self, filter: &ScanFilter) -> bool {
        match filter.service_uuid {
            None => true,
            Some(uuid) => self.exposes_service && uuid == protocol::SERVICE_UUID,
        }
    }

    fn services(&self) -> Vec<GattService> {
        let generic_access = GattService {
            uuid: Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb),
            characteristics: Vec::new(),
        };
        if !self.exposes_service {
            return vec![generic_access];
        }
        let descriptors = if self.has_client_config {
            vec![protocol::CLIENT_CONFIG_UUID]
        } else {
            Vec::new()
        };
        vec![
            generic_access,
            GattService {
                uuid: protocol::SERVICE_UUID,
                characteristics: vec![GattCharacteristic {
                    uuid: protocol::DATA_CHAR_UUID,
                    descriptors,
                }],
            },
        ]
    }
}

/// Peer side of the protocol: answers command frames like the instrument firmware
#[derive(Debug, Clone)]
pub struct InstrumentResponder {
    pub salinity: f32,
    pub reading: Measurement,
}

impl InstrumentResponder {
    pub fn new(reading: Measurement) -> Self {
        Self {
            salinity: crate::domain::models::DEFAULT_SALINITY,
            reading,
        }
    }

    /// Responses for one written frame, in delivery order
    pub fn handle(&mut self, frame: &[u8]) -> Vec<Response> {
        let Some(command) = Command::decode(frame) else {
            warn!("Responder ignoring unknown command {:02X?}", frame);
            return Vec::new();
        };
        match command {
            Command::SetSalinity(salinity) => {
                self.salinity = salinity;
                vec![Response::SalinitySet(salinity)]
            }
            Command::Background => vec![Response::BackgroundComplete],
            Command::Measure => vec![
                Response::MeasurePart1 {
                    ph: self.reading.ph,
                    temperature: self.reading.temperature,
                },
                Response::MeasurePart2 {
                    a578: self.reading.a578,
                    a434: self.reading.a434,
                    dark: self.reading.dark,
                },
            ],
            Command::LedIntensityCheck => vec![Response::LedIntensityCheck],
        }
    }
}

enum Delivery {
    Gatt(GattEventSink, GattEvent),
    Sighting(ScanEventSink, String, Option<String>, i16),
    ScanFailed(ScanEventSink, i32),
    Flush(oneshot::Sender<()>),
}

struct Link {
    id: u64,
    sink: GattEventSink,
    discovered: bool,
    local_notify: bool,
    remote_notify: bool,
    responder: InstrumentResponder,
    written: Vec<Vec<u8>>,
}

struct ActiveScan {
    filter: ScanFilter,
    sink: ScanEventSink,
}

struct SimState {
    enabled: bool,
    auto_respond: bool,
    part_delay: Duration,
    instruments: Vec<SimulatedInstrument>,
    links: HashMap<String, Link>,
    /// Frames written over links that are gone, kept for inspection
    history: HashMap<String, Vec<Vec<u8>>>,
    next_link: u64,
    scan: Option<ActiveScan>,
    scan_starts: usize,
    scan_stops: usize,
    discoveries: usize,
}

struct SimShared {
    state: Mutex<SimState>,
    queue: mpsc::UnboundedSender<Delivery>,
    /// Responses waiting out the part delay
    delayed: AtomicUsize,
}

impl SimShared {
    fn push(&self, delivery: Delivery) {
        if self.queue.send(delivery).is_err() {
            trace!("Simulator pump stopped, dropping callback");
        }
    }

    fn close_link(state: &mut SimState, address: &str) -> Option<Link> {
        let link = state.links.remove(address)?;
        state
            .history
            .entry(address.to_string())
            .or_default()
            .extend(link.written.iter().cloned());
        Some(link)
    }
}

/// In-process radio adapter
pub struct SimulatedAdapter {
    shared: Arc<SimShared>,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    /// Create an enabled adapter with auto-responding instruments.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Gatt(sink, event) => sink.deliver(event),
                    Delivery::Sighting(sink, address, name, rssi) => {
                        sink.on_result(&address, name, rssi)
                    }
                    Delivery::ScanFailed(sink, code) => sink.on_failure(code),
                    Delivery::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState {
                    enabled: true,
                    auto_respond: true,
                    part_delay: Duration::ZERO,
                    instruments: Vec::new(),
                    links: HashMap::new(),
                    history: HashMap::new(),
                    next_link: 0,
                    scan: None,
                    scan_starts: 0,
                    scan_stops: 0,
                    discoveries: 0,
                }),
                queue,
                delayed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn add_instrument(&self, instrument: SimulatedInstrument) {
        let mut state = self.shared.state.lock();
        state.instruments.retain(|i| i.address != instrument.address);
        state.instruments.push(instrument);
    }

    /// Switch the radio on or off. Switching off drops every open link.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        state.enabled = enabled;
        if enabled {
            return;
        }
        state.scan = None;
        let addresses: Vec<String> = state.links.keys().cloned().collect();
        for address in addresses {
            if let Some(link) = SimShared::close_link(&mut state, &address) {
                self.shared.push(Delivery::Gatt(
                    link.sink,
                    GattEvent::ConnectionStateChanged {
                        connected: false,
                        status: LINK_LOST_STATUS,
                    },
                ));
            }
        }
    }

    /// Answer written commands through the peer responder
    pub fn set_auto_respond(&self, auto_respond: bool) {
        self.shared.state.lock().auto_respond = auto_respond;
    }

    /// Delay before each response frame of an answered command
    pub fn set_part_delay(&self, delay: Duration) {
        self.shared.state.lock().part_delay = delay;
    }

    /// Change signal strength; an active scan reports the device again
    pub fn set_rssi(&self, address: &str, rssi: i16) {
        let mut state = self.shared.state.lock();
        let Some(instrument) = state.instruments.iter_mut().find(|i| i.address == address) else {
            return;
        };
        instrument.rssi = rssi;
        let instrument = instrument.clone();
        if let Some(scan) = state.scan.as_ref() {
            if instrument.advertises(&scan.filter) {
                self.shared.push(Delivery::Sighting(
                    scan.sink.clone(),
                    instrument.address,
                    instrument.name,
                    instrument.rssi,
                ));
            }
        }
    }

    /// Push a raw frame from the instrument over the open link
    pub fn inject_notification(&self, address: &str, value: Vec<u8>) {
        let state = self.shared.state.lock();
        match state.links.get(address) {
            Some(link) if link.local_notify && link.remote_notify => {
                self.shared.push(Delivery::Gatt(
                    link.sink.clone(),
                    GattEvent::CharacteristicChanged {
                        characteristic: protocol::DATA_CHAR_UUID,
                        value,
                    },
                ));
            }
            _ => debug!(address, "No notifying link, dropping injected frame"),
        }
    }

    /// Drop the link from the instrument side
    pub fn drop_link(&self, address: &str) {
        let mut state = self.shared.state.lock();
        if let Some(link) = SimShared::close_link(&mut state, address) {
            debug!(address, "Simulated link lost");
            self.shared.push(Delivery::Gatt(
                link.sink,
                GattEvent::ConnectionStateChanged {
                    connected: false,
                    status: LINK_LOST_STATUS,
                },
            ));
        }
    }

    /// Abort the active scan with a radio failure code
    pub fn fail_scan(&self, code: i32) {
        let mut state = self.shared.state.lock();
        if let Some(scan) = state.scan.take() {
            self.shared.push(Delivery::ScanFailed(scan.sink, code));
        }
    }

    /// Every frame written to `address`, oldest first
    pub fn written_frames(&self, address: &str) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock();
        let mut frames = state.history.get(address).cloned().unwrap_or_default();
        if let Some(link) = state.links.get(address) {
            frames.extend(link.written.iter().cloned());
        }
        frames
    }

    /// Both local and remote notification are on for the open link
    pub fn notifications_enabled(&self, address: &str) -> bool {
        self.shared
            .state
            .lock()
            .links
            .get(address)
            .is_some_and(|link| link.local_notify && link.remote_notify)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.shared.state.lock().links.contains_key(address)
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.state.lock().scan.is_some()
    }

    pub fn scan_start_count(&self) -> usize {
        self.shared.state.lock().scan_starts
    }

    pub fn scan_stop_count(&self) -> usize {
        self.shared.state.lock().scan_stops
    }

    /// Service discoveries started over any link
    pub fn discovery_count(&self) -> usize {
        self.shared.state.lock().discoveries
    }

    /// Wait until every callback queued so far has been delivered
    pub async fn settle(&self) {
        while self.shared.delayed.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let (tx, rx) = oneshot::channel();
        self.shared.push(Delivery::Flush(tx));
        let _ = rx.await;
    }
}

impl BleAdapter for SimulatedAdapter {
    fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    fn start_scan(&self, filter: &ScanFilter, sink: ScanEventSink) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.enabled {
            return Err(TransportError::Unavailable);
        }
        state.scan_starts += 1;
        for instrument in state.instruments.iter().filter(|i| i.advertises(filter)) {
            self.shared.push(Delivery::Sighting(
                sink.clone(),
                instrument.address.clone(),
                instrument.name.clone(),
                instrument.rssi,
            ));
        }
        state.scan = Some(ActiveScan {
            filter: filter.clone(),
            sink,
        });
        Ok(())
    }

    fn stop_scan(&self) {
        let mut state = self.shared.state.lock();
        if state.scan.take().is_some() {
            state.scan_stops += 1;
        }
    }

    fn connect(
        &self,
        address: &str,
        sink: GattEventSink,
    ) -> Result<Arc<dyn GattClient>, TransportError> {
        let mut state = self.shared.state.lock();
        if !state.enabled {
            return Err(TransportError::Unavailable);
        }
        let Some(instrument) = state
            .instruments
            .iter()
            .find(|i| i.address == address)
            .cloned()
        else {
            return Err(TransportError::UnknownDevice(address.to_string()));
        };

        SimShared::close_link(&mut state, address);
        state.next_link += 1;
        let id = state.next_link;

        if instrument.reachable {
            state.links.insert(
                address.to_string(),
                Link {
                    id,
                    sink: sink.clone(),
                    discovered: false,
                    local_notify: false,
                    remote_notify: false,
                    responder: InstrumentResponder::new(instrument.reading),
                    written: Vec::new(),
                },
            );
        }
        self.shared.push(Delivery::Gatt(
            sink,
            GattEvent::ConnectionStateChanged {
                connected: instrument.reachable,
                status: if instrument.reachable {
                    GATT_SUCCESS
                } else {
                    LINK_LOST_STATUS
                },
            },
        ));

        Ok(Arc::new(SimGattClient {
            shared: self.shared.clone(),
            address: address.to_string(),
            link_id: id,
            instrument,
        }))
    }
}

/// GATT client for one simulated link
struct SimGattClient {
    shared: Arc<SimShared>,
    address: String,
    link_id: u64,
    instrument: SimulatedInstrument,
}

impl SimGattClient {
    fn with_link<R>(
        &self,
        f: impl FnOnce(&SimShared, &mut Link, &mut SimState) -> R,
    ) -> Result<R, TransportError> {
        let mut state = self.shared.state.lock();
        let mut link = match state.links.remove(&self.address) {
            Some(link) if link.id == self.link_id => link,
            Some(other) => {
                state.links.insert(self.address.clone(), other);
                return Err(TransportError::OperationFailed("link closed".into()));
            }
            None => return Err(TransportError::OperationFailed("link closed".into())),
        };
        let result = f(&*self.shared, &mut link, &mut *state);
        state.links.insert(self.address.clone(), link);
        Ok(result)
    }

    fn respond(&self, sink: GattEventSink, responses: Vec<Response>, delay: Duration) {
        if responses.is_empty() {
            return;
        }
        let frames = responses.iter().map(Response::encode).collect::<Vec<_>>();
        if delay.is_zero() {
            for value in frames {
                self.shared.push(Delivery::Gatt(
                    sink.clone(),
                    GattEvent::CharacteristicChanged {
                        characteristic: protocol::DATA_CHAR_UUID,
                        value,
                    },
                ));
            }
            return;
        }

        let shared = self.shared.clone();
        shared.delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            for value in frames {
                tokio::time::sleep(delay).await;
                shared.push(Delivery::Gatt(
                    sink.clone(),
                    GattEvent::CharacteristicChanged {
                        characteristic: protocol::DATA_CHAR_UUID,
                        value,
                    },
                ));
            }
            shared.delayed.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl GattClient for SimGattClient {
    fn discover_services(&self) -> Result<(), TransportError> {
        self.instrument.refuses(GattFault::Discovery)?;
        let services = self.instrument.services();
        self.with_link(|shared, link, state| {
            link.discovered = true;
            state.discoveries += 1;
            shared.push(Delivery::Gatt(
                link.sink.clone(),
                GattEvent::ServicesDiscovered {
                    status: GATT_SUCCESS,
                    services,
                },
            ));
        })
    }

    fn services(&self) -> Vec<GattService> {
        let cached = self.instrument.cached_services;
        self.with_link(|_, link, _| cached || link.discovered)
            .ok()
            .filter(|discovered| *discovered)
            .map(|_| self.instrument.services())
            .unwrap_or_default()
    }

    fn request_high_priority(&self) -> Result<(), TransportError> {
        self.with_link(|_, _, _| trace!("Simulated high priority connection"))
    }

    fn set_notification(&self, characteristic: Uuid, enable: bool) -> Result<(), TransportError> {
        self.instrument.refuses(GattFault::Notification)?;
        self.with_link(|_, link, _| {
            if characteristic == protocol::DATA_CHAR_UUID {
                link.local_notify = enable;
            }
        })
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.instrument.refuses(GattFault::DescriptorWrite)?;
        let has_descriptor = self.instrument.has_client_config;
        let reported = self.instrument.descriptor_status;
        self.with_link(|shared, link, _| {
            let status = if has_descriptor && descriptor == protocol::CLIENT_CONFIG_UUID {
                link.remote_notify =
                    reported == GATT_SUCCESS && value == protocol::ENABLE_NOTIFICATION_VALUE;
                reported
            } else {
                // GATT_WRITE_NOT_PERMITTED
                3
            };
            shared.push(Delivery::Gatt(
                link.sink.clone(),
                GattEvent::DescriptorWritten {
                    characteristic,
                    descriptor,
                    status,
                },
            ));
        })
    }

    fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        if characteristic != protocol::DATA_CHAR_UUID {
            return Err(TransportError::OperationFailed(format!(
                "characteristic {characteristic} not writable"
            )));
        }
        let answer = self.with_link(|_, link, state| {
            link.written.push(value.to_vec());
            if state.auto_respond {
                Some((link.sink.clone(), link.responder.handle(value), state.part_delay))
            } else {
                None
            }
        })?;
        if let Some((sink, responses, delay)) = answer {
            self.respond(sink, responses, delay);
        }
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.shared.state.lock();
        if state
            .links
            .get(&self.address)
            .is_some_and(|link| link.id == self.link_id)
        {
            debug!(address = %self.address, "Simulated disconnect");
            SimShared::close_link(&mut state, &self.address);
        }
    }

    fn close(&self) {
        self.disconnect();
    }
}
