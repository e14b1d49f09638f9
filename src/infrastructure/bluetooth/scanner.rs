//! BLE Scanner Module
//!
//! Time-boxed discovery of pHyter instruments. One radio scan at a time:
//! concurrent [`Scanner::scan`] calls share the active session and its
//! sightings. A session ends when its deadline passes, when the last
//! [`ScanStream`] is dropped, or when the radio reports a failure.

use crate::domain::models::ScannedInstrument;
use crate::error::{InstrumentError, Result, TransportError};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{BleAdapter, ScanFilter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Default scan session length
pub const SCAN_DURATION: Duration = Duration::from_secs(10);

/// Failure code reported when the radio refuses to start a scan
pub const SCAN_START_FAILED: i32 = -1;

/// Sightings buffered per subscriber before it starts lagging
const SCAN_BUFFER: usize = 64;

/// Configuration for discovery
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub duration: Duration,
    /// Only report instruments advertising this service (or everything if `None`)
    pub service_uuid: Option<Uuid>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration: SCAN_DURATION,
            service_uuid: Some(protocol::SERVICE_UUID),
        }
    }
}

#[derive(Debug, Clone)]
enum ScanMessage {
    Sighting(ScannedInstrument),
    Failed(i32),
}

struct ActiveSession {
    id: u64,
    tx: broadcast::Sender<ScanMessage>,
    subscribers: usize,
    deadline: Option<JoinHandle<()>>,
    /// Latest sighting per address
    seen: HashMap<String, ScannedInstrument>,
}

struct ScanInner {
    session: Option<ActiveSession>,
    next_id: u64,
}

struct ScanShared {
    adapter: Arc<dyn BleAdapter>,
    config: ScanConfig,
    inner: Mutex<ScanInner>,
}

/// BLE Scanner for discovering instruments
pub struct Scanner {
    shared: Arc<ScanShared>,
}

impl Scanner {
    /// Create a new scanner
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ScanConfig) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                adapter,
                config,
                inner: Mutex::new(ScanInner {
                    session: None,
                    next_id: 0,
                }),
            }),
        }
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.shared.inner.lock().session.is_some()
    }

    /// Latest sighting of every instrument seen by the active session,
    /// strongest signal first. Empty while idle.
    pub fn sightings(&self) -> Vec<ScannedInstrument> {
        let inner = self.shared.inner.lock();
        let mut sightings: Vec<_> = inner
            .session
            .as_ref()
            .map(|s| s.seen.values().cloned().collect())
            .unwrap_or_default();
        sightings.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        sightings
    }

    /// Join the active scan session, or start one.
    ///
    /// Only the first call of a session starts the radio; later calls while
    /// it runs get a stream onto the same session. Starting a session outside
    /// a tokio runtime fails with [`InstrumentError::ScanFailed`].
    pub fn scan(&self) -> Result<ScanStream> {
        let mut inner = self.shared.inner.lock();

        if let Some(session) = inner.session.as_mut() {
            session.subscribers += 1;
            debug!(
                "Joining scan session {} ({} subscribers)",
                session.id, session.subscribers
            );
            return Ok(ScanStream {
                session_id: session.id,
                rx: session.tx.subscribe(),
                shared: Arc::downgrade(&self.shared),
                done: false,
            });
        }

        if !self.shared.adapter.is_enabled() {
            warn!("Cannot scan, bluetooth adapter unavailable");
            return Err(InstrumentError::TransportUnavailable);
        }

        // The deadline timer needs a runtime
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot arm scan timer: {}", e);
                return Err(InstrumentError::ScanFailed(SCAN_START_FAILED));
            }
        };

        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = broadcast::channel(SCAN_BUFFER);
        let sink = ScanEventSink {
            shared: Arc::downgrade(&self.shared),
            session_id: id,
        };
        let filter = ScanFilter {
            service_uuid: self.shared.config.service_uuid,
        };

        info!("Starting BLE scan for service UUID: {:?}", filter.service_uuid);
        if let Err(e) = self.shared.adapter.start_scan(&filter, sink) {
            error!("Failed to start BLE scan: {}", e);
            return Err(match e {
                TransportError::Unavailable => InstrumentError::TransportUnavailable,
                _ => InstrumentError::ScanFailed(SCAN_START_FAILED),
            });
        }

        let deadline = {
            let shared = Arc::downgrade(&self.shared);
            let duration = self.shared.config.duration;
            runtime.spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(shared) = shared.upgrade() {
                    trace!("Scan timer expired");
                    shared.complete(id);
                }
            })
        };
        trace!("Scan timer started ({:?})", self.shared.config.duration);

        inner.session = Some(ActiveSession {
            id,
            tx,
            subscribers: 1,
            deadline: Some(deadline),
            seen: HashMap::new(),
        });

        Ok(ScanStream {
            session_id: id,
            rx,
            shared: Arc::downgrade(&self.shared),
            done: false,
        })
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        let active = self.shared.inner.lock().session.as_ref().map(|s| s.id);
        if let Some(id) = active {
            self.shared.complete(id);
        }
    }
}

impl ScanShared {
    fn take_session(&self, inner: &mut ScanInner, id: u64) -> Option<ActiveSession> {
        match inner.session.as_ref() {
            Some(session) if session.id == id => inner.session.take(),
            _ => None,
        }
    }

    /// Stop the radio and close the stream
    fn complete(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(mut session) = self.take_session(&mut inner, id) {
            info!("Stopping BLE scan");
            if let Some(deadline) = session.deadline.take() {
                deadline.abort();
            }
            self.adapter.stop_scan();
            // Dropping the sender completes every subscriber
        }
    }

    fn release(&self, id: u64) {
        let remaining = {
            let mut inner = self.inner.lock();
            match inner.session.as_mut() {
                Some(session) if session.id == id => {
                    session.subscribers = session.subscribers.saturating_sub(1);
                    session.subscribers
                }
                _ => return,
            }
        };
        if remaining == 0 {
            debug!("Scan observer disposed");
            self.complete(id);
        }
    }

    fn on_result(&self, id: u64, sighting: ScannedInstrument) {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) if session.id == id => {
                trace!("Sighting {} ({} dBm)", sighting.address, sighting.rssi);
                // Repeats still go out so signal and name updates are observable
                session
                    .seen
                    .insert(sighting.address.clone(), sighting.clone());
                let _ = session.tx.send(ScanMessage::Sighting(sighting));
            }
            _ => trace!("Sighting for finished scan session, dropping"),
        }
    }

    fn on_failure(&self, id: u64, code: i32) {
        let mut inner = self.inner.lock();
        if let Some(mut session) = self.take_session(&mut inner, id) {
            error!("BLE scan failed with code {}", code);
            if let Some(deadline) = session.deadline.take() {
                deadline.abort();
            }
            let _ = session.tx.send(ScanMessage::Failed(code));
        }
    }
}

/// Entry point for discovery callbacks of one scan session
#[derive(Clone)]
pub struct ScanEventSink {
    shared: Weak<ScanShared>,
    session_id: u64,
}

impl ScanEventSink {
    /// A device advertising the filtered service was seen
    pub fn on_result(&self, address: &str, name: Option<String>, rssi: i16) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_result(
                self.session_id,
                ScannedInstrument::new(address, name, rssi),
            );
        }
    }

    /// The radio aborted the scan
    pub fn on_failure(&self, code: i32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_failure(self.session_id, code);
        }
    }
}

impl fmt::Debug for ScanEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanEventSink")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// One subscriber to a scan session.
///
/// Dropping the last subscriber of a session stops the radio scan.
pub struct ScanStream {
    session_id: u64,
    rx: broadcast::Receiver<ScanMessage>,
    shared: Weak<ScanShared>,
    done: bool,
}

impl ScanStream {
    /// Identifies the session this stream observes
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Next sighting. `None` once the session has ended; a failure is
    /// reported once as `Some(Err(ScanFailed))`.
    pub async fn next(&mut self) -> Option<Result<ScannedInstrument>> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(ScanMessage::Sighting(sighting)) => return Some(Ok(sighting)),
                Ok(ScanMessage::Failed(code)) => {
                    self.done = true;
                    return Some(Err(InstrumentError::ScanFailed(code)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Scan subscriber lagging, skipped {} sightings", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulator::{SimulatedAdapter, SimulatedInstrument};

    fn setup(duration: Duration) -> (Arc<SimulatedAdapter>, Scanner) {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.add_instrument(
            SimulatedInstrument::new("C4:64:E3:00:00:01", Some("pHyter 1".into())).with_rssi(-40),
        );
        adapter.add_instrument(SimulatedInstrument::new("C4:64:E3:00:00:02", None).with_rssi(-70));
        adapter.add_instrument(
            SimulatedInstrument::new("00:11:22:33:44:55", Some("Headphones".into())).without_service(),
        );
        let scanner = Scanner::new(
            adapter.clone(),
            ScanConfig {
                duration,
                ..ScanConfig::default()
            },
        );
        (adapter, scanner)
    }

    #[tokio::test]
    async fn test_concurrent_scans_share_session() {
        let (adapter, scanner) = setup(SCAN_DURATION);

        let first = scanner.scan().unwrap();
        let second = scanner.scan().unwrap();

        assert_eq!(first.session_id(), second.session_id());
        assert_eq!(adapter.scan_start_count(), 1);
        assert!(scanner.is_scanning());
        assert!(adapter.is_scanning());
    }

    #[tokio::test]
    async fn test_sightings_filtered_by_service() {
        let (_adapter, scanner) = setup(Duration::from_millis(50));
        let mut stream = scanner.scan().unwrap();

        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap());
        }

        let addresses: Vec<_> = seen.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addresses, vec!["C4:64:E3:00:00:01", "C4:64:E3:00:00:02"]);
        assert_eq!(seen[1].name, "Unknown");
    }

    #[tokio::test]
    async fn test_deadline_stops_scan() {
        let (adapter, scanner) = setup(Duration::from_millis(30));
        let mut stream = scanner.scan().unwrap();

        while stream.next().await.is_some() {}

        assert!(!scanner.is_scanning());
        assert_eq!(adapter.scan_stop_count(), 1);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_last_subscriber_stops_scan() {
        let (adapter, scanner) = setup(SCAN_DURATION);
        let first = scanner.scan().unwrap();
        let second = scanner.scan().unwrap();

        drop(first);
        assert!(scanner.is_scanning());
        assert_eq!(adapter.scan_stop_count(), 0);

        drop(second);
        assert!(!scanner.is_scanning());
        assert!(!adapter.is_scanning());
        assert_eq!(adapter.scan_stop_count(), 1);

        // A fresh scan starts a new session
        let third = scanner.scan().unwrap();
        assert_eq!(adapter.scan_start_count(), 2);
        assert_ne!(third.session_id(), 0);
    }

    #[tokio::test]
    async fn test_repeated_sightings_pass_through() {
        let (adapter, scanner) = setup(SCAN_DURATION);
        let mut stream = scanner.scan().unwrap();
        adapter.settle().await;
        adapter.set_rssi("C4:64:E3:00:00:01", -55);

        let mut last = None;
        for _ in 0..3 {
            last = stream.next().await;
        }
        let sighting = last.unwrap().unwrap();
        assert_eq!(sighting.address, "C4:64:E3:00:00:01");
        assert_eq!(sighting.rssi, -55);

        // The session keeps one entry per address with the latest values
        let sightings = scanner.sightings();
        assert_eq!(sightings.len(), 2);
        assert_eq!(sightings[0].address, "C4:64:E3:00:00:01");
        assert_eq!(sightings[0].rssi, -55);

        drop(stream);
        assert!(scanner.sightings().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_returns_to_idle() {
        let (adapter, scanner) = setup(SCAN_DURATION);
        let mut stream = scanner.scan().unwrap();
        adapter.settle().await;
        adapter.fail_scan(2);

        let mut failure = None;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                failure = Some(e);
            }
        }
        assert_eq!(failure, Some(InstrumentError::ScanFailed(2)));
        assert!(!scanner.is_scanning());

        let _again = scanner.scan().unwrap();
        assert_eq!(adapter.scan_start_count(), 2);
    }

    #[test]
    fn test_scan_outside_runtime_fails() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (adapter, scanner) = {
            let _guard = runtime.enter();
            setup(SCAN_DURATION)
        };

        assert!(matches!(
            scanner.scan(),
            Err(InstrumentError::ScanFailed(SCAN_START_FAILED))
        ));
        assert!(!scanner.is_scanning());
        assert_eq!(adapter.scan_start_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_with_adapter_disabled() {
        let (adapter, scanner) = setup(SCAN_DURATION);
        adapter.set_enabled(false);
        assert!(matches!(
            scanner.scan(),
            Err(InstrumentError::TransportUnavailable)
        ));
        assert_eq!(adapter.scan_start_count(), 0);
    }
}
