//! Bluetooth Module
//!
//! BLE communication with pHyter pH instruments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   InstrumentService                      │
//! │      (session coordinator, owns the active instrument)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐
//! │  Scanner  │  │ Instrument │  │  Protocol  │
//! │           │  │            │  │            │
//! │ - shared  │  │ - commands │  │ - UUIDs    │
//! │   session │  │ - replies  │  │ - frames   │
//! └─────┬─────┘  └─────┬──────┘  └────────────┘
//!       │              ▼
//!       │        ┌────────────┐  ┌────────────┐
//!       │        │ Connection │──│ Correlator │
//!       │        └─────┬──────┘  └────────────┘
//!       ▼              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        Transport (BleAdapter / GattClient traits)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame codec and well-known identifiers
//! - [`correlator`] - Matches responses to pending commands
//! - [`transport`] - Radio abstraction implemented by a BLE stack
//! - [`connection`] - Per-instrument connection state machine
//! - [`scanner`] - Time-boxed instrument discovery
//! - [`instrument`] - High-level instrument operations
//! - [`service`] - Session coordinator
//! - [`simulator`] - In-process radio and instrument responder

pub mod connection;
pub mod correlator;
pub mod instrument;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

pub use instrument::Instrument;
pub use service::InstrumentService;
