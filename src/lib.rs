//! Communication core for pHyter pH instruments over Bluetooth Low Energy.
//!
//! Discover instruments with [`InstrumentService::scan`], select one and drive
//! it through [`Instrument`]: set salinity, take a background reading and
//! measure samples.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{InstrumentError, Result, TransportError};
pub use infrastructure::bluetooth::{Instrument, InstrumentService};
