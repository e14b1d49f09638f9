//! pHyter Serial Protocol
//!
//! Frame codec for the serial-over-BLE protocol spoken by the instrument.
//! Pure functions only: no state, no I/O.
//!
//! # Frame Structure (both directions)
//!
//! ```text
//! [0]      : Opcode
//! [1..N]   : Zero or more f32 arguments, little-endian, 4 bytes each
//! ```
//!
//! Command opcodes live in 0x01-0x04, response opcodes in 0x81-0x85 plus
//! 0xFF for errors. A frame is only valid when its length is exactly
//! `1 + 4 * argument_count` for its opcode.

use crate::error::{InstrumentError, Result};
use tracing::trace;
use uuid::Uuid;

/// Instrument serial service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Serial data characteristic UUID - commands are written here and responses notified
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Standard client characteristic configuration descriptor
pub const CLIENT_CONFIG_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Descriptor value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

const FLOAT_SIZE: usize = 4;

/// Opcode table shared by commands and responses
pub trait Opcode: Sized + Copy {
    /// Wire value of the opcode byte
    fn opcode(self) -> u8;
    /// Number of f32 arguments following the opcode
    fn arg_count(self) -> usize;
    /// Look up an opcode byte
    fn from_opcode(opcode: u8) -> Option<Self>;

    /// Total frame length in bytes
    fn frame_len(self) -> usize {
        1 + FLOAT_SIZE * self.arg_count()
    }
}

/// Commands sent controller -> instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    SetSalinity,
    Background,
    Measure,
    LedIntensityCheck,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        Self::SetSalinity,
        Self::Background,
        Self::Measure,
        Self::LedIntensityCheck,
    ];
}

impl Opcode for CommandKind {
    fn opcode(self) -> u8 {
        match self {
            Self::SetSalinity => 0x01,
            Self::Background => 0x02,
            Self::Measure => 0x03,
            Self::LedIntensityCheck => 0x04,
        }
    }

    fn arg_count(self) -> usize {
        match self {
            Self::SetSalinity => 1,
            Self::Background | Self::Measure | Self::LedIntensityCheck => 0,
        }
    }

    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x01 => Some(Self::SetSalinity),
            0x02 => Some(Self::Background),
            0x03 => Some(Self::Measure),
            0x04 => Some(Self::LedIntensityCheck),
            _ => None,
        }
    }
}

/// Responses notified instrument -> controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    SalinitySet,
    BackgroundComplete,
    /// pH and temperature
    MeasurePart1,
    /// Two absorbance readings and the dark reading
    MeasurePart2,
    LedIntensityCheck,
    Error,
}

impl ResponseKind {
    pub const ALL: [ResponseKind; 6] = [
        Self::SalinitySet,
        Self::BackgroundComplete,
        Self::MeasurePart1,
        Self::MeasurePart2,
        Self::LedIntensityCheck,
        Self::Error,
    ];
}

impl Opcode for ResponseKind {
    fn opcode(self) -> u8 {
        match self {
            Self::SalinitySet => 0x81,
            Self::BackgroundComplete => 0x82,
            Self::MeasurePart1 => 0x83,
            Self::MeasurePart2 => 0x84,
            Self::LedIntensityCheck => 0x85,
            Self::Error => 0xFF,
        }
    }

    fn arg_count(self) -> usize {
        match self {
            Self::SalinitySet => 1,
            Self::MeasurePart1 => 2,
            Self::MeasurePart2 => 3,
            Self::BackgroundComplete | Self::LedIntensityCheck | Self::Error => 0,
        }
    }

    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x81 => Some(Self::SalinitySet),
            0x82 => Some(Self::BackgroundComplete),
            0x83 => Some(Self::MeasurePart1),
            0x84 => Some(Self::MeasurePart2),
            0x85 => Some(Self::LedIntensityCheck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// A decoded frame: opcode kind plus its float payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<K> {
    pub kind: K,
    pub args: Vec<f32>,
}

/// Encode a frame. Returns `None` if `args` does not match the opcode's arity.
pub fn encode<K: Opcode>(kind: K, args: &[f32]) -> Option<Vec<u8>> {
    if args.len() != kind.arg_count() {
        return None;
    }
    let mut bytes = Vec::with_capacity(kind.frame_len());
    bytes.push(kind.opcode());
    for arg in args {
        bytes.extend_from_slice(&arg.to_le_bytes());
    }
    Some(bytes)
}

/// Decode a frame against the opcode set `K`.
///
/// Returns `None` for an empty buffer, an opcode outside `K`, or a length
/// that differs from the opcode's expected length.
pub fn decode<K: Opcode>(bytes: &[u8]) -> Option<Frame<K>> {
    let (&opcode, payload) = bytes.split_first()?;
    let kind = K::from_opcode(opcode)?;

    if bytes.len() != kind.frame_len() {
        trace!(
            "Length mismatch for opcode {:#04X}: {} (expected {})",
            opcode,
            bytes.len(),
            kind.frame_len()
        );
        return None;
    }

    let args = payload
        .chunks_exact(FLOAT_SIZE)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Some(Frame { kind, args })
}

/// Typed command frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetSalinity(f32),
    Background,
    Measure,
    LedIntensityCheck,
}

impl Command {
    /// Build a command from its kind and raw arguments
    pub fn from_parts(kind: CommandKind, args: &[f32]) -> Result<Self> {
        if args.len() != kind.arg_count() {
            return Err(InstrumentError::InvalidArguments {
                kind,
                expected: kind.arg_count(),
                actual: args.len(),
            });
        }
        Ok(match kind {
            CommandKind::SetSalinity => Self::SetSalinity(args[0]),
            CommandKind::Background => Self::Background,
            CommandKind::Measure => Self::Measure,
            CommandKind::LedIntensityCheck => Self::LedIntensityCheck,
        })
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetSalinity(_) => CommandKind::SetSalinity,
            Self::Background => CommandKind::Background,
            Self::Measure => CommandKind::Measure,
            Self::LedIntensityCheck => CommandKind::LedIntensityCheck,
        }
    }

    pub fn args(&self) -> Vec<f32> {
        match self {
            Self::SetSalinity(salinity) => vec![*salinity],
            _ => Vec::new(),
        }
    }

    /// Wire bytes for this command
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind();
        let mut bytes = Vec::with_capacity(kind.frame_len());
        bytes.push(kind.opcode());
        for arg in self.args() {
            bytes.extend_from_slice(&arg.to_le_bytes());
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let frame = decode::<CommandKind>(bytes)?;
        Self::from_parts(frame.kind, &frame.args).ok()
    }
}

/// Typed response frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    SalinitySet(f32),
    BackgroundComplete,
    MeasurePart1 { ph: f32, temperature: f32 },
    MeasurePart2 { a578: f32, a434: f32, dark: f32 },
    LedIntensityCheck,
    Error,
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::SalinitySet(_) => ResponseKind::SalinitySet,
            Self::BackgroundComplete => ResponseKind::BackgroundComplete,
            Self::MeasurePart1 { .. } => ResponseKind::MeasurePart1,
            Self::MeasurePart2 { .. } => ResponseKind::MeasurePart2,
            Self::LedIntensityCheck => ResponseKind::LedIntensityCheck,
            Self::Error => ResponseKind::Error,
        }
    }

    pub fn args(&self) -> Vec<f32> {
        match *self {
            Self::SalinitySet(salinity) => vec![salinity],
            Self::MeasurePart1 { ph, temperature } => vec![ph, temperature],
            Self::MeasurePart2 { a578, a434, dark } => vec![a578, a434, dark],
            _ => Vec::new(),
        }
    }

    /// Wire bytes for this response
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind();
        let mut bytes = Vec::with_capacity(kind.frame_len());
        bytes.push(kind.opcode());
        for arg in self.args() {
            bytes.extend_from_slice(&arg.to_le_bytes());
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let Frame { kind, args } = decode::<ResponseKind>(bytes)?;
        Some(match kind {
            ResponseKind::SalinitySet => Self::SalinitySet(args[0]),
            ResponseKind::BackgroundComplete => Self::BackgroundComplete,
            ResponseKind::MeasurePart1 => Self::MeasurePart1 {
                ph: args[0],
                temperature: args[1],
            },
            ResponseKind::MeasurePart2 => Self::MeasurePart2 {
                a578: args[0],
                a434: args[1],
                dark: args[2],
            },
            ResponseKind::LedIntensityCheck => Self::LedIntensityCheck,
            ResponseKind::Error => Self::Error,
        })
    }
}

/// Parse a UUID string, accepting upper or lower case
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}
