//! HCP1, the half-duplex RS485 protocol spoken by Hörmann drives.
//!
//! The modules layer bottom-up: [`crc`] computes the frame checksum,
//! [`packet`] models a single frame, [`parser`] recovers frames from a
//! raw byte stream, and [`engine`] implements the slave side of the bus
//! protocol on top of them.

pub mod crc;
pub mod engine;
pub mod error;
pub mod packet;
pub mod parser;

pub use engine::{BusDriver, CommandFlag, Engine};
pub use error::{FrameError, ProtocolError};
pub use packet::Packet;
pub use parser::{FrameParser, ParserConfig, SalvageParser, StrictParser};
