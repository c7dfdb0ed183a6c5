//! Talk to Hörmann garage door drives over their HCP1 accessory bus.
//!
//! A SupraMatic Series 3 drive is the master of a half-duplex RS485
//! multi-drop bus. It broadcasts the door status every cycle, scans for
//! accessory modules and polls each one for status. This crate
//! impersonates a UAP1 accessory (type 0x14, slave address 0x28):
//! it answers the drive's scans and polls, decodes broadcasts into door
//! and light state, and injects user commands (open, close, vent, toggle
//! light, emergency stop) into its status-response slot.
//!
//! The layers, bottom up:
//!
//! - [`hcp1`]: frame CRC, the [`hcp1::Packet`] value type, the tolerant
//!   stream parsers and the bus protocol engine.
//! - [`serial`]: the async RS485 port (19,200 Bd 8N1) with break support.
//! - [`bus`]: the narrow peer surface between protocol and domain code,
//!   including a mock peer for development without hardware.
//! - [`door`]: the door/light state machine and the embedder-facing
//!   [`door::DoorHandle`].
//! - [`daemon`]: wiring and lifecycle for the `portierd` binary.
//!
//! The drive grants a slave one response slot per poll cycle, so
//! commands queue FIFO and ride along one at a time; each submission
//! resolves with the frame that actually went out on the wire.

pub mod bus;
pub mod config;
pub mod daemon;
pub mod door;
pub mod hcp1;
pub mod serial;
pub mod tracing;

pub use bus::{BusEvent, BusPeer, TransportError};
pub use config::{Config, ParserVariant};
pub use door::{DoorError, DoorEvent, DoorHandle, DoorState, TargetDoorState};
pub use hcp1::Packet;
