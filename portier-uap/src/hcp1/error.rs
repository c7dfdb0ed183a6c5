//! Error types for the HCP1 protocol stack.

use thiserror::Error;

/// Errors raised while framing or un-framing HCP1 packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The CRC was asked to digest zero bytes.
    #[error("CRC input is empty")]
    EmptyInput,

    /// Fewer bytes than the smallest possible frame.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// More bytes than the largest possible frame.
    #[error("frame too long: {0} bytes")]
    TooLong(usize),

    /// Trailing CRC byte does not match the computed checksum.
    #[error("bad CRC: got {got:#04x}, expected {expected:#04x}")]
    BadCrc { got: u8, expected: u8 },

    /// Length nibble disagrees with the number of bytes present.
    #[error("length nibble declares a {declared}-byte frame, got {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload does not fit the 4-bit length field.
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLong(usize),

    /// Message counter does not fit the 4-bit counter field.
    #[error("message counter {0:#04x} exceeds a nibble")]
    CounterOutOfRange(u8),
}

/// Errors raised by the bus protocol engine.
///
/// These are surfaced as error events; the engine keeps processing
/// subsequent packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A packet addressed to us carried an unexpected message counter.
    #[error("unexpected message counter {got}, expected {expected}")]
    BadCounter { got: u8, expected: u8 },

    /// A payload with the wrong size for its packet type.
    #[error("unexpected payload length {0}")]
    BadPayloadLen(usize),

    /// A bus scan whose payload is not the master's scan request.
    #[error("malformed bus scan payload {0}")]
    BadScanPayload(String),

    /// A slave command code this module does not implement.
    #[error("unknown slave command {0:#04x}")]
    UnknownSlaveCommand(u8),

    /// A framing failure while building a response.
    #[error(transparent)]
    Frame(#[from] FrameError),
}
