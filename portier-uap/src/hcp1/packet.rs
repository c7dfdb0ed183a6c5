//! HCP1 frame representation.
//!
//! Every frame on the bus is `[address][counter << 4 | payload_len][payload…][crc]`,
//! between 4 and 18 bytes in total. [`Packet`] wraps a fixed-capacity buffer
//! so frames are cheap values that can be copied around freely.

use std::fmt;

use super::crc::crc8;
use super::error::FrameError;

/// Address all bus members listen on.
pub const BROADCAST_ADDR: u8 = 0x00;
/// Address of the drive, the bus master.
pub const MASTER_ADDR: u8 = 0x80;
/// Slave address of a UAP1 accessory module.
pub const UAP1_ADDR: u8 = 0x28;
/// Device type a UAP1 reports during the bus scan.
pub const UAP1_TYPE: u8 = 0x14;

/// Smallest frame on the wire: address, length byte, one payload byte, CRC.
pub const MIN_FRAME_LEN: usize = 4;
/// Largest frame on the wire: a full 15-byte payload plus overhead.
pub const MAX_FRAME_LEN: usize = 18;
/// Payload length representable in the 4-bit length nibble.
pub const MAX_PAYLOAD_LEN: usize = 15;

/// An immutable HCP1 frame.
#[derive(Clone, Copy)]
pub struct Packet {
    buf: [u8; MAX_FRAME_LEN],
    len: u8,
}

impl Packet {
    /// Parses and fully validates a frame from raw bytes.
    ///
    /// Checks the overall length bounds, the declared length nibble and
    /// the trailing CRC.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let packet = Self::from_bytes_unchecked(bytes)?;

        let declared = MIN_FRAME_LEN - 1 + packet.length_nibble() as usize;
        if declared != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let expected = crc8(&bytes[..bytes.len() - 1])?;
        if expected != packet.crc() {
            return Err(FrameError::BadCrc {
                got: packet.crc(),
                expected,
            });
        }

        Ok(packet)
    }

    /// Wraps raw bytes without validating the length nibble or CRC.
    ///
    /// Only the overall length bounds are enforced. Used by the salvage
    /// parser, which verifies candidate checksums itself before handing
    /// the bytes over.
    pub fn from_bytes_unchecked(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLong(bytes.len()));
        }

        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            buf,
            len: bytes.len() as u8,
        })
    }

    /// Builds a frame from its fields, packing the length byte as
    /// `(counter << 4) | payload_len`.
    ///
    /// When `crc` is `None` the checksum is computed; passing a checksum
    /// allows constructing deliberately corrupt frames for testing.
    pub fn from_fields(
        address: u8,
        counter: u8,
        payload: &[u8],
        crc: Option<u8>,
    ) -> Result<Self, FrameError> {
        if counter > 0x0f {
            return Err(FrameError::CounterOutOfRange(counter));
        }
        if payload.is_empty() {
            return Err(FrameError::TooShort(payload.len() + 3));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }

        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = payload.len() + 3;

        buf[0] = address;
        buf[1] = (counter << 4) | payload.len() as u8;
        buf[2..2 + payload.len()].copy_from_slice(payload);
        buf[len - 1] = match crc {
            Some(crc) => crc,
            None => crc8(&buf[..len - 1])?,
        };

        Ok(Self {
            buf,
            len: len as u8,
        })
    }

    /// Destination address, frame byte 0.
    pub fn address(&self) -> u8 {
        self.buf[0]
    }

    /// Message counter, the high nibble of the length byte.
    pub fn counter(&self) -> u8 {
        self.buf[1] >> 4
    }

    /// Payload length, the low nibble of the length byte.
    pub fn length_nibble(&self) -> u8 {
        self.buf[1] & 0x0f
    }

    /// The address and length bytes.
    pub fn header(&self) -> &[u8] {
        &self.buf[..2]
    }

    /// Payload bytes, between the header and the CRC.
    pub fn payload(&self) -> &[u8] {
        &self.buf[2..self.len as usize - 1]
    }

    /// The trailing CRC byte.
    pub fn crc(&self) -> u8 {
        self.buf[self.len as usize - 1]
    }

    /// The whole frame as it appears on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Lowercase hex rendition of the whole frame.
    pub fn hex_string(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Whether the length nibble and CRC agree with the frame bytes.
    pub fn is_valid(&self) -> bool {
        Self::from_bytes(self.as_bytes()).is_ok()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self.hex_string())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fields_packs_the_length_byte() {
        let packet = Packet::from_fields(0x00, 5, &[0x00, 0x01], None).unwrap();

        assert_eq!(packet.hex_string(), "00520001cc");
        assert!(packet.is_valid());
    }

    #[test]
    fn from_bytes_decodes_a_status_response() {
        let bytes = hex::decode("80f329001008").unwrap();
        let packet = Packet::from_bytes(&bytes).unwrap();

        assert_eq!(packet.address(), 0x80);
        assert_eq!(packet.counter(), 0x0f);
        assert_eq!(packet.length_nibble(), 0x03);
        assert_eq!(packet.header(), &bytes[..2]);
        assert_eq!(packet.payload(), [0x29, 0x00, 0x10]);
        assert_eq!(packet.crc(), 0x08);
    }

    #[test]
    fn round_trips_through_bytes() {
        let packet = Packet::from_fields(UAP1_ADDR, 13, &[0x01, 0x80], None).unwrap();
        let reparsed = Packet::from_bytes(packet.as_bytes()).unwrap();

        assert_eq!(packet, reparsed);
        assert_eq!(packet.as_bytes(), reparsed.as_bytes());
    }

    #[test]
    fn crc_sits_over_all_preceding_bytes() {
        let packet = Packet::from_fields(MASTER_ADDR, 7, &[0x29, 0x01, 0x10], None).unwrap();
        let bytes = packet.as_bytes();

        assert_eq!(bytes[bytes.len() - 1], crc8(&bytes[..bytes.len() - 1]).unwrap());
        assert_eq!(packet.length_nibble() as usize + 3, bytes.len());
    }

    #[test]
    fn rejects_short_and_long_frames() {
        assert_eq!(
            Packet::from_bytes(&[0x00, 0x10, 0xaa]),
            Err(FrameError::TooShort(3))
        );
        assert_eq!(
            Packet::from_bytes(&[0u8; 19]),
            Err(FrameError::TooLong(19))
        );
    }

    #[test]
    fn rejects_wrong_declared_length() {
        // Length nibble claims 1 payload byte, frame carries 2.
        let err = Packet::from_bytes(&[0x00, 0x51, 0x00, 0x01, 0xcc]).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                declared: 4,
                actual: 5
            }
        );
    }

    #[test]
    fn rejects_corrupt_crc() {
        let err = Packet::from_bytes(&hex::decode("00520001cd").unwrap()).unwrap_err();
        assert_eq!(
            err,
            FrameError::BadCrc {
                got: 0xcd,
                expected: 0xcc
            }
        );
    }

    #[test]
    fn from_fields_rejects_out_of_range_inputs() {
        assert_eq!(
            Packet::from_fields(0x00, 16, &[0x00], None),
            Err(FrameError::CounterOutOfRange(16))
        );
        assert_eq!(
            Packet::from_fields(0x00, 0, &[0u8; 16], None),
            Err(FrameError::PayloadTooLong(16))
        );
    }

    #[test]
    fn explicit_crc_is_kept_verbatim() {
        let packet = Packet::from_fields(0x00, 5, &[0x00, 0x01], Some(0xee)).unwrap();

        assert_eq!(packet.crc(), 0xee);
        assert!(!packet.is_valid());
    }
}
