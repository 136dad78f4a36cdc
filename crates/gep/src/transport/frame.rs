//! Command-channel framing.
//!
//! Requests written by a subscriber carry an 8-byte payload header: the
//! payload marker `AA BB CC DD` followed by a little-endian payload size
//! word (the size counts the command byte plus the body). Responses use
//! the same 8-byte pre-header followed by a 6-byte response header:
//! response code, original command code, and four reserved bytes, all
//! counted by the size word. UDP datagrams skip the pre-header; the
//! datagram boundary is the frame boundary.

use winnow::binary::{be_i64, be_u32};
use winnow::prelude::*;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::{PAYLOAD_MARKER, RESPONSE_HEADER_SIZE};
use super::error::{Error, Result};

/// The fixed 8-byte header that precedes every command-channel payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PayloadHeader {
    /// Payload marker bytes.
    pub marker: [u8; 4],
    /// Size of the payload that follows, little endian.
    pub size: U32<LittleEndian>,
}

impl PayloadHeader {
    /// Create a header for a payload of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            marker: PAYLOAD_MARKER,
            size: U32::new(size),
        }
    }

    /// Convert the header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse a header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(header, _)| header)
            .map_err(|_| Error::NotEnoughData {
                needed: std::mem::size_of::<Self>(),
                available: data.len(),
            })
    }

    /// Size of the payload that follows the header.
    pub fn payload_size(&self) -> usize {
        self.size.get() as usize
    }

    /// Reject a header whose marker bytes are wrong.
    pub fn verify_marker(&self) -> Result<()> {
        if self.marker != PAYLOAD_MARKER {
            return Err(Error::malformed(
                "payload header",
                format!("bad marker {:02X?}", self.marker),
            ));
        }
        Ok(())
    }
}

/// The response header that opens every server-response payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ResponseHeader {
    /// Server response code.
    pub response: u8,
    /// Original command code the response answers, 0 for unsolicited.
    pub command: u8,
    /// Reserved, always zero.
    pub reserved: [u8; 4],
}

impl ResponseHeader {
    /// Create a response header.
    pub fn new(response: u8, command: u8) -> Self {
        Self {
            response,
            command,
            reserved: [0; 4],
        }
    }

    /// Convert the header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

/// Append a complete request frame: payload header, command byte, body.
pub fn write_command_frame(buf: &mut Vec<u8>, command: u8, body: &[u8]) {
    let size = 1 + body.len();
    buf.extend_from_slice(PayloadHeader::new(size as u32).as_bytes());
    buf.push(command);
    buf.extend_from_slice(body);
}

/// Append a complete response frame: payload header, response header, body.
pub fn write_response_frame(buf: &mut Vec<u8>, response: u8, command: u8, body: &[u8]) {
    let size = RESPONSE_HEADER_SIZE + body.len();
    buf.extend_from_slice(PayloadHeader::new(size as u32).as_bytes());
    buf.extend_from_slice(ResponseHeader::new(response, command).as_bytes());
    buf.extend_from_slice(body);
}

/// Build a response packet without the pre-header, as carried by a UDP
/// datagram: response header followed by body.
pub fn response_packet(response: u8, command: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(RESPONSE_HEADER_SIZE + body.len());
    packet.extend_from_slice(ResponseHeader::new(response, command).as_bytes());
    packet.extend_from_slice(body);
    packet
}

/// Split a response packet into `(response code, command code, body)`.
pub fn split_response(packet: &[u8]) -> Result<(u8, u8, &[u8])> {
    if packet.len() < RESPONSE_HEADER_SIZE {
        return Err(Error::NotEnoughData {
            needed: RESPONSE_HEADER_SIZE,
            available: packet.len(),
        });
    }
    Ok((packet[0], packet[1], &packet[RESPONSE_HEADER_SIZE..]))
}

/// Split a request packet into `(command code, body)`.
pub fn split_request(packet: &[u8]) -> Result<(u8, &[u8])> {
    match packet.split_first() {
        Some((&command, body)) => Ok((command, body)),
        None => Err(Error::NotEnoughData {
            needed: 1,
            available: 0,
        }),
    }
}

/// Parsed body of an `UpdateBaseTimes` response: the active time index
/// and both base time offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseTimeUpdate {
    /// Which of the two offsets is active for incoming packets.
    pub time_index: usize,
    /// The base time offset pair, in ticks.
    pub offsets: [i64; 2],
}

impl BaseTimeUpdate {
    /// Parse the 20-byte body of an `UpdateBaseTimes` response.
    pub fn parse(body: &[u8]) -> Result<Self> {
        fn body_parser(input: &mut &[u8]) -> ModalResult<BaseTimeUpdate> {
            let time_index = be_u32.parse_next(input)?;
            let first = be_i64.parse_next(input)?;
            let second = be_i64.parse_next(input)?;
            Ok(BaseTimeUpdate {
                time_index: (time_index & 1) as usize,
                offsets: [first, second],
            })
        }

        body_parser
            .parse(body)
            .map_err(|e| Error::malformed("base time update", e.to_string()))
    }

    /// Serialize into the 20-byte wire body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(20);
        body.extend_from_slice(&(self.time_index as u32).to_be_bytes());
        body.extend_from_slice(&self.offsets[0].to_be_bytes());
        body.extend_from_slice(&self.offsets[1].to_be_bytes());
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::constants::{ServerCommand, ServerResponse};

    #[test]
    fn test_command_frame_layout() {
        let mut buf = Vec::new();
        let modes = 0xDEADBEEFu32.to_be_bytes();
        write_command_frame(&mut buf, ServerCommand::DEFINE_OPERATIONAL_MODES, &modes);

        assert_eq!(&buf[0..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 5);
        assert_eq!(buf[8], 0x06);
        assert_eq!(&buf[9..], &modes);
    }

    #[test]
    fn test_response_frame_round_trip() {
        let mut buf = Vec::new();
        write_response_frame(
            &mut buf,
            ServerResponse::SUCCEEDED,
            ServerCommand::SUBSCRIBE,
            b"subscribed",
        );

        let header = PayloadHeader::from_bytes(&buf).unwrap();
        header.verify_marker().unwrap();
        assert_eq!(header.payload_size(), 6 + 10);

        let packet = &buf[8..];
        let (response, command, body) = split_response(packet).unwrap();
        assert_eq!(response, ServerResponse::SUCCEEDED);
        assert_eq!(command, ServerCommand::SUBSCRIBE);
        assert_eq!(body, b"subscribed");
    }

    #[test]
    fn test_bad_marker_rejected() {
        let mut buf = Vec::new();
        write_command_frame(&mut buf, ServerCommand::SUBSCRIBE, &[]);
        buf[0] = 0x00;

        let header = PayloadHeader::from_bytes(&buf).unwrap();
        assert!(matches!(
            header.verify_marker(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_short_response_is_resumable() {
        assert!(split_response(&[0x80, 0x02]).unwrap_err().is_resumable());
    }

    #[test]
    fn test_base_time_update_parse() {
        // Scenario from the wire: index 1, offsets 10 and 20.
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&10i64.to_be_bytes());
        body.extend_from_slice(&20i64.to_be_bytes());

        let update = BaseTimeUpdate::parse(&body).unwrap();
        assert_eq!(update.time_index, 1);
        assert_eq!(update.offsets, [10, 20]);
        assert_eq!(update.to_bytes(), body);
    }

    #[test]
    fn test_base_time_update_rejects_short_body() {
        assert!(BaseTimeUpdate::parse(&[0; 12]).is_err());
    }
}
