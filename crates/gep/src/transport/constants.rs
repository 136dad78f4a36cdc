//! Protocol constants for the Gateway Exchange Protocol.
//!
//! These values are wire invariants: both peers must agree on them
//! byte-for-byte for the protocol to interoperate.

/// Largest frame either channel will carry. UDP datagrams never exceed
/// this; TCP reads are bounded by the advertised payload size.
pub const MAX_PACKET_SIZE: usize = 32768;

/// Size of the payload pre-header on the command channel:
/// 4 marker bytes followed by a little-endian payload size word.
pub const PAYLOAD_HEADER_SIZE: usize = 8;

/// Size of the response header inside a payload: response code,
/// original command code, and four reserved bytes.
pub const RESPONSE_HEADER_SIZE: usize = 6;

/// Marker bytes that open every command-channel payload.
pub const PAYLOAD_MARKER: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// TSSC payload version byte. A different value is a hard protocol error.
pub const TSSC_VERSION: u8 = 85;

/// Server commands sent by a subscriber and received by a publisher.
///
/// Solicited commands receive a [`ServerResponse::SUCCEEDED`] or
/// [`ServerResponse::FAILED`] response carrying the original command code.
pub struct ServerCommand;

impl ServerCommand {
    /// Authenticate. Deprecated on the wire - use TLS instead.
    pub const AUTHENTICATE: u8 = 0x00;
    /// Request an updated metadata set.
    pub const METADATA_REFRESH: u8 = 0x01;
    /// Request a subscription based on the connection string that follows.
    pub const SUBSCRIBE: u8 = 0x02;
    /// Cancel the current subscription.
    pub const UNSUBSCRIBE: u8 = 0x03;
    /// Request a fresh set of cipher keys for data packet encryption.
    pub const ROTATE_CIPHER_KEYS: u8 = 0x04;
    /// Update the temporal processing interval with the value that follows.
    pub const UPDATE_PROCESSING_INTERVAL: u8 = 0x05;
    /// Define operational modes. Must be the first command after connect.
    pub const DEFINE_OPERATIONAL_MODES: u8 = 0x06;
    /// Confirm receipt of a [`ServerResponse::NOTIFY`] message.
    pub const CONFIRM_NOTIFICATION: u8 = 0x07;
    /// Confirm receipt of a [`ServerResponse::BUFFER_BLOCK`] measurement.
    pub const CONFIRM_BUFFER_BLOCK: u8 = 0x08;

    // User-defined command range: 0xD0-0xDF.
    pub const USER_COMMAND_00: u8 = 0xD0;
    pub const USER_COMMAND_15: u8 = 0xDF;

    /// Whether `code` falls in the user-defined command range.
    pub fn is_user_command(code: u8) -> bool {
        (Self::USER_COMMAND_00..=Self::USER_COMMAND_15).contains(&code)
    }
}

/// Server responses sent by a publisher and received by a subscriber.
///
/// Response values are distinct from command values to make wire captures
/// easier to read.
pub struct ServerResponse;

impl ServerResponse {
    /// Solicited command succeeded; original command and message follow.
    pub const SUCCEEDED: u8 = 0x80;
    /// Solicited command failed; original command and message follow.
    pub const FAILED: u8 = 0x81;
    /// Unsolicited data packet follows.
    pub const DATA_PACKET: u8 = 0x82;
    /// Replace the runtime signal index cache with the one that follows.
    pub const UPDATE_SIGNAL_INDEX_CACHE: u8 = 0x83;
    /// Replace the runtime base-timestamp offsets with those that follow.
    pub const UPDATE_BASE_TIMES: u8 = 0x84;
    /// Replace the runtime data cipher keys with those that follow.
    pub const UPDATE_CIPHER_KEYS: u8 = 0x85;
    /// Start time of the data being processed, from the first measurement.
    pub const DATA_START_TIME: u8 = 0x86;
    /// Input processing completed, typically via temporal constraint.
    pub const PROCESSING_COMPLETE: u8 = 0x87;
    /// Raw buffer block follows.
    pub const BUFFER_BLOCK: u8 = 0x88;
    /// Notification message for the client; expects confirmation.
    pub const NOTIFY: u8 = 0x89;
    /// Publisher source configuration changed; a metadata refresh is in order.
    pub const CONFIGURATION_CHANGED: u8 = 0x8A;

    // User-defined response range: 0xE0-0xEF.
    pub const USER_RESPONSE_00: u8 = 0xE0;
    pub const USER_RESPONSE_15: u8 = 0xEF;

    /// Keep-alive ping; carries no payload and requires no action.
    pub const NO_OP: u8 = 0xFF;

    /// Whether `code` falls in the user-defined response range.
    pub fn is_user_response(code: u8) -> bool {
        (Self::USER_RESPONSE_00..=Self::USER_RESPONSE_15).contains(&code)
    }
}

/// Flag bits carried in the first byte of a data packet.
pub struct DataPacketFlags;

impl DataPacketFlags {
    /// Bit set = packet is synchronized and carries a frame-level timestamp.
    pub const SYNCHRONIZED: u8 = 0x01;
    /// Bit set = measurements are in the compact format.
    pub const COMPACT: u8 = 0x02;
    /// Bit set = use the odd cipher index when decrypting, clear = even.
    pub const CIPHER_INDEX: u8 = 0x04;
    /// Bit set = payload is TSSC compressed.
    pub const COMPRESSED: u8 = 0x08;
    /// Bit set = compressed payload is little-endian ordered. Reserved.
    pub const LITTLE_ENDIAN_COMPRESSION: u8 = 0x10;
    /// No flags set: unsynchronized, full-fidelity measurements.
    pub const NO_FLAGS: u8 = 0x00;
}

/// Operational modes requested by a subscriber immediately after connect.
///
/// The mode word must be sent before any other command and cannot be
/// renegotiated. The publisher may silently refuse some requests, such as
/// compression, based on its own configuration.
pub struct OperationalModes;

impl OperationalModes {
    /// Mask for the protocol version number (currently 0).
    pub const VERSION_MASK: u32 = 0x0000001F;
    /// Mask for the compression mode bits.
    pub const COMPRESSION_MODE_MASK: u32 = 0x000000E0;
    /// Mask for the character encoding used in exchanged messages.
    pub const ENCODING_MASK: u32 = 0x00000300;
    /// Bit set = common serialization format for cache and metadata.
    pub const USE_COMMON_SERIALIZATION_FORMAT: u32 = 0x0100_0000;
    /// Bit set = external measurements are exchanged during metadata sync.
    pub const RECEIVE_EXTERNAL_METADATA: u32 = 0x0200_0000;
    /// Bit set = internal measurements are exchanged during metadata sync.
    pub const RECEIVE_INTERNAL_METADATA: u32 = 0x0400_0000;
    /// Bit set = payload data is compressed.
    pub const COMPRESS_PAYLOAD_DATA: u32 = 0x2000_0000;
    /// Bit set = signal index cache is compressed.
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    /// Bit set = metadata is compressed.
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;
    /// No flags set.
    pub const NO_FLAGS: u32 = 0x0000_0000;
}

/// Character encodings selectable in the operational mode word.
pub struct OperationalEncoding;

impl OperationalEncoding {
    /// UTF-16, little endian.
    pub const UNICODE: u32 = 0x0000_0000;
    /// UTF-16, big endian.
    pub const BIG_ENDIAN_UNICODE: u32 = 0x0000_0100;
    /// UTF-8. The only encoding this implementation speaks.
    pub const UTF8: u32 = 0x0000_0200;
    /// ANSI.
    pub const ANSI: u32 = 0x0000_0300;
}

/// Compression modes selectable in the operational mode word.
pub struct CompressionModes;

impl CompressionModes {
    /// GZip compression for metadata and signal-index-cache exchange.
    pub const GZIP: u32 = 0x0000_0020;
    /// TSSC compression for data packet payloads.
    pub const TSSC: u32 = 0x0000_0040;
    /// No compression.
    pub const NONE: u32 = 0x0000_0000;
}

/// Compact measurement state flags, one byte per record.
pub struct CompactFlags;

impl CompactFlags {
    /// A data-range flag is set in the full flags word.
    pub const DATA_RANGE: u8 = 0x01;
    /// A data-quality flag is set in the full flags word.
    pub const DATA_QUALITY: u8 = 0x02;
    /// A time-quality flag is set in the full flags word.
    pub const TIME_QUALITY: u8 = 0x04;
    /// A system-issue flag is set in the full flags word.
    pub const SYSTEM_ISSUE: u8 = 0x08;
    /// The value is calculated.
    pub const CALCULATED_VALUE: u8 = 0x10;
    /// The value was discarded.
    pub const DISCARDED_VALUE: u8 = 0x20;
    /// Timestamp is expressed against a base time offset.
    pub const BASE_TIME_OFFSET: u8 = 0x40;
    /// Which of the two base time offsets applies: set = 1, clear = 0.
    pub const TIME_INDEX: u8 = 0x80;

    /// Full-flag bits summarized by [`CompactFlags::DATA_RANGE`].
    pub const DATA_RANGE_MASK: u32 = 0x0000_00FC;
    /// Full-flag bits summarized by [`CompactFlags::DATA_QUALITY`].
    pub const DATA_QUALITY_MASK: u32 = 0x0000_EF03;
    /// Full-flag bits summarized by [`CompactFlags::TIME_QUALITY`].
    pub const TIME_QUALITY_MASK: u32 = 0x00BF_0000;
    /// Full-flag bits summarized by [`CompactFlags::SYSTEM_ISSUE`].
    pub const SYSTEM_ISSUE_MASK: u32 = 0xE000_0000;
    /// Full-flag bits summarized by [`CompactFlags::CALCULATED_VALUE`].
    pub const CALCULATED_VALUE_MASK: u32 = 0x0000_1000;
    /// Full-flag bits summarized by [`CompactFlags::DISCARDED_VALUE`].
    pub const DISCARDED_VALUE_MASK: u32 = 0x0040_0000;
}

/// Full 32-bit measurement state flags as reported by the acquiring device.
pub struct StateFlags;

impl StateFlags {
    pub const NORMAL: u32 = 0x0;
    pub const BAD_DATA: u32 = 0x1;
    pub const SUSPECT_DATA: u32 = 0x2;
    pub const OVER_RANGE_ERROR: u32 = 0x4;
    pub const UNDER_RANGE_ERROR: u32 = 0x8;
    pub const ALARM_HIGH: u32 = 0x10;
    pub const ALARM_LOW: u32 = 0x20;
    pub const WARNING_HIGH: u32 = 0x40;
    pub const WARNING_LOW: u32 = 0x80;
    pub const FLATLINE_ALARM: u32 = 0x100;
    pub const COMPARISON_ALARM: u32 = 0x200;
    pub const ROC_ALARM: u32 = 0x400;
    pub const RECEIVED_AS_BAD: u32 = 0x800;
    pub const CALCULATED_VALUE: u32 = 0x1000;
    pub const CALCULATION_ERROR: u32 = 0x2000;
    pub const CALCULATION_WARNING: u32 = 0x4000;
    pub const RESERVED_QUALITY_FLAG: u32 = 0x8000;
    pub const BAD_TIME: u32 = 0x10000;
    pub const SUSPECT_TIME: u32 = 0x20000;
    pub const LATE_TIME_ALARM: u32 = 0x40000;
    pub const FUTURE_TIME_ALARM: u32 = 0x80000;
    pub const UP_SAMPLED: u32 = 0x100000;
    pub const DOWN_SAMPLED: u32 = 0x200000;
    pub const DISCARDED_VALUE: u32 = 0x400000;
    pub const RESERVED_TIME_FLAG: u32 = 0x800000;
    pub const USER_DEFINED_FLAG1: u32 = 0x1000000;
    pub const USER_DEFINED_FLAG2: u32 = 0x2000000;
    pub const USER_DEFINED_FLAG3: u32 = 0x4000000;
    pub const USER_DEFINED_FLAG4: u32 = 0x8000000;
    pub const USER_DEFINED_FLAG5: u32 = 0x10000000;
    pub const SYSTEM_ERROR: u32 = 0x20000000;
    pub const SYSTEM_WARNING: u32 = 0x40000000;
    pub const MEASUREMENT_ERROR: u32 = 0x80000000;
}

/// The 29 code words of the TSSC alphabet.
pub struct TsscCode;

impl TsscCode {
    /// Flush padding and end the current payload.
    pub const END_OF_STREAM: u8 = 0;

    pub const POINT_ID_XOR4: u8 = 1;
    pub const POINT_ID_XOR8: u8 = 2;
    pub const POINT_ID_XOR12: u8 = 3;
    pub const POINT_ID_XOR16: u8 = 4;

    pub const TIME_DELTA1_FORWARD: u8 = 5;
    pub const TIME_DELTA2_FORWARD: u8 = 6;
    pub const TIME_DELTA3_FORWARD: u8 = 7;
    pub const TIME_DELTA4_FORWARD: u8 = 8;
    pub const TIME_DELTA1_REVERSE: u8 = 9;
    pub const TIME_DELTA2_REVERSE: u8 = 10;
    pub const TIME_DELTA3_REVERSE: u8 = 11;
    pub const TIME_DELTA4_REVERSE: u8 = 12;
    /// Reuse the timestamp from two samples ago.
    pub const TIMESTAMP2: u8 = 13;
    /// 7-bit varint XOR against the previous timestamp.
    pub const TIME_XOR_7BIT: u8 = 14;

    /// Reuse the quality word from two samples ago.
    pub const QUALITY2: u8 = 15;
    /// 7-bit varint quality word.
    pub const QUALITY_7BIT32: u8 = 16;

    pub const VALUE1: u8 = 17;
    pub const VALUE2: u8 = 18;
    pub const VALUE3: u8 = 19;
    pub const VALUE_ZERO: u8 = 20;
    pub const VALUE_XOR4: u8 = 21;
    pub const VALUE_XOR8: u8 = 22;
    pub const VALUE_XOR12: u8 = 23;
    pub const VALUE_XOR16: u8 = 24;
    pub const VALUE_XOR20: u8 = 25;
    pub const VALUE_XOR24: u8 = 26;
    pub const VALUE_XOR28: u8 = 27;
    pub const VALUE_XOR32: u8 = 28;
}
