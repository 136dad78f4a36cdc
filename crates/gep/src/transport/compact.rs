//! Compact measurement codec.
//!
//! The compact format is a fixed-layout, big-endian, per-record encoding:
//! one state-flag byte, a 16-bit signal index, a float32 value, and zero,
//! two, four, or eight bytes of timestamp depending on the state flags
//! and the subscription's time options.

use super::constants::CompactFlags;
use super::error::{Error, Result};
use super::signal_index_cache::SignalIndexCache;
use super::types::Measurement;
use crate::util::time::TICKS_PER_MILLISECOND;

/// Expand one compact state-flag byte into the full 32-bit flags word.
pub fn map_to_full_flags(compact_flags: u8) -> u32 {
    let mut full_flags = 0;

    if compact_flags & CompactFlags::DATA_RANGE != 0 {
        full_flags |= CompactFlags::DATA_RANGE_MASK;
    }
    if compact_flags & CompactFlags::DATA_QUALITY != 0 {
        full_flags |= CompactFlags::DATA_QUALITY_MASK;
    }
    if compact_flags & CompactFlags::TIME_QUALITY != 0 {
        full_flags |= CompactFlags::TIME_QUALITY_MASK;
    }
    if compact_flags & CompactFlags::SYSTEM_ISSUE != 0 {
        full_flags |= CompactFlags::SYSTEM_ISSUE_MASK;
    }
    if compact_flags & CompactFlags::CALCULATED_VALUE != 0 {
        full_flags |= CompactFlags::CALCULATED_VALUE_MASK;
    }
    if compact_flags & CompactFlags::DISCARDED_VALUE != 0 {
        full_flags |= CompactFlags::DISCARDED_VALUE_MASK;
    }

    full_flags
}

/// Summarize a full 32-bit flags word into the compact state-flag bits.
pub fn map_to_compact_flags(full_flags: u32) -> u8 {
    let mut compact_flags = 0;

    if full_flags & CompactFlags::DATA_RANGE_MASK != 0 {
        compact_flags |= CompactFlags::DATA_RANGE;
    }
    if full_flags & CompactFlags::DATA_QUALITY_MASK != 0 {
        compact_flags |= CompactFlags::DATA_QUALITY;
    }
    if full_flags & CompactFlags::TIME_QUALITY_MASK != 0 {
        compact_flags |= CompactFlags::TIME_QUALITY;
    }
    if full_flags & CompactFlags::SYSTEM_ISSUE_MASK != 0 {
        compact_flags |= CompactFlags::SYSTEM_ISSUE;
    }
    if full_flags & CompactFlags::CALCULATED_VALUE_MASK != 0 {
        compact_flags |= CompactFlags::CALCULATED_VALUE;
    }
    if full_flags & CompactFlags::DISCARDED_VALUE_MASK != 0 {
        compact_flags |= CompactFlags::DISCARDED_VALUE;
    }

    compact_flags
}

/// Codec for compact measurement records within one data packet.
///
/// Stateless per record: every record carries everything needed to decode
/// it, given the subscription's cache and base time offsets.
pub struct CompactMeasurement<'a> {
    cache: &'a SignalIndexCache,
    base_time_offsets: [i64; 2],
    include_time: bool,
    use_millisecond_resolution: bool,
}

impl<'a> CompactMeasurement<'a> {
    /// Create a codec bound to a subscription's cache and time options.
    pub fn new(
        cache: &'a SignalIndexCache,
        base_time_offsets: [i64; 2],
        include_time: bool,
        use_millisecond_resolution: bool,
    ) -> Self {
        Self {
            cache,
            base_time_offsets,
            include_time,
            use_millisecond_resolution,
        }
    }

    /// Byte length of a record given its base-time-offset flag.
    pub fn measurement_byte_length(&self, using_base_time_offset: bool) -> usize {
        let mut byte_length = 7;

        if self.include_time {
            if !using_base_time_offset {
                byte_length += 8;
            } else if !self.use_millisecond_resolution {
                byte_length += 4;
            } else {
                byte_length += 2;
            }
        }

        byte_length
    }

    /// Parse one record at `*offset`, advancing `*offset` past it.
    ///
    /// Record-level failures ([`Error::UnknownSignalIndex`],
    /// [`Error::MissingBaseTime`]) still advance past the record so the
    /// caller can skip it and continue; [`Error::NotEnoughData`] leaves
    /// the offset untouched.
    pub fn try_parse(&self, buffer: &[u8], offset: &mut usize) -> Result<Measurement> {
        let available = buffer.len() - *offset;
        if available < 1 {
            return Err(Error::NotEnoughData {
                needed: 1,
                available,
            });
        }

        let compact_flags = buffer[*offset];
        let using_base_time_offset = compact_flags & CompactFlags::BASE_TIME_OFFSET != 0;
        let time_index = usize::from(compact_flags & CompactFlags::TIME_INDEX != 0);

        let record_length = self.measurement_byte_length(using_base_time_offset);
        if available < record_length {
            return Err(Error::NotEnoughData {
                needed: record_length,
                available,
            });
        }

        let record = &buffer[*offset..*offset + record_length];
        *offset += record_length;

        let signal_index = u16::from_be_bytes([record[1], record[2]]);
        let Some((signal_id, source, id)) = self.cache.measurement_key(signal_index) else {
            return Err(Error::UnknownSignalIndex(signal_index));
        };

        if using_base_time_offset && self.base_time_offsets[time_index] == 0 {
            return Err(Error::MissingBaseTime(time_index));
        }

        let value = f32::from_be_bytes([record[3], record[4], record[5], record[6]]);

        let timestamp = if !self.include_time {
            0
        } else if !using_base_time_offset {
            i64::from_be_bytes(record[7..15].try_into().unwrap_or_default())
        } else if !self.use_millisecond_resolution {
            let ticks = u32::from_be_bytes(record[7..11].try_into().unwrap_or_default());
            i64::from(ticks) + self.base_time_offsets[time_index]
        } else {
            let millis = u16::from_be_bytes([record[7], record[8]]);
            i64::from(millis) * TICKS_PER_MILLISECOND + self.base_time_offsets[time_index]
        };

        Ok(Measurement {
            signal_id,
            source: source.to_string(),
            id,
            value: f64::from(value),
            timestamp,
            flags: map_to_full_flags(compact_flags),
            ..Default::default()
        })
    }

    /// Append the compact encoding of one measurement.
    ///
    /// `signal_index` is the runtime alias the receiving end knows the
    /// signal by; `time_index` selects which base time offset to encode
    /// against when one is usable.
    pub fn encode(
        &self,
        signal_index: u16,
        measurement: &Measurement,
        time_index: usize,
        buffer: &mut Vec<u8>,
    ) {
        let mut compact_flags = map_to_compact_flags(measurement.flags);
        let base = self.base_time_offsets[time_index];

        let using_base_time_offset = self.include_time
            && base != 0
            && measurement.timestamp >= base
            && if self.use_millisecond_resolution {
                (measurement.timestamp - base) / TICKS_PER_MILLISECOND <= i64::from(u16::MAX)
            } else {
                measurement.timestamp - base <= i64::from(u32::MAX)
            };

        if using_base_time_offset {
            compact_flags |= CompactFlags::BASE_TIME_OFFSET;
            if time_index == 1 {
                compact_flags |= CompactFlags::TIME_INDEX;
            }
        }

        buffer.push(compact_flags);
        buffer.extend_from_slice(&signal_index.to_be_bytes());
        buffer.extend_from_slice(&(measurement.value as f32).to_be_bytes());

        if self.include_time {
            if !using_base_time_offset {
                buffer.extend_from_slice(&measurement.timestamp.to_be_bytes());
            } else if !self.use_millisecond_resolution {
                let offset = (measurement.timestamp - base) as u32;
                buffer.extend_from_slice(&offset.to_be_bytes());
            } else {
                let millis = ((measurement.timestamp - base) / TICKS_PER_MILLISECOND) as u16;
                buffer.extend_from_slice(&millis.to_be_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::constants::StateFlags;
    use uuid::Uuid;

    fn cache_with(signal_index: u16) -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache.add_measurement_key(signal_index, Uuid::new_v4(), "PPA", 7);
        cache
    }

    #[test]
    fn test_parse_full_timestamp() {
        // Known wire bytes: flags 0, index 0x002A, value pi, ticks 8.
        let bytes: [u8; 15] = [
            0x00, 0x00, 0x2A, 0x40, 0x49, 0x0F, 0xDB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x08,
        ];
        let cache = cache_with(0x002A);
        let codec = CompactMeasurement::new(&cache, [0, 0], true, false);

        let mut offset = 0;
        let m = codec.try_parse(&bytes, &mut offset).unwrap();

        assert_eq!(offset, 15);
        assert_eq!(m.value as f32, std::f32::consts::PI);
        assert_eq!(m.timestamp, 8);
        assert_eq!(m.source, "PPA");
        assert_eq!(m.id, 7);
        assert_eq!(m.flags, 0);
    }

    #[test]
    fn test_round_trip_all_time_layouts() {
        let cache = cache_with(12);
        let base = 630_000_000_000_000_000i64;
        let timestamp = base + 1_234 * TICKS_PER_MILLISECOND;

        for (include_time, ms_resolution) in
            [(true, false), (true, true), (false, false)]
        {
            let codec = CompactMeasurement::new(&cache, [base, 0], include_time, ms_resolution);
            let m = Measurement {
                signal_id: cache.signal_id(12).unwrap(),
                source: "PPA".into(),
                id: 7,
                value: 59.975,
                timestamp,
                flags: map_to_full_flags(CompactFlags::DATA_QUALITY),
                ..Default::default()
            };

            let mut buffer = Vec::new();
            codec.encode(12, &m, 0, &mut buffer);

            let mut offset = 0;
            let parsed = codec.try_parse(&buffer, &mut offset).unwrap();
            assert_eq!(offset, buffer.len());

            assert_eq!(parsed.signal_id, m.signal_id);
            assert_eq!(parsed.value as f32, 59.975f32);
            assert_eq!(parsed.flags, m.flags);

            if include_time {
                // The millisecond path quantizes to whole milliseconds.
                assert_eq!(parsed.timestamp, m.timestamp);
            } else {
                assert_eq!(parsed.timestamp, 0);
            }
        }
    }

    #[test]
    fn test_full_timestamp_when_offset_overflows() {
        let cache = cache_with(3);
        let base = 1_000;
        let codec = CompactMeasurement::new(&cache, [base, 0], true, false);

        let m = Measurement {
            timestamp: base + i64::from(u32::MAX) + 1,
            ..Default::default()
        };

        let mut buffer = Vec::new();
        codec.encode(3, &m, 0, &mut buffer);

        // Falls back to the 15-byte layout with a full 8-byte timestamp.
        assert_eq!(buffer.len(), 15);
        assert_eq!(buffer[0] & CompactFlags::BASE_TIME_OFFSET, 0);

        let mut offset = 0;
        assert_eq!(codec.try_parse(&buffer, &mut offset).unwrap().timestamp, m.timestamp);
    }

    #[test]
    fn test_not_enough_data_keeps_offset() {
        let cache = cache_with(1);
        let codec = CompactMeasurement::new(&cache, [0, 0], true, false);

        let mut offset = 0;
        let err = codec.try_parse(&[0x00, 0x00, 0x01], &mut offset).unwrap_err();
        assert!(err.is_resumable());
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_unknown_index_skips_record() {
        let cache = cache_with(1);
        let codec = CompactMeasurement::new(&cache, [0, 0], true, false);

        let mut buffer = Vec::new();
        let m = Measurement {
            timestamp: 99,
            value: 1.0,
            ..Default::default()
        };
        codec.encode(2, &m, 0, &mut buffer); // index 2 is not cached
        codec.encode(1, &m, 0, &mut buffer);

        let mut offset = 0;
        let err = codec.try_parse(&buffer, &mut offset).unwrap_err();
        assert!(matches!(err, Error::UnknownSignalIndex(2)));
        assert_eq!(offset, 15); // skipped past the bad record

        let parsed = codec.try_parse(&buffer, &mut offset).unwrap();
        assert_eq!(parsed.timestamp, 99);
    }

    #[test]
    fn test_missing_base_time() {
        let cache = cache_with(1);
        // Decoder has no base times yet; record claims slot 1.
        let codec = CompactMeasurement::new(&cache, [0, 0], true, false);

        let mut record = vec![CompactFlags::BASE_TIME_OFFSET | CompactFlags::TIME_INDEX];
        record.extend_from_slice(&1u16.to_be_bytes());
        record.extend_from_slice(&1.0f32.to_be_bytes());
        record.extend_from_slice(&500u32.to_be_bytes());

        let mut offset = 0;
        let err = codec.try_parse(&record, &mut offset).unwrap_err();
        assert!(matches!(err, Error::MissingBaseTime(1)));
        assert_eq!(offset, record.len());
    }

    #[test]
    fn test_flag_mapping_round_trip() {
        let compact = CompactFlags::DATA_RANGE
            | CompactFlags::TIME_QUALITY
            | CompactFlags::DISCARDED_VALUE;
        let full = map_to_full_flags(compact);

        assert_ne!(full & StateFlags::OVER_RANGE_ERROR, 0);
        assert_ne!(full & StateFlags::BAD_TIME, 0);
        assert_ne!(full & StateFlags::DISCARDED_VALUE, 0);
        assert_eq!(map_to_compact_flags(full), compact);
    }
}
