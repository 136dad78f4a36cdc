//! Time-Series Special Compression.
//!
//! TSSC is a stateful, bit-level codec built for PMU-style streams where
//! successive values of the same signal differ in only a handful of low
//! bits. Point-id deltas, timestamp deltas, quality deltas, and value
//! XORs interleave on a shared MSB-first bit stream; an adaptive code
//! table per signal shortens the codes each signal actually uses.
//!
//! Both ends run identical state machines. A payload begins with the
//! version byte (85) and a big-endian sequence number; sequence 0 after a
//! non-zero value signals a publisher-initiated reset, and the subscriber
//! requests one after every successful (re)subscribe. The framing itself
//! lives with the engines; this module is the codec proper.

mod decoder;
mod encoder;
mod point;

pub use decoder::Decoder;
pub use encoder::Encoder;

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(measurements: &[(u16, i64, u32, f32)]) {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut decoded = Vec::with_capacity(measurements.len());

        let mut pending = measurements;

        while !pending.is_empty() {
            encoder.begin_block(4096);

            let mut added = 0;
            for &(id, timestamp, quality, value) in pending {
                if !encoder.try_add_measurement(id, timestamp, quality, value) {
                    break;
                }
                added += 1;
            }
            assert!(added > 0, "block slack must still admit one measurement");
            pending = &pending[added..];

            let block = encoder.finish_block();
            decoder.set_buffer(block);

            while let Some(m) = decoder.try_get_measurement().unwrap() {
                decoded.push(m);
            }
        }

        assert_eq!(decoded.len(), measurements.len());
        for (got, want) in decoded.iter().zip(measurements) {
            assert_eq!(got.0, want.0, "point id");
            assert_eq!(got.1, want.1, "timestamp");
            assert_eq!(got.2, want.2, "quality");
            assert_eq!(got.3.to_bits(), want.3.to_bits(), "value bits");
        }
    }

    #[test]
    fn test_single_measurement() {
        round_trip(&[(0, 636_000_000_000_000_000, 0, 59.98)]);
    }

    #[test]
    fn test_sequential_points_shared_timestamp() {
        let timestamp = 636_000_000_000_000_000;
        let batch: Vec<_> = (0u16..30)
            .map(|id| (id, timestamp, 0u32, 120.0 + f32::from(id)))
            .collect();
        round_trip(&batch);
    }

    #[test]
    fn test_steady_stream_learns_deltas() {
        // Three signals sampled 30 times a second; after the first few
        // frames the timestamp should ride the delta codes.
        let mut batch = Vec::new();
        let start = 636_000_000_000_000_000i64;
        for frame in 0..200 {
            let timestamp = start + frame * 333_333;
            for id in 0u16..3 {
                let value = 59.95 + (frame as f32) * 0.001 + f32::from(id);
                batch.push((id, timestamp, 0, value));
            }
        }
        round_trip(&batch);
    }

    #[test]
    fn test_quality_changes_and_repeats() {
        let start = 636_000_000_000_000_000i64;
        let mut batch = Vec::new();
        for frame in 0i64..50 {
            let quality = match frame % 4 {
                0 | 2 => 0u32,
                1 => 0x10,
                _ => 0x4000_0001,
            };
            batch.push((7u16, start + frame * 1_000_000, quality, 1.0));
        }
        round_trip(&batch);
    }

    #[test]
    fn test_value_histories_and_zero() {
        let start = 636_000_000_000_000_000i64;
        let values = [1.5f32, 2.5, 1.5, 0.0, 2.5, 0.0, 1.5, 1.5, 3.75, 2.5];
        let batch: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (3u16, start + i as i64 * 10_000, 0u32, v))
            .collect();
        round_trip(&batch);
    }

    #[test]
    fn test_jumping_timestamps() {
        let start = 636_000_000_000_000_000i64;
        let mut batch = Vec::new();
        // Forward march, a replay backwards, then forward again.
        for frame in 0i64..20 {
            batch.push((0u16, start + frame * 333_333, 0u32, frame as f32));
        }
        for frame in (5i64..15).rev() {
            batch.push((0u16, start + frame * 333_333, 0u32, frame as f32));
        }
        for frame in 20i64..40 {
            batch.push((0u16, start + frame * 333_333, 0u32, frame as f32));
        }
        round_trip(&batch);
    }

    #[test]
    fn test_sparse_point_ids() {
        let start = 636_000_000_000_000_000i64;
        let ids = [2u16, 900, 31, 2, 4096, 900, 2, 31];
        let batch: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, start + i as i64 * 5_000, 0u32, 0.25 * i as f32))
            .collect();
        round_trip(&batch);
    }

    #[test]
    fn test_ten_thousand_measurements_across_blocks() {
        let start = 636_000_000_000_000_000i64;
        let mut batch = Vec::new();
        for frame in 0i64..1000 {
            for id in 0u16..10 {
                let value = match (frame + i64::from(id)) % 7 {
                    0 => 0.0,
                    1 => 59.97,
                    2 => 59.971,
                    3 => -1.0e-3,
                    4 => 1.0e6,
                    5 => f32::from_bits(0x7FC0_0001), // a quiet NaN pattern
                    _ => 42.0,
                };
                batch.push((id, start + frame * 333_333, (frame % 3) as u32, value));
            }
        }
        assert_eq!(batch.len(), 10_000);
        round_trip(&batch);
    }

    #[test]
    fn test_time_delta_memory_is_sorted_and_observed() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        // Timestamps with four distinct strides, revisited repeatedly.
        let strides = [333_333i64, 1_000_000, 40_000, 7];
        let mut timestamp = 636_000_000_000_000_000i64;
        let mut observed = Vec::new();

        encoder.begin_block(8192);
        for round in 0..40 {
            let stride = strides[round % strides.len()];
            timestamp += stride;
            observed.push(stride);
            assert!(encoder.try_add_measurement(0, timestamp, 0, round as f32));
        }
        decoder.set_buffer(encoder.finish_block());
        while decoder.try_get_measurement().unwrap().is_some() {}

        let deltas = decoder.time_deltas();
        for pair in deltas.windows(2) {
            assert!(pair[0] < pair[1], "delta slots must be strictly increasing");
        }
        for delta in deltas.iter().filter(|&&d| d != i64::MAX) {
            assert!(
                observed.contains(delta),
                "remembered delta {delta} never occurred"
            );
        }
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        encoder.begin_block(1024);
        assert!(encoder.try_add_measurement(5, 1_000_000, 0, 1.0));
        decoder.set_buffer(encoder.finish_block());
        assert!(decoder.try_get_measurement().unwrap().is_some());

        encoder.reset();
        decoder.reset();

        // After a joint reset the codecs resynchronize from scratch.
        encoder.begin_block(1024);
        assert!(encoder.try_add_measurement(5, 2_000_000, 7, 2.0));
        decoder.set_buffer(encoder.finish_block());

        let (id, timestamp, quality, value) =
            decoder.try_get_measurement().unwrap().unwrap();
        assert_eq!((id, timestamp, quality), (5, 2_000_000, 7));
        assert_eq!(value, 2.0);
        assert!(decoder.try_get_measurement().unwrap().is_none());
    }

    #[test]
    fn test_full_block_refuses_more() {
        let mut encoder = Encoder::new();
        encoder.begin_block(120);

        let mut accepted = 0;
        for i in 0..100 {
            if !encoder.try_add_measurement(i, 1_000_000 + i64::from(i), 0, i as f32) {
                break;
            }
            accepted += 1;
        }

        assert!(accepted > 0);
        assert!(accepted < 100, "a 120-byte block cannot hold 100 records");
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = Decoder::new();
        // A stream of 0xFF bits decodes Value1 prefixes until the byte
        // supply runs dry mid-record; the decoder must error, not panic.
        decoder.set_buffer(vec![0b0001_0101u8]); // "000" prefix + 5-bit code 21 (ValueXOR4)
        let result = decoder.try_get_measurement();
        assert!(result.is_err() || result.unwrap().is_none());
    }
}
