//! Cross-codec round trips: the decode of every encode is the input.

use gep::transport::compact::CompactMeasurement;
use gep::transport::signal_index_cache::SignalIndexCache;
use gep::transport::tssc;
use gep::transport::{Measurement, SignalKind};
use gep::util::gzip;
use gep::util::time::{TICKS_PER_MILLISECOND, from_unix_time};
use gep::util::varint;
use uuid::Uuid;

fn test_cache(signal_count: u16) -> SignalIndexCache {
    let mut cache = SignalIndexCache::new();
    for index in 0..signal_count {
        cache.add_measurement_key(index, Uuid::new_v4(), "PPA", u32::from(index) + 1);
    }
    cache
}

#[test]
fn compact_packet_round_trip_mixed_flags() {
    let cache = test_cache(8);
    let base = from_unix_time(1_600_000_000, 0);
    let codec = CompactMeasurement::new(&cache, [base, 0], true, false);

    let originals: Vec<Measurement> = (0..8u16)
        .map(|index| Measurement {
            signal_id: cache.signal_id(index).unwrap(),
            source: "PPA".into(),
            id: u32::from(index) + 1,
            value: f64::from(index) * 0.5 + 59.0,
            timestamp: base + i64::from(index) * TICKS_PER_MILLISECOND * 33,
            flags: if index % 2 == 0 { 0 } else { 0xEF03 },
            ..Default::default()
        })
        .collect();

    let mut body = Vec::new();
    for (index, m) in originals.iter().enumerate() {
        codec.encode(index as u16, m, 0, &mut body);
    }

    let mut offset = 0;
    let mut decoded = Vec::new();
    while offset < body.len() {
        decoded.push(codec.try_parse(&body, &mut offset).unwrap());
    }

    assert_eq!(decoded.len(), originals.len());
    for (got, want) in decoded.iter().zip(&originals) {
        assert_eq!(got.signal_id, want.signal_id);
        assert_eq!(got.source, want.source);
        assert_eq!(got.id, want.id);
        assert_eq!(got.timestamp, want.timestamp);
        assert_eq!(got.flags, want.flags);
        assert_eq!(got.value as f32, want.value as f32);
    }
}

#[test]
fn tssc_large_stream_survives_block_boundaries() {
    let mut encoder = tssc::Encoder::new();
    let mut decoder = tssc::Decoder::new();

    let start = from_unix_time(1_600_000_000, 0);
    let mut originals = Vec::new();
    for frame in 0i64..500 {
        for index in 0u16..20 {
            originals.push((
                index,
                start + frame * 333_333,
                u32::from(index % 3),
                (59.9 + frame as f64 * 0.0001) as f32 + f32::from(index),
            ));
        }
    }

    let mut decoded = Vec::new();
    let mut pending: &[(u16, i64, u32, f32)] = &originals;

    while !pending.is_empty() {
        encoder.begin_block(2048);
        let mut added = 0;
        for &(id, timestamp, quality, value) in pending {
            if !encoder.try_add_measurement(id, timestamp, quality, value) {
                break;
            }
            added += 1;
        }
        pending = &pending[added..];

        decoder.set_buffer(encoder.finish_block());
        while let Some(m) = decoder.try_get_measurement().unwrap() {
            decoded.push(m);
        }
    }

    assert_eq!(decoded, originals);
}

#[test]
fn signal_index_cache_round_trip_through_gzip() {
    let cache = test_cache(50);
    let subscriber_id = Uuid::new_v4();

    let packed = gzip::deflate(&cache.serialize(subscriber_id)).unwrap();
    let (parsed, parsed_id) =
        SignalIndexCache::parse(&gzip::inflate(&packed).unwrap()).unwrap();

    assert_eq!(parsed_id, subscriber_id);
    assert_eq!(parsed.len(), 50);
    for (index, signal_id, source, id) in cache.iter() {
        assert_eq!(parsed.measurement_key(index), Some((signal_id, source, id)));
        assert_eq!(parsed.signal_index_of(signal_id), Some(index));
    }
}

#[test]
fn varint_minimality_sweep() {
    // Every encoding is minimal, and inflating any encoding by one
    // padding byte makes it malformed.
    for shift in 0..32 {
        let value = 1u32 << shift;
        for v in [value.saturating_sub(1), value, value.saturating_add(1)] {
            let mut buf = Vec::new();
            varint::write_u32(&mut buf, v);
            assert_eq!(buf.len(), varint::encoded_len_u32(v), "value {v:#X}");

            let mut pos = 0;
            assert_eq!(varint::read_u32(&buf, &mut pos).unwrap(), v);

            if buf.len() < 5 {
                // Pad: set the continuation flag on the last byte and
                // append an empty final byte.
                let mut padded = buf.clone();
                let last = padded.len() - 1;
                padded[last] |= 0x80;
                padded.push(0);

                let mut pos = 0;
                assert!(
                    varint::read_u32(&padded, &mut pos).is_err(),
                    "padded encoding of {v:#X} must be rejected"
                );
            }
        }
    }

    for shift in 0..64 {
        let value = 1u64 << shift;
        for v in [value.saturating_sub(1), value, value.saturating_add(1)] {
            let mut buf = Vec::new();
            varint::write_u64(&mut buf, v);
            assert_eq!(buf.len(), varint::encoded_len_u64(v), "value {v:#X}");

            let mut pos = 0;
            assert_eq!(varint::read_u64(&buf, &mut pos).unwrap(), v);
        }
    }
}

#[test]
fn signal_reference_display_round_trip() {
    for (text, kind, index) in [
        ("SHELBY-PA1", SignalKind::Angle, 1u16),
        ("SHELBY-PM2", SignalKind::Magnitude, 2),
        ("SHELBY-FQ", SignalKind::Frequency, 0),
        ("SHELBY-SF", SignalKind::Status, 0),
    ] {
        let reference: gep::SignalReference = text.parse().unwrap();
        assert_eq!(reference.kind, kind);
        assert_eq!(reference.index, index);
        assert_eq!(reference.to_string(), text);
    }
}
