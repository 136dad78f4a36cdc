//! TSSC stream encoder.

use super::point::PointState;
use crate::transport::constants::TsscCode;
use crate::util::varint;

const BITS28: u32 = 0xFFFFFFF;
const BITS24: u32 = 0xFFFFFF;
const BITS20: u32 = 0xFFFFF;
const BITS16: u32 = 0xFFFF;
const BITS12: u32 = 0xFFF;
const BITS8: u32 = 0xFF;
const BITS4: u32 = 0xF;

/// Headroom kept at the end of a block; once fewer bytes than this
/// remain, the block is full.
const BLOCK_SLACK: usize = 100;

/// Stateful encoder for TSSC-compressed measurement blocks.
///
/// The mirror image of [`Decoder`](super::Decoder): identical per-point
/// state, identical adaptation, so the decoder can follow without any
/// side channel.
#[derive(Debug)]
pub struct Encoder {
    buffer: Vec<u8>,
    capacity: usize,

    prev_timestamp1: i64,
    prev_timestamp2: i64,

    prev_time_delta1: i64,
    prev_time_delta2: i64,
    prev_time_delta3: i64,
    prev_time_delta4: i64,

    points: Vec<Option<PointState>>,
    initial: PointState,
    last: Option<u16>,

    /// Buffer offset of the byte the bit stream is currently filling;
    /// `None` when no bit-stream byte is reserved. Reserving the byte up
    /// front lets code words interleave with byte-aligned fields.
    bit_stream_index: Option<usize>,
    bit_stream_cache_bit_count: u32,
    bit_stream_cache: u32,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Create an encoder in the initial state.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            capacity: 0,
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_delta1: i64::MAX,
            prev_time_delta2: i64::MAX,
            prev_time_delta3: i64::MAX,
            prev_time_delta4: i64::MAX,
            points: Vec::new(),
            initial: PointState::new(),
            last: None,
            bit_stream_index: None,
            bit_stream_cache_bit_count: 0,
            bit_stream_cache: 0,
        }
    }

    /// Drop all per-point state and history. The decoder must be told to
    /// do the same via the sequence-number reset protocol.
    pub fn reset(&mut self) {
        self.buffer = Vec::new();
        self.capacity = 0;
        self.points.clear();
        self.initial = PointState::new();
        self.last = None;
        self.clear_bit_stream();
        self.prev_time_delta1 = i64::MAX;
        self.prev_time_delta2 = i64::MAX;
        self.prev_time_delta3 = i64::MAX;
        self.prev_time_delta4 = i64::MAX;
        self.prev_timestamp1 = 0;
        self.prev_timestamp2 = 0;
    }

    /// Start a new output block bounded at `capacity` bytes. Per-point
    /// state carries over from previous blocks.
    pub fn begin_block(&mut self, capacity: usize) {
        self.clear_bit_stream();
        self.buffer = Vec::with_capacity(capacity.min(4096));
        self.capacity = capacity;
    }

    /// Append one measurement to the block. Returns `false` when the
    /// block is too full to guarantee room; the caller should finish the
    /// block and start another.
    pub fn try_add_measurement(
        &mut self,
        id: u16,
        timestamp: i64,
        quality: u32,
        value: f32,
    ) -> bool {
        if self.capacity.saturating_sub(self.buffer.len()) < BLOCK_SLACK {
            return false;
        }

        self.ensure_point(id);

        if self.point(self.last).prev_next_point_id != id {
            self.write_point_id_change(id);
        }

        if self.prev_timestamp1 != timestamp {
            self.write_timestamp_change(timestamp);
        }

        if self.point(Some(id)).prev_quality1 != quality {
            self.write_quality_change(id, quality);
        }

        let value_raw = value.to_bits();
        let point = self.point(Some(id));
        let (prev1, prev2, prev3) = (point.prev_value1, point.prev_value2, point.prev_value3);

        if prev1 == value_raw {
            self.write_code(self.last, TsscCode::VALUE1);
        } else if prev2 == value_raw {
            self.write_code(self.last, TsscCode::VALUE2);
            let point = self.point_mut(Some(id));
            point.prev_value2 = prev1;
            point.prev_value1 = value_raw;
        } else if prev3 == value_raw {
            self.write_code(self.last, TsscCode::VALUE3);
            let point = self.point_mut(Some(id));
            point.prev_value3 = prev2;
            point.prev_value2 = prev1;
            point.prev_value1 = value_raw;
        } else if value_raw == 0 {
            self.write_code(self.last, TsscCode::VALUE_ZERO);
            let point = self.point_mut(Some(id));
            point.prev_value3 = point.prev_value2;
            point.prev_value2 = point.prev_value1;
            point.prev_value1 = 0;
        } else {
            let bits_changed = value_raw ^ prev1;

            if bits_changed <= BITS4 {
                self.write_code(self.last, TsscCode::VALUE_XOR4);
                self.write_bits(bits_changed & 15, 4);
            } else if bits_changed <= BITS8 {
                self.write_code(self.last, TsscCode::VALUE_XOR8);
                self.buffer.push(bits_changed as u8);
            } else if bits_changed <= BITS12 {
                self.write_code(self.last, TsscCode::VALUE_XOR12);
                self.write_bits(bits_changed & 15, 4);
                self.buffer.push((bits_changed >> 4) as u8);
            } else if bits_changed <= BITS16 {
                self.write_code(self.last, TsscCode::VALUE_XOR16);
                self.buffer.push(bits_changed as u8);
                self.buffer.push((bits_changed >> 8) as u8);
            } else if bits_changed <= BITS20 {
                self.write_code(self.last, TsscCode::VALUE_XOR20);
                self.write_bits(bits_changed & 15, 4);
                self.buffer.push((bits_changed >> 4) as u8);
                self.buffer.push((bits_changed >> 12) as u8);
            } else if bits_changed <= BITS24 {
                self.write_code(self.last, TsscCode::VALUE_XOR24);
                self.buffer.push(bits_changed as u8);
                self.buffer.push((bits_changed >> 8) as u8);
                self.buffer.push((bits_changed >> 16) as u8);
            } else if bits_changed <= BITS28 {
                self.write_code(self.last, TsscCode::VALUE_XOR28);
                self.write_bits(bits_changed & 15, 4);
                self.buffer.push((bits_changed >> 4) as u8);
                self.buffer.push((bits_changed >> 12) as u8);
                self.buffer.push((bits_changed >> 20) as u8);
            } else {
                self.write_code(self.last, TsscCode::VALUE_XOR32);
                self.buffer.push(bits_changed as u8);
                self.buffer.push((bits_changed >> 8) as u8);
                self.buffer.push((bits_changed >> 16) as u8);
                self.buffer.push((bits_changed >> 24) as u8);
            }

            let point = self.point_mut(Some(id));
            point.prev_value3 = point.prev_value2;
            point.prev_value2 = point.prev_value1;
            point.prev_value1 = value_raw;
        }

        self.last = Some(id);

        true
    }

    /// Flush the bit stream with padding and take the finished block.
    pub fn finish_block(&mut self) -> Vec<u8> {
        self.bit_stream_flush();
        self.capacity = 0;
        std::mem::take(&mut self.buffer)
    }

    fn write_point_id_change(&mut self, id: u16) {
        let bits_changed = u32::from(id ^ self.point(self.last).prev_next_point_id);

        if bits_changed <= BITS4 {
            self.write_code(self.last, TsscCode::POINT_ID_XOR4);
            self.write_bits(bits_changed & 15, 4);
        } else if bits_changed <= BITS8 {
            self.write_code(self.last, TsscCode::POINT_ID_XOR8);
            self.buffer.push(bits_changed as u8);
        } else if bits_changed <= BITS12 {
            self.write_code(self.last, TsscCode::POINT_ID_XOR12);
            self.write_bits(bits_changed & 15, 4);
            self.buffer.push((bits_changed >> 4) as u8);
        } else {
            self.write_code(self.last, TsscCode::POINT_ID_XOR16);
            self.buffer.push(bits_changed as u8);
            self.buffer.push((bits_changed >> 8) as u8);
        }

        self.point_mut(self.last).prev_next_point_id = id;
    }

    fn write_timestamp_change(&mut self, timestamp: i64) {
        if self.prev_timestamp2 == timestamp {
            self.write_code(self.last, TsscCode::TIMESTAMP2);
        } else if self.prev_timestamp1 < timestamp {
            if self.prev_timestamp1.wrapping_add(self.prev_time_delta1) == timestamp {
                self.write_code(self.last, TsscCode::TIME_DELTA1_FORWARD);
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta2) == timestamp {
                self.write_code(self.last, TsscCode::TIME_DELTA2_FORWARD);
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta3) == timestamp {
                self.write_code(self.last, TsscCode::TIME_DELTA3_FORWARD);
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta4) == timestamp {
                self.write_code(self.last, TsscCode::TIME_DELTA4_FORWARD);
            } else {
                self.write_code(self.last, TsscCode::TIME_XOR_7BIT);
                varint::write_u64(
                    &mut self.buffer,
                    (timestamp ^ self.prev_timestamp1) as u64,
                );
            }
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta1) == timestamp {
            self.write_code(self.last, TsscCode::TIME_DELTA1_REVERSE);
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta2) == timestamp {
            self.write_code(self.last, TsscCode::TIME_DELTA2_REVERSE);
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta3) == timestamp {
            self.write_code(self.last, TsscCode::TIME_DELTA3_REVERSE);
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta4) == timestamp {
            self.write_code(self.last, TsscCode::TIME_DELTA4_REVERSE);
        } else {
            self.write_code(self.last, TsscCode::TIME_XOR_7BIT);
            varint::write_u64(
                &mut self.buffer,
                (timestamp ^ self.prev_timestamp1) as u64,
            );
        }

        // Remember the smallest four distinct |Δt| values seen so far.
        let min_delta = (self.prev_timestamp1 - timestamp).abs();

        if min_delta < self.prev_time_delta4
            && min_delta != self.prev_time_delta1
            && min_delta != self.prev_time_delta2
            && min_delta != self.prev_time_delta3
        {
            if min_delta < self.prev_time_delta1 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = self.prev_time_delta2;
                self.prev_time_delta2 = self.prev_time_delta1;
                self.prev_time_delta1 = min_delta;
            } else if min_delta < self.prev_time_delta2 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = self.prev_time_delta2;
                self.prev_time_delta2 = min_delta;
            } else if min_delta < self.prev_time_delta3 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = min_delta;
            } else {
                self.prev_time_delta4 = min_delta;
            }
        }

        self.prev_timestamp2 = self.prev_timestamp1;
        self.prev_timestamp1 = timestamp;
    }

    fn write_quality_change(&mut self, id: u16, quality: u32) {
        if self.point(Some(id)).prev_quality2 == quality {
            self.write_code(self.last, TsscCode::QUALITY2);
        } else {
            self.write_code(self.last, TsscCode::QUALITY_7BIT32);
            varint::write_u32(&mut self.buffer, quality);
        }

        let point = self.point_mut(Some(id));
        point.prev_quality2 = point.prev_quality1;
        point.prev_quality1 = quality;
    }

    /// Emit one code word through the given point's code table.
    fn write_code(&mut self, which: Option<u16>, code: u8) {
        let (mode, mode21, mode31, mode301, mode41, mode401, mode4001) = {
            let point = self.point(which);
            (
                point.mode,
                point.mode21,
                point.mode31,
                point.mode301,
                point.mode41,
                point.mode401,
                point.mode4001,
            )
        };

        match mode {
            1 => self.write_bits(u32::from(code), 5),
            2 => {
                if code == mode21 {
                    self.write_bits(1, 1);
                } else {
                    // "0" prefix plus the raw 5-bit code.
                    self.write_bits(u32::from(code), 6);
                }
            }
            3 => {
                if code == mode31 {
                    self.write_bits(1, 1);
                } else if code == mode301 {
                    self.write_bits(1, 2);
                } else {
                    self.write_bits(u32::from(code), 7);
                }
            }
            _ => {
                if code == mode41 {
                    self.write_bits(1, 1);
                } else if code == mode401 {
                    self.write_bits(1, 2);
                } else if code == mode4001 {
                    self.write_bits(1, 3);
                } else {
                    self.write_bits(u32::from(code), 8);
                }
            }
        }

        self.point_mut(which).update_code_statistics(code);
    }

    fn point(&self, which: Option<u16>) -> &PointState {
        match which {
            None => &self.initial,
            Some(id) => self.points[usize::from(id)]
                .as_ref()
                .unwrap_or(&self.initial),
        }
    }

    fn point_mut(&mut self, which: Option<u16>) -> &mut PointState {
        match which {
            None => &mut self.initial,
            Some(id) => self.points[usize::from(id)].get_or_insert_with(PointState::new),
        }
    }

    fn ensure_point(&mut self, id: u16) {
        let index = usize::from(id);
        if index >= self.points.len() {
            self.points.resize(index + 1, None);
        }
        if self.points[index].is_none() {
            let mut point = PointState::new();
            point.prev_next_point_id = id.wrapping_add(1);
            self.points[index] = Some(point);
        }
    }

    fn clear_bit_stream(&mut self) {
        self.bit_stream_index = None;
        self.bit_stream_cache_bit_count = 0;
        self.bit_stream_cache = 0;
    }

    fn write_bits(&mut self, code: u32, length: u32) {
        if self.bit_stream_index.is_none() {
            self.bit_stream_index = Some(self.buffer.len());
            self.buffer.push(0);
        }

        self.bit_stream_cache = (self.bit_stream_cache << length) | code;
        self.bit_stream_cache_bit_count += length;

        if self.bit_stream_cache_bit_count > 7 {
            self.bit_stream_end();
        }
    }

    fn bit_stream_end(&mut self) {
        while self.bit_stream_cache_bit_count > 7 {
            if let Some(index) = self.bit_stream_index {
                self.buffer[index] =
                    (self.bit_stream_cache >> (self.bit_stream_cache_bit_count - 8)) as u8;
            }
            self.bit_stream_cache_bit_count -= 8;

            if self.bit_stream_cache_bit_count > 0 {
                self.bit_stream_index = Some(self.buffer.len());
                self.buffer.push(0);
            } else {
                self.bit_stream_index = None;
            }
        }
    }

    fn bit_stream_flush(&mut self) {
        if self.bit_stream_cache_bit_count == 0 {
            return;
        }

        if self.bit_stream_index.is_none() {
            self.bit_stream_index = Some(self.buffer.len());
            self.buffer.push(0);
        }

        self.write_code(self.last, TsscCode::END_OF_STREAM);

        if self.bit_stream_cache_bit_count > 7 {
            self.bit_stream_end();
        }

        if self.bit_stream_cache_bit_count > 0 {
            // Pad the final partial byte with zeros.
            self.bit_stream_cache <<= 8 - self.bit_stream_cache_bit_count;
            if let Some(index) = self.bit_stream_index {
                self.buffer[index] = self.bit_stream_cache as u8;
            }
            self.bit_stream_cache = 0;
            self.bit_stream_index = None;
            self.bit_stream_cache_bit_count = 0;
        }
    }
}
