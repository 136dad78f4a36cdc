//! TSSC stream decoder.

use bytes::Bytes;

use super::point::PointState;
use crate::transport::constants::TsscCode;
use crate::transport::error::{Error, Result};
use crate::util::varint;

/// Stateful decoder for TSSC-compressed measurement blocks.
///
/// One decoder serves one subscription for its lifetime; state carries
/// across blocks. [`Decoder::reset`] returns it to the initial state,
/// which both ends perform in lockstep via the sequence-number protocol.
#[derive(Debug)]
pub struct Decoder {
    data: Bytes,
    position: usize,
    last_position: usize,

    prev_timestamp1: i64,
    prev_timestamp2: i64,

    prev_time_delta1: i64,
    prev_time_delta2: i64,
    prev_time_delta3: i64,
    prev_time_delta4: i64,

    points: Vec<Option<PointState>>,
    /// State in play before the first point of the stream is identified.
    initial: PointState,
    /// Index of the point that carried the previous measurement; `None`
    /// until the first measurement decodes.
    last: Option<u16>,

    bit_stream_count: u32,
    bit_stream_cache: u32,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Create a decoder in the initial state.
    pub fn new() -> Self {
        Self {
            data: Bytes::new(),
            position: 0,
            last_position: 0,
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_delta1: i64::MAX,
            prev_time_delta2: i64::MAX,
            prev_time_delta3: i64::MAX,
            prev_time_delta4: i64::MAX,
            points: Vec::new(),
            initial: PointState::new(),
            last: None,
            bit_stream_count: 0,
            bit_stream_cache: 0,
        }
    }

    /// Drop all per-point state and history. All points must be
    /// re-learned from the stream.
    pub fn reset(&mut self) {
        self.data = Bytes::new();
        self.points.clear();
        self.initial = PointState::new();
        self.last = None;
        self.position = 0;
        self.last_position = 0;
        self.clear_bit_stream();
        self.prev_time_delta1 = i64::MAX;
        self.prev_time_delta2 = i64::MAX;
        self.prev_time_delta3 = i64::MAX;
        self.prev_time_delta4 = i64::MAX;
        self.prev_timestamp1 = 0;
        self.prev_timestamp2 = 0;
    }

    /// Point the decoder at the next block of compressed data.
    pub fn set_buffer(&mut self, data: impl Into<Bytes>) {
        self.clear_bit_stream();
        self.data = data.into();
        self.position = 0;
        self.last_position = self.data.len();
    }

    /// Decode the next measurement in the current block, or `None` at
    /// end of stream.
    pub fn try_get_measurement(&mut self) -> Result<Option<(u16, i64, u32, f32)>> {
        if self.position == self.last_position && self.bit_stream_is_empty() {
            self.clear_bit_stream();
            return Ok(None);
        }

        // The most recent point carries the code table for the next
        // measurement; streams usually have enough sequence to them
        // that this prediction holds.
        let mut code = self.read_code(self.last)?;

        if code == TsscCode::END_OF_STREAM {
            self.clear_bit_stream();
            return Ok(None);
        }

        if code <= TsscCode::POINT_ID_XOR16 {
            self.decode_point_id(code, self.last)?;
            code = self.read_code(self.last)?;

            if code < TsscCode::TIME_DELTA1_FORWARD {
                return Err(self.unexpected_code(TsscCode::TIME_DELTA1_FORWARD, code));
            }
        }

        let id = self.point(self.last).prev_next_point_id;
        self.ensure_point(id);

        let timestamp = if code <= TsscCode::TIME_XOR_7BIT {
            let timestamp = self.decode_timestamp(code)?;
            code = self.read_code(self.last)?;

            if code < TsscCode::QUALITY2 {
                return Err(self.unexpected_code(TsscCode::QUALITY2, code));
            }

            timestamp
        } else {
            self.prev_timestamp1
        };

        let quality = if code <= TsscCode::QUALITY_7BIT32 {
            let quality = self.decode_quality(code, id)?;
            code = self.read_code(self.last)?;

            if code < TsscCode::VALUE1 {
                return Err(self.unexpected_code(TsscCode::VALUE1, code));
            }

            quality
        } else {
            self.point(Some(id)).prev_quality1
        };

        // Values change nearly every sample, so this path stays inline.
        let point = self.point(Some(id));
        let (prev1, prev2, prev3) = (point.prev_value1, point.prev_value2, point.prev_value3);

        let value_raw = match code {
            TsscCode::VALUE1 => prev1,
            TsscCode::VALUE2 => {
                let point = self.point_mut(Some(id));
                point.prev_value2 = prev1;
                point.prev_value1 = prev2;
                prev2
            }
            TsscCode::VALUE3 => {
                let point = self.point_mut(Some(id));
                point.prev_value3 = prev2;
                point.prev_value2 = prev1;
                point.prev_value1 = prev3;
                prev3
            }
            TsscCode::VALUE_ZERO => {
                let point = self.point_mut(Some(id));
                point.prev_value3 = point.prev_value2;
                point.prev_value2 = point.prev_value1;
                point.prev_value1 = 0;
                0
            }
            _ => {
                let xor = match code {
                    TsscCode::VALUE_XOR4 => u32::from(self.read_bits4()?),
                    TsscCode::VALUE_XOR8 => u32::from(self.read_byte()?),
                    TsscCode::VALUE_XOR12 => {
                        u32::from(self.read_bits4()?) | u32::from(self.read_byte()?) << 4
                    }
                    TsscCode::VALUE_XOR16 => {
                        u32::from(self.read_byte()?) | u32::from(self.read_byte()?) << 8
                    }
                    TsscCode::VALUE_XOR20 => {
                        u32::from(self.read_bits4()?)
                            | u32::from(self.read_byte()?) << 4
                            | u32::from(self.read_byte()?) << 12
                    }
                    TsscCode::VALUE_XOR24 => {
                        u32::from(self.read_byte()?)
                            | u32::from(self.read_byte()?) << 8
                            | u32::from(self.read_byte()?) << 16
                    }
                    TsscCode::VALUE_XOR28 => {
                        u32::from(self.read_bits4()?)
                            | u32::from(self.read_byte()?) << 4
                            | u32::from(self.read_byte()?) << 12
                            | u32::from(self.read_byte()?) << 20
                    }
                    TsscCode::VALUE_XOR32 => {
                        u32::from(self.read_byte()?)
                            | u32::from(self.read_byte()?) << 8
                            | u32::from(self.read_byte()?) << 16
                            | u32::from(self.read_byte()?) << 24
                    }
                    invalid => {
                        return Err(Error::malformed(
                            "TSSC stream",
                            format!(
                                "invalid code {invalid} at position {} with last position {}",
                                self.position, self.last_position
                            ),
                        ));
                    }
                };

                let value_raw = xor ^ prev1;
                let point = self.point_mut(Some(id));
                point.prev_value3 = point.prev_value2;
                point.prev_value2 = point.prev_value1;
                point.prev_value1 = value_raw;
                value_raw
            }
        };

        self.last = Some(id);

        Ok(Some((id, timestamp, quality, f32::from_bits(value_raw))))
    }

    fn unexpected_code(&self, expecting: u8, received: u8) -> Error {
        Error::malformed(
            "TSSC stream",
            format!(
                "expecting code >= {expecting}, received {received} at position {} \
                 with last position {}",
                self.position, self.last_position
            ),
        )
    }

    fn decode_point_id(&mut self, code: u8, which: Option<u16>) -> Result<()> {
        let xor = match code {
            TsscCode::POINT_ID_XOR4 => u16::from(self.read_bits4()?),
            TsscCode::POINT_ID_XOR8 => u16::from(self.read_byte()?),
            TsscCode::POINT_ID_XOR12 => {
                u16::from(self.read_bits4()?) | u16::from(self.read_byte()?) << 4
            }
            _ => u16::from(self.read_byte()?) | u16::from(self.read_byte()?) << 8,
        };

        self.point_mut(which).prev_next_point_id ^= xor;
        Ok(())
    }

    fn decode_timestamp(&mut self, code: u8) -> Result<i64> {
        // Wrapping arithmetic: a corrupt stream may request a delta that
        // was never learned, where the sentinel i64::MAX would overflow.
        let timestamp = match code {
            TsscCode::TIME_DELTA1_FORWARD => {
                self.prev_timestamp1.wrapping_add(self.prev_time_delta1)
            }
            TsscCode::TIME_DELTA2_FORWARD => {
                self.prev_timestamp1.wrapping_add(self.prev_time_delta2)
            }
            TsscCode::TIME_DELTA3_FORWARD => {
                self.prev_timestamp1.wrapping_add(self.prev_time_delta3)
            }
            TsscCode::TIME_DELTA4_FORWARD => {
                self.prev_timestamp1.wrapping_add(self.prev_time_delta4)
            }
            TsscCode::TIME_DELTA1_REVERSE => {
                self.prev_timestamp1.wrapping_sub(self.prev_time_delta1)
            }
            TsscCode::TIME_DELTA2_REVERSE => {
                self.prev_timestamp1.wrapping_sub(self.prev_time_delta2)
            }
            TsscCode::TIME_DELTA3_REVERSE => {
                self.prev_timestamp1.wrapping_sub(self.prev_time_delta3)
            }
            TsscCode::TIME_DELTA4_REVERSE => {
                self.prev_timestamp1.wrapping_sub(self.prev_time_delta4)
            }
            TsscCode::TIMESTAMP2 => self.prev_timestamp2,
            _ => {
                let xor = varint::read_u64(&self.data, &mut self.position)?;
                self.prev_timestamp1 ^ xor as i64
            }
        };

        self.update_time_deltas(timestamp);

        self.prev_timestamp2 = self.prev_timestamp1;
        self.prev_timestamp1 = timestamp;

        Ok(timestamp)
    }

    /// Remember the smallest four distinct |Δt| values seen so far.
    fn update_time_deltas(&mut self, timestamp: i64) {
        let min_delta = self.prev_timestamp1.wrapping_sub(timestamp).wrapping_abs();

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
    }

    fn decode_quality(&mut self, code: u8, id: u16) -> Result<u32> {
        let quality = if code == TsscCode::QUALITY2 {
            self.point(Some(id)).prev_quality2
        } else {
            varint::read_u32(&self.data, &mut self.position)?
        };

        let point = self.point_mut(Some(id));
        point.prev_quality2 = point.prev_quality1;
        point.prev_quality1 = quality;

        Ok(quality)
    }

    /// Read the next code word through the given point's code table.
    fn read_code(&mut self, which: Option<u16>) -> Result<u8> {
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

        let code = match mode {
            1 => self.read_bits5()?,
            2 => {
                if self.read_bit()? == 1 {
                    mode21
                } else {
                    self.read_bits5()?
                }
            }
            3 => {
                if self.read_bit()? == 1 {
                    mode31
                } else if self.read_bit()? == 1 {
                    mode301
                } else {
                    self.read_bits5()?
                }
            }
            4 => {
                if self.read_bit()? == 1 {
                    mode41
                } else if self.read_bit()? == 1 {
                    mode401
                } else if self.read_bit()? == 1 {
                    mode4001
                } else {
                    self.read_bits5()?
                }
            }
            unsupported => {
                return Err(Error::malformed(
                    "TSSC stream",
                    format!("unsupported compression mode {unsupported}"),
                ));
            }
        };

        self.point_mut(which).update_code_statistics(code);
        Ok(code)
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
            Some(id) => {
                self.points[usize::from(id)].get_or_insert_with(PointState::new)
            }
        }
    }

    /// Create the state for `id` on first appearance, predicting `id + 1`
    /// as its successor.
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

    /// The learned Δt slots, smallest first. Unlearned slots hold
    /// `i64::MAX`.
    #[cfg(test)]
    pub(crate) fn time_deltas(&self) -> [i64; 4] {
        [
            self.prev_time_delta1,
            self.prev_time_delta2,
            self.prev_time_delta3,
            self.prev_time_delta4,
        ]
    }

    fn bit_stream_is_empty(&self) -> bool {
        self.bit_stream_count == 0
    }

    fn clear_bit_stream(&mut self) {
        self.bit_stream_count = 0;
        self.bit_stream_cache = 0;
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.position).ok_or_else(|| {
            Error::malformed("TSSC stream", "byte read past end of block")
        })?;
        self.position += 1;
        Ok(byte)
    }

    fn read_bit(&mut self) -> Result<u8> {
        if self.bit_stream_count == 0 {
            self.bit_stream_cache = u32::from(self.read_byte()?);
            self.bit_stream_count = 8;
        }

        self.bit_stream_count -= 1;
        Ok(((self.bit_stream_cache >> self.bit_stream_count) & 1) as u8)
    }

    fn read_bits4(&mut self) -> Result<u8> {
        Ok(self.read_bit()? << 3 | self.read_bit()? << 2 | self.read_bit()? << 1 | self.read_bit()?)
    }

    fn read_bits5(&mut self) -> Result<u8> {
        Ok(self.read_bit()? << 4
            | self.read_bit()? << 3
            | self.read_bit()? << 2
            | self.read_bit()? << 1
            | self.read_bit()?)
    }
}
