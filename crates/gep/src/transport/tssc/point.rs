//! Per-point codec state.
//!
//! Every signal index that appears in a TSSC stream gets one of these.
//! Besides the value/quality history, each point owns an adaptive code
//! table: a rolling histogram of the codes it emits, periodically
//! collapsed into one of four prefix modes. Encoder and decoder run the
//! identical, deterministic adaptation so their tables never diverge.

use crate::transport::constants::TsscCode;

/// Number of distinct code words tracked by the histogram.
const COMMAND_STATS_LENGTH: usize = 32;

/// Codec state retained per signal index.
#[derive(Debug, Clone)]
pub(super) struct PointState {
    commands_sent_since_last_change: u32,
    command_stats: [u32; COMMAND_STATS_LENGTH],
    startup_mode: u8,

    /// Active code-table mode, 1 through 4.
    pub mode: u8,
    /// Mode 2: the code behind the 1-bit prefix.
    pub mode21: u8,
    /// Mode 3: the codes behind the 1-bit and 2-bit prefixes.
    pub mode31: u8,
    pub mode301: u8,
    /// Mode 4: the codes behind the 1-bit, 2-bit and 3-bit prefixes.
    pub mode41: u8,
    pub mode401: u8,
    pub mode4001: u8,

    /// Predicted next point id.
    pub prev_next_point_id: u16,
    pub prev_quality1: u32,
    pub prev_quality2: u32,
    pub prev_value1: u32,
    pub prev_value2: u32,
    pub prev_value3: u32,
}

impl PointState {
    /// Fresh state. New points start in mode 4 predicting the three
    /// value-reuse codes, which dominate steady-state streams.
    pub fn new() -> Self {
        Self {
            commands_sent_since_last_change: 0,
            command_stats: [0; COMMAND_STATS_LENGTH],
            startup_mode: 0,
            mode: 4,
            mode21: 0,
            mode31: 0,
            mode301: 0,
            mode41: TsscCode::VALUE1,
            mode401: TsscCode::VALUE2,
            mode4001: TsscCode::VALUE3,
            prev_next_point_id: 0,
            prev_quality1: 0,
            prev_quality2: 0,
            prev_value1: 0,
            prev_value2: 0,
            prev_value3: 0,
        }
    }

    /// Record one emitted code and re-adapt the table when due: after the
    /// first 5 codes, again after 20, then every 100.
    pub fn update_code_statistics(&mut self, code: u8) {
        self.commands_sent_since_last_change += 1;
        self.command_stats[usize::from(code)] += 1;

        if self.startup_mode == 0 && self.commands_sent_since_last_change > 5 {
            self.startup_mode += 1;
            self.adapt_commands();
        } else if self.startup_mode == 1 && self.commands_sent_since_last_change > 20 {
            self.startup_mode += 1;
            self.adapt_commands();
        } else if self.startup_mode == 2 && self.commands_sent_since_last_change > 100 {
            self.adapt_commands();
        }
    }

    /// Pick the cheapest of the four prefix modes for the histogram just
    /// collected, then reset the histogram.
    fn adapt_commands(&mut self) {
        let mut code1 = 0u8;
        let mut count1 = 0u32;
        let mut code2 = 1u8;
        let mut count2 = 0u32;
        let mut code3 = 2u8;
        let mut count3 = 0u32;
        let mut total = 0u32;

        for i in 0..COMMAND_STATS_LENGTH {
            let count = self.command_stats[i];
            self.command_stats[i] = 0;

            total += count;

            if count > count3 {
                if count > count1 {
                    code3 = code2;
                    count3 = count2;

                    code2 = code1;
                    count2 = count1;

                    code1 = i as u8;
                    count1 = count;
                } else if count > count2 {
                    code3 = code2;
                    count3 = count2;

                    code2 = i as u8;
                    count2 = count;
                } else {
                    code3 = i as u8;
                    count3 = count;
                }
            }
        }

        let mode1_size = total * 5;
        let mode2_size = count1 + (total - count1) * 6;
        let mode3_size = count1 + count2 * 2 + (total - count1 - count2) * 7;
        let mode4_size =
            count1 + count2 * 2 + count3 * 3 + (total - count1 - count2 - count3) * 8;

        let min_size = mode1_size
            .min(mode2_size)
            .min(mode3_size)
            .min(mode4_size);

        if min_size == mode1_size {
            self.mode = 1;
        } else if min_size == mode2_size {
            self.mode = 2;
            self.mode21 = code1;
        } else if min_size == mode3_size {
            self.mode = 3;
            self.mode31 = code1;
            self.mode301 = code2;
        } else {
            self.mode = 4;
            self.mode41 = code1;
            self.mode401 = code2;
            self.mode4001 = code3;
        }

        self.commands_sent_since_last_change = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_point_predicts_value_reuse() {
        let point = PointState::new();
        assert_eq!(point.mode, 4);
        assert_eq!(point.mode41, TsscCode::VALUE1);
        assert_eq!(point.mode401, TsscCode::VALUE2);
        assert_eq!(point.mode4001, TsscCode::VALUE3);
    }

    #[test]
    fn test_adaptation_is_deterministic() {
        // Two states fed the same code sequence stay identical - the
        // property both ends of the wire rely on.
        let mut a = PointState::new();
        let mut b = PointState::new();

        let sequence: Vec<u8> = (0..500)
            .map(|i| match i % 10 {
                0 => TsscCode::TIME_DELTA1_FORWARD,
                1..=7 => TsscCode::VALUE1,
                8 => TsscCode::VALUE_XOR8,
                _ => TsscCode::QUALITY2,
            })
            .collect();

        for &code in &sequence {
            a.update_code_statistics(code);
            b.update_code_statistics(code);
        }

        assert_eq!(a.mode, b.mode);
        assert_eq!(
            (a.mode41, a.mode401, a.mode4001),
            (b.mode41, b.mode401, b.mode4001)
        );
        assert_eq!(a.mode21, b.mode21);
    }

    #[test]
    fn test_dominant_code_wins_a_short_prefix() {
        let mut point = PointState::new();

        // One code utterly dominates: after adaptation it must sit in a
        // 1-bit slot regardless of the mode chosen.
        for _ in 0..200 {
            point.update_code_statistics(TsscCode::VALUE1);
        }

        match point.mode {
            2 => assert_eq!(point.mode21, TsscCode::VALUE1),
            3 => assert_eq!(point.mode31, TsscCode::VALUE1),
            4 => assert_eq!(point.mode41, TsscCode::VALUE1),
            other => panic!("uniform input should not pick mode {other}"),
        }
    }
}
