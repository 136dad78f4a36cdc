//! Fundamental value types carried by the transport.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::util::time;

/// One sample of one signal at one instant.
///
/// Produced by the publisher per sample, decoded by the subscriber per
/// incoming packet, and immutable after decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Globally unique identifier of the signal this sample belongs to.
    pub signal_id: Uuid,
    /// Source half of the human-readable measurement key.
    pub source: String,
    /// Numeric half of the human-readable measurement key.
    pub id: u32,
    /// Human-readable tag describing the measurement, when known.
    pub tag: String,
    /// Instantaneous value.
    pub value: f64,
    /// Additive value modifier.
    pub adder: f64,
    /// Multiplicative value modifier.
    pub multiplier: f64,
    /// Acquisition time in 100 ns ticks since 0001-01-01 UTC.
    pub timestamp: i64,
    /// State flags reported by the acquiring device, see
    /// [`StateFlags`](crate::transport::constants::StateFlags).
    pub flags: u32,
}

impl Default for Measurement {
    fn default() -> Self {
        Self {
            signal_id: Uuid::nil(),
            source: String::new(),
            id: 0,
            tag: String::new(),
            value: f64::NAN,
            adder: 0.0,
            multiplier: 1.0,
            timestamp: 0,
            flags: 0,
        }
    }
}

impl Measurement {
    /// The value after applying the multiplicative and additive modifiers.
    pub fn adjusted_value(&self) -> f64 {
        self.value * self.multiplier + self.adder
    }

    /// The acquisition time as Unix seconds plus milliseconds.
    pub fn unix_time(&self) -> (i64, u16) {
        time::to_unix_time(self.timestamp)
    }
}

/// Signal classification, e.g. phase angle, without the specific kind of
/// voltage or current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignalKind {
    /// Phase angle.
    Angle,
    /// Phase magnitude.
    Magnitude,
    /// Line frequency.
    Frequency,
    /// Frequency delta over time (dF/dt).
    DfDt,
    /// Status flags.
    Status,
    /// Digital value.
    Digital,
    /// Analog value.
    Analog,
    /// Calculated value.
    Calculation,
    /// Statistical value.
    Statistic,
    /// Alarm value.
    Alarm,
    /// Quality flags.
    Quality,
    /// Undetermined signal type.
    #[default]
    Unknown,
}

impl SignalKind {
    /// The two-letter wire acronym for this kind.
    pub fn acronym(self) -> &'static str {
        match self {
            Self::Angle => "PA",
            Self::Magnitude => "PM",
            Self::Frequency => "FQ",
            Self::DfDt => "DF",
            Self::Status => "SF",
            Self::Digital => "DV",
            Self::Analog => "AV",
            Self::Calculation => "CV",
            Self::Statistic => "ST",
            Self::Alarm => "AL",
            Self::Quality => "QF",
            Self::Unknown => "??",
        }
    }

    /// The human-readable description for this kind.
    pub fn description(self) -> &'static str {
        match self {
            Self::Angle => "Angle",
            Self::Magnitude => "Magnitude",
            Self::Frequency => "Frequency",
            Self::DfDt => "DfDt",
            Self::Status => "Status",
            Self::Digital => "Digital",
            Self::Analog => "Analog",
            Self::Calculation => "Calculation",
            Self::Statistic => "Statistic",
            Self::Alarm => "Alarm",
            Self::Quality => "Quality",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a two-letter acronym. Unrecognized input maps to
    /// [`SignalKind::Unknown`].
    pub fn parse_acronym(acronym: &str) -> Self {
        match acronym {
            "PA" => Self::Angle,
            "PM" => Self::Magnitude,
            "FQ" => Self::Frequency,
            "DF" => Self::DfDt,
            "SF" => Self::Status,
            "DV" => Self::Digital,
            "AV" => Self::Analog,
            "CV" => Self::Calculation,
            "ST" => Self::Statistic,
            "AL" => Self::Alarm,
            "QF" => Self::Quality,
            _ => Self::Unknown,
        }
    }
}

/// A parsed signal reference: device acronym, signal kind, and the
/// 1-based index for phasors, digitals and analogs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalReference {
    /// Unique identifier of the referenced measurement.
    pub signal_id: Uuid,
    /// Associated (parent) device acronym.
    pub acronym: String,
    /// Ordered index for indexed signal types, 0 when not indexed.
    pub index: u16,
    /// Signal classification.
    pub kind: SignalKind,
}

impl FromStr for SignalReference {
    type Err = std::convert::Infallible;

    /// Parse a `"ACRONYM-KIND"` or `"ACRONYM-KIND<index>"` reference,
    /// e.g. `"CORDOVA-PA2"`. A reference may contain multiple dashes;
    /// only the last one separates the signal type.
    fn from_str(signal: &str) -> std::result::Result<Self, Self::Err> {
        let mut reference = Self::default();

        match signal.rfind('-') {
            None => {
                // Malformed input - the best recovery is to treat the
                // whole string as the device acronym.
                reference.acronym = signal.trim().to_uppercase();
            }
            Some(split) => {
                let signal_type = signal[split + 1..].trim().to_uppercase();
                reference.acronym = signal[..split].trim().to_uppercase();

                if signal_type.len() > 2 {
                    // Indexed signal type, e.g. CORDOVA-PA2.
                    let (acronym, index) = signal_type.split_at_checked(2).unwrap_or(("", ""));
                    reference.kind = SignalKind::parse_acronym(acronym);

                    if reference.kind != SignalKind::Unknown {
                        reference.index = index.parse().unwrap_or(0);
                    }
                } else {
                    reference.kind = SignalKind::parse_acronym(&signal_type);
                }
            }
        }

        Ok(reference)
    }
}

impl fmt::Display for SignalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index > 0 {
            write!(f, "{}-{}{}", self.acronym, self.kind.acronym(), self.index)
        } else {
            write!(f, "{}-{}", self.acronym, self.kind.acronym())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjusted_value() {
        let m = Measurement {
            value: 2.0,
            multiplier: 3.0,
            adder: 0.5,
            ..Default::default()
        };
        assert_eq!(m.adjusted_value(), 6.5);
    }

    #[test]
    fn test_default_measurement() {
        let m = Measurement::default();
        assert!(m.value.is_nan());
        assert_eq!(m.multiplier, 1.0);
        assert_eq!(m.adder, 0.0);
        assert_eq!(m.flags, 0);
    }

    #[test]
    fn test_signal_kind_acronym_round_trip() {
        for kind in [
            SignalKind::Angle,
            SignalKind::Magnitude,
            SignalKind::Frequency,
            SignalKind::DfDt,
            SignalKind::Status,
            SignalKind::Digital,
            SignalKind::Analog,
            SignalKind::Calculation,
            SignalKind::Statistic,
            SignalKind::Alarm,
            SignalKind::Quality,
        ] {
            assert_eq!(SignalKind::parse_acronym(kind.acronym()), kind);
        }
        assert_eq!(SignalKind::parse_acronym("ZZ"), SignalKind::Unknown);
    }

    #[test]
    fn test_signal_reference_parsing() {
        let r: SignalReference = "CORDOVA-PA2".parse().unwrap();
        assert_eq!(r.acronym, "CORDOVA");
        assert_eq!(r.kind, SignalKind::Angle);
        assert_eq!(r.index, 2);
        assert_eq!(r.to_string(), "CORDOVA-PA2");

        let r: SignalReference = "SHELBY-FQ".parse().unwrap();
        assert_eq!(r.acronym, "SHELBY");
        assert_eq!(r.kind, SignalKind::Frequency);
        assert_eq!(r.index, 0);
        assert_eq!(r.to_string(), "SHELBY-FQ");

        // Multiple dashes: only the last one splits.
        let r: SignalReference = "TVA-CORDOVA-PM1".parse().unwrap();
        assert_eq!(r.acronym, "TVA-CORDOVA");
        assert_eq!(r.kind, SignalKind::Magnitude);
        assert_eq!(r.index, 1);
    }

    #[test]
    fn test_signal_reference_without_dash() {
        let r: SignalReference = "shelby".parse().unwrap();
        assert_eq!(r.acronym, "SHELBY");
        assert_eq!(r.kind, SignalKind::Unknown);
    }
}
