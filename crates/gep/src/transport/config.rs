//! Subscription configuration and the wire connection string.
//!
//! The `Subscribe` command body carries a semicolon-separated key=value
//! string describing the subscription. The typed [`SubscriptionInfo`]
//! is the only way to build one; raw strings are not accepted.

use std::collections::HashMap;

/// Configuration for one subscription.
///
/// Supplied to [`subscribe`](crate::transport::DataSubscriber::subscribe),
/// copied into the engine, and read-only until the next subscribe call.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    /// Filter expression selecting the measurements to subscribe.
    /// Opaque to the transport; forwarded verbatim to the publisher.
    pub filter_expression: String,

    /// Request down-sampled delivery of only the latest measurements.
    pub throttled: bool,
    /// Delivery interval in seconds when throttled.
    pub publish_interval: f64,

    /// Receive data packets on a separate UDP channel.
    pub udp_data_channel: bool,
    /// Local UDP port to bind when the data channel is enabled.
    pub data_channel_local_port: u16,

    /// Carry per-measurement timestamps in data packets.
    pub include_time: bool,
    /// Accept millisecond (rather than tick) timestamp resolution to
    /// shrink compact records.
    pub use_millisecond_resolution: bool,

    /// Allowed past deviation of timestamps, in seconds.
    pub lag_time: f64,
    /// Allowed future deviation of timestamps, in seconds.
    pub lead_time: f64,
    /// Use the subscriber's clock, not timestamps, as real time.
    pub use_local_clock_as_real_time: bool,

    /// Request waveform-synchronized delivery.
    pub remotely_synchronized: bool,
    /// Additional raw connection-string parameters appended verbatim.
    pub extra_connection_string_parameters: String,

    /// Start of a historical replay window, empty for real-time.
    pub start_time: String,
    /// End of a historical replay window, empty for real-time.
    pub stop_time: String,
    /// Extra parameters for the temporal constraint.
    pub constraint_parameters: String,
    /// Temporal processing interval in milliseconds; -1 selects the
    /// publisher's default real-time rate, 0 means as-fast-as-possible.
    pub processing_interval: i32,

    /// Ask the publisher to drop NaN-valued measurements.
    pub request_nan_value_filter: bool,
}

impl Default for SubscriptionInfo {
    fn default() -> Self {
        Self {
            filter_expression: String::new(),
            throttled: false,
            publish_interval: 0.0,
            udp_data_channel: false,
            data_channel_local_port: 9500,
            include_time: true,
            use_millisecond_resolution: false,
            lag_time: 10.0,
            lead_time: 5.0,
            use_local_clock_as_real_time: false,
            remotely_synchronized: false,
            extra_connection_string_parameters: String::new(),
            start_time: String::new(),
            stop_time: String::new(),
            constraint_parameters: String::new(),
            processing_interval: -1,
            request_nan_value_filter: false,
        }
    }
}

impl SubscriptionInfo {
    /// Build the connection string sent in the `Subscribe` body.
    pub fn to_connection_string(&self) -> String {
        let mut s = String::with_capacity(256);

        s.push_str(&format!("trackLatestMeasurements={};", self.throttled));
        s.push_str(&format!("publishInterval={};", self.publish_interval));
        s.push_str(&format!("includeTime={};", self.include_time));
        s.push_str(&format!("lagTime={};", self.lag_time));
        s.push_str(&format!("leadTime={};", self.lead_time));
        s.push_str(&format!(
            "useLocalClockAsRealTime={};",
            self.use_local_clock_as_real_time
        ));
        s.push_str(&format!("processingInterval={};", self.processing_interval));
        s.push_str(&format!(
            "useMillisecondResolution={};",
            self.use_millisecond_resolution
        ));
        s.push_str(&format!(
            "requestNaNValueFilter={};",
            self.request_nan_value_filter
        ));
        s.push_str(&format!(
            "assemblyInfo={{source=gep; version={}}};",
            env!("CARGO_PKG_VERSION")
        ));

        if !self.filter_expression.is_empty() {
            s.push_str(&format!(
                "inputMeasurementKeys={{{}}};",
                self.filter_expression
            ));
        }

        if self.udp_data_channel {
            s.push_str(&format!(
                "dataChannel={{localport={}}};",
                self.data_channel_local_port
            ));
        }

        if !self.start_time.is_empty() {
            s.push_str(&format!("startTimeConstraint={};", self.start_time));
        }

        if !self.stop_time.is_empty() {
            s.push_str(&format!("stopTimeConstraint={};", self.stop_time));
        }

        if !self.constraint_parameters.is_empty() {
            s.push_str(&format!(
                "timeConstraintParameters={};",
                self.constraint_parameters
            ));
        }

        if !self.extra_connection_string_parameters.is_empty() {
            s.push_str(&self.extra_connection_string_parameters);
            s.push(';');
        }

        s
    }
}

/// Parsed view of a connection string, publisher side.
///
/// Values live as verbatim strings; typed accessors interpret them the
/// way the wire writes them. Braced values (`key={a=1; b=2}`) keep their
/// inner text with the braces stripped.
#[derive(Debug, Clone, Default)]
pub struct ConnectionString {
    entries: HashMap<String, String>,
}

impl ConnectionString {
    /// Parse a semicolon-separated key=value string. Separators inside
    /// braces belong to the braced value, not the outer list.
    pub fn parse(input: &str) -> Self {
        let mut entries = HashMap::new();
        let mut depth = 0usize;
        let mut item_start = 0usize;

        let bytes = input.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            match b {
                b'{' => depth += 1,
                b'}' => depth = depth.saturating_sub(1),
                b';' if depth == 0 => {
                    Self::insert_item(&mut entries, &input[item_start..i]);
                    item_start = i + 1;
                }
                _ => {}
            }
        }
        Self::insert_item(&mut entries, &input[item_start..]);

        Self { entries }
    }

    fn insert_item(entries: &mut HashMap<String, String>, item: &str) {
        let item = item.trim();
        if item.is_empty() {
            return;
        }

        let Some((key, value)) = item.split_once('=') else {
            return;
        };

        let value = value.trim();
        let value = value
            .strip_prefix('{')
            .and_then(|v| v.strip_suffix('}'))
            .unwrap_or(value);

        entries.insert(key.trim().to_lowercase(), value.to_string());
    }

    /// Raw value for a key, case-insensitive.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Boolean value for a key; accepts `true`/`false` and `1`/`0`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1"),
            None => default,
        }
    }

    /// Integer value for a key.
    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Unsigned 16-bit value for a key.
    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_the_wire_conventions() {
        let info = SubscriptionInfo::default();
        assert_eq!(info.data_channel_local_port, 9500);
        assert!(info.include_time);
        assert_eq!(info.lag_time, 10.0);
        assert_eq!(info.lead_time, 5.0);
        assert_eq!(info.processing_interval, -1);
    }

    #[test]
    fn test_connection_string_round_trip() {
        let info = SubscriptionInfo {
            filter_expression: "FILTER ActiveMeasurements WHERE SignalType = 'FREQ'".into(),
            throttled: true,
            publish_interval: 0.5,
            udp_data_channel: true,
            data_channel_local_port: 9600,
            use_millisecond_resolution: true,
            start_time: "2020-01-01 00:00:00".into(),
            stop_time: "2020-01-02 00:00:00".into(),
            ..Default::default()
        };

        let s = info.to_connection_string();
        let parsed = ConnectionString::parse(&s);

        assert!(parsed.get_bool("trackLatestMeasurements", false));
        assert!(parsed.get_bool("includeTime", false));
        assert!(parsed.get_bool("useMillisecondResolution", false));
        assert!(!parsed.get_bool("requestNaNValueFilter", true));
        assert_eq!(parsed.get_i32("processingInterval", 0), -1);
        assert_eq!(
            parsed.get("inputMeasurementKeys"),
            Some("FILTER ActiveMeasurements WHERE SignalType = 'FREQ'")
        );
        assert_eq!(parsed.get("dataChannel"), Some("localport=9600"));
        assert_eq!(parsed.get("startTimeConstraint"), Some("2020-01-01 00:00:00"));
        assert_eq!(parsed.get("stopTimeConstraint"), Some("2020-01-02 00:00:00"));
    }

    #[test]
    fn test_braced_values_keep_inner_semicolons() {
        let parsed = ConnectionString::parse("a=1;nested={x=1; y=2};b=2;");
        assert_eq!(parsed.get("a"), Some("1"));
        assert_eq!(parsed.get("nested"), Some("x=1; y=2"));
        assert_eq!(parsed.get("b"), Some("2"));
    }

    #[test]
    fn test_numeric_bools_accepted() {
        let parsed = ConnectionString::parse("includeTime=1;throttled=0");
        assert!(parsed.get_bool("includetime", false));
        assert!(!parsed.get_bool("throttled", true));
    }

    #[test]
    fn test_data_channel_port_extraction() {
        let parsed = ConnectionString::parse("dataChannel={localport=9600}");
        let inner = ConnectionString::parse(parsed.get("dataChannel").unwrap());
        assert_eq!(inner.get_u16("localport", 0), 9600);
    }
}
