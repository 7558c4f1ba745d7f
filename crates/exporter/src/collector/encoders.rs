//! Output encoders for collected telemetry samples.

use std::collections::BTreeMap;

use influxdb_line_protocol::LineProtocolBuilder;
use serde_json::json;

/// A metric field value in an encoded sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Unsigned(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

/// Encodes one sample into a line of the configured output format.
///
/// Tags and fields arrive in `BTreeMap`s so encoded lines are stable
/// for a given sample regardless of collection order.
pub trait MetricsEncoder: Send + Sync {
    fn encode(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, MetricValue>,
        timestamp: i64,
    ) -> String;
}

pub fn create_encoder(format: &str) -> Box<dyn MetricsEncoder> {
    match format.to_lowercase().as_str() {
        "json" => Box::new(JsonEncoder),
        _ => Box::new(InfluxEncoder),
    }
}

/// InfluxDB line protocol.
pub struct InfluxEncoder;

impl MetricsEncoder for InfluxEncoder {
    fn encode(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, MetricValue>,
        timestamp: i64,
    ) -> String {
        let mut builder = LineProtocolBuilder::new().measurement(measurement);
        for (key, value) in tags {
            builder = builder.tag(key, value);
        }

        // The builder's type state requires at least one field before a
        // timestamp can be attached.
        let mut entries = fields.iter();
        let Some((first_key, first_value)) = entries.next() else {
            let bytes = builder
                .field("_empty", true)
                .timestamp(timestamp)
                .close_line()
                .build();
            return String::from_utf8_lossy(&bytes).into_owned();
        };

        let mut builder = match first_value {
            MetricValue::Integer(v) => builder.field(first_key, *v),
            MetricValue::Unsigned(v) => builder.field(first_key, *v),
            MetricValue::Float(v) => builder.field(first_key, *v),
        };
        for (key, value) in entries {
            builder = match value {
                MetricValue::Integer(v) => builder.field(key, *v),
                MetricValue::Unsigned(v) => builder.field(key, *v),
                MetricValue::Float(v) => builder.field(key, *v),
            };
        }

        let bytes = builder.timestamp(timestamp).close_line().build();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One JSON object per line.
pub struct JsonEncoder;

impl MetricsEncoder for JsonEncoder {
    fn encode(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, MetricValue>,
        timestamp: i64,
    ) -> String {
        let fields: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    MetricValue::Integer(v) => json!(v),
                    MetricValue::Unsigned(v) => json!(v),
                    MetricValue::Float(v) => json!(v),
                };
                (key.clone(), value)
            })
            .collect();
        json!({
            "measure": measurement,
            "ts": timestamp,
            "tag": tags,
            "field": fields,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (BTreeMap<String, String>, BTreeMap<String, MetricValue>) {
        let tags = BTreeMap::from([
            ("device".to_string(), "gpu-aaa".to_string()),
            ("node".to_string(), "node-1".to_string()),
        ]);
        let fields = BTreeMap::from([
            ("gpu_temp".to_string(), MetricValue::Unsigned(61)),
            ("power_usage".to_string(), MetricValue::Float(212.5)),
            ("xid_count".to_string(), MetricValue::Integer(-1)),
        ]);
        (tags, fields)
    }

    #[test]
    fn influx_line_carries_tags_fields_and_timestamp() {
        let (tags, fields) = sample();
        let line = InfluxEncoder.encode("gpu_telemetry", &tags, &fields, 1700000000000000000);

        assert!(line.starts_with("gpu_telemetry,"));
        assert!(line.contains("device=gpu-aaa"));
        assert!(line.contains("node=node-1"));
        assert!(line.contains("gpu_temp=61u"));
        assert!(line.contains("power_usage=212.5"));
        assert!(line.contains("xid_count=-1i"));
        assert!(line.trim_end().ends_with("1700000000000000000"));
    }

    #[test]
    fn influx_line_without_fields_stays_parseable() {
        let tags = BTreeMap::from([("node".to_string(), "node-1".to_string())]);
        let line = InfluxEncoder.encode("gpu_telemetry", &tags, &BTreeMap::new(), 1);
        assert!(line.contains("_empty=true"));
    }

    #[test]
    fn json_lines_parse_back_with_the_same_shape() {
        let (tags, fields) = sample();
        let line = JsonEncoder.encode("gpu_telemetry", &tags, &fields, 1700000000000000000);

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["measure"], "gpu_telemetry");
        assert_eq!(parsed["ts"], 1700000000000000000i64);
        assert_eq!(parsed["tag"]["device"], "gpu-aaa");
        assert_eq!(parsed["field"]["gpu_temp"], 61);
        assert_eq!(parsed["field"]["power_usage"], 212.5);
    }

    #[test]
    fn unknown_format_falls_back_to_influx() {
        let (tags, fields) = sample();
        let line = create_encoder("whatever").encode("gpu_telemetry", &tags, &fields, 7);
        assert!(line.starts_with("gpu_telemetry,"));
    }
}
