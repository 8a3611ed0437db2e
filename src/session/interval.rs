//! Interval extractor.
//!
//! Reads the engine's append-only interval log and returns only the records
//! at or past a cursor.  Metrics come from the interval's aggregate block,
//! resolved as `sum`, then `sum_sent`, then `sum_received`.

use serde_json::Value;

/// Aggregate keys in priority order.
const AGGREGATE_KEYS: [&str; 3] = ["sum", "sum_sent", "sum_received"];

/// Throughput/loss figures of one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregate {
    pub bytes: f64,
    pub bits_per_second: f64,
    pub jitter_ms: f64,
    pub lost_packets: f64,
}

impl Aggregate {
    fn from_value(sum: &Value) -> Self {
        Self {
            bytes: number(sum, "bytes"),
            bits_per_second: number(sum, "bits_per_second"),
            jitter_ms: number(sum, "jitter_ms"),
            lost_packets: number(sum, "lost_packets"),
        }
    }
}

/// One newly observed interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSample {
    /// 1-based position in the full interval history.
    pub sequence_number: u32,
    pub aggregate: Aggregate,
    /// Mean TCP round-trip time across the interval's sender streams, in ms.
    /// `0` when the interval carries no RTT samples.
    pub rtt_ms: f64,
}

/// Numeric field of `obj`, `0` when absent or not a number.
fn number(obj: &Value, key: &str) -> f64 {
    obj.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// The interval's aggregate block, by priority.
pub fn aggregate_of(record: &Value) -> Option<&Value> {
    AGGREGATE_KEYS.iter().find_map(|key| record.get(*key))
}

/// Mean of the per-stream `rtt` values (microseconds in iperf3 output),
/// converted to milliseconds.
fn mean_rtt_ms(record: &Value) -> f64 {
    let Some(streams) = record.get("streams").and_then(Value::as_array) else {
        return 0.0;
    };
    let rtts: Vec<f64> = streams
        .iter()
        .filter_map(|s| s.get("rtt").and_then(Value::as_f64))
        .filter(|rtt| *rtt > 0.0)
        .collect();
    if rtts.is_empty() {
        return 0.0;
    }
    rtts.iter().sum::<f64>() / rtts.len() as f64 / 1000.0
}

/// Parse one interval record.  A record with no aggregate block yields zeros
/// so that sequence numbers stay gap-free.
pub fn sample(record: &Value, sequence_number: u32) -> IntervalSample {
    IntervalSample {
        sequence_number,
        aggregate: aggregate_of(record)
            .map(Aggregate::from_value)
            .unwrap_or_default(),
        rtt_ms: mean_rtt_ms(record),
    }
}

/// Records with index `>= since_cursor`, in order.
pub fn extract_new(records: &[Value], since_cursor: usize) -> Vec<IntervalSample> {
    records
        .iter()
        .enumerate()
        .skip(since_cursor)
        .map(|(idx, record)| sample(record, (idx + 1) as u32))
        .collect()
}
