//! Result assembly.
//!
//! Turns the engine's return code, its last error and the cancellation flag
//! captured at teardown into one [`ResultRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{Engine, Protocol};
use crate::error::{ErrorCode, NO_ERROR};

use super::cancel::SessionState;

// ---------------------------------------------------------------------------
// iperf3 report (subset of fields we care about)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Iperf3Report {
    #[serde(default)]
    end: Iperf3End,
}

#[derive(Debug, Default, Deserialize)]
struct Iperf3End {
    #[serde(default)]
    streams: Vec<Iperf3EndStream>,
    sum: Option<Iperf3Sum>,
    sum_sent: Option<Iperf3Sum>,
    sum_received: Option<Iperf3Sum>,
}

#[derive(Debug, Deserialize)]
struct Iperf3EndStream {
    sender: Option<Iperf3Sender>,
}

#[derive(Debug, Deserialize)]
struct Iperf3Sender {
    /// Microseconds.
    mean_rtt: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct Iperf3Sum {
    #[serde(default)]
    bits_per_second: f64,
    jitter_ms: Option<f64>,
    lost_packets: Option<u64>,
    packets: Option<u64>,
}

impl Iperf3End {
    fn sent(&self) -> Iperf3Sum {
        self.sum_sent.clone().or_else(|| self.sum.clone()).unwrap_or_default()
    }

    fn received(&self) -> Iperf3Sum {
        self.sum_received
            .clone()
            .or_else(|| self.sum.clone())
            .unwrap_or_default()
    }

    /// Mean sender RTT across streams, in ms.
    fn mean_rtt_ms(&self) -> Option<f64> {
        let rtts: Vec<f64> = self
            .streams
            .iter()
            .filter_map(|s| s.sender.as_ref().and_then(|snd| snd.mean_rtt))
            .collect();
        if rtts.is_empty() {
            return None;
        }
        Some(rtts.iter().sum::<f64>() / rtts.len() as f64 / 1000.0)
    }
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|v| *v > 0.0)
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

/// Final outcome of one client session.
///
/// Either the throughput fields and `raw_report` are populated, or
/// `error_code` and `error_message` are.  Serialized keys follow the map the
/// mobile hosts expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub success: bool,
    pub send_mbps: f64,
    pub receive_mbps: f64,
    pub sent_bits_per_second: f64,
    pub received_bits_per_second: f64,
    #[serde(rename = "rtt", default, skip_serializing_if = "Option::is_none")]
    pub round_trip_time_ms: Option<f64>,
    #[serde(rename = "jitter", default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_packets: Option<u64>,
    #[serde(rename = "jsonOutput", default, skip_serializing_if = "Option::is_none")]
    pub raw_report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            success: false,
            send_mbps: 0.0,
            receive_mbps: 0.0,
            sent_bits_per_second: 0.0,
            received_bits_per_second: 0.0,
            round_trip_time_ms: None,
            jitter_ms: None,
            lost_packets: None,
            total_packets: None,
            raw_report: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::failure(code.code(), code.description())
    }

    pub fn cancelled() -> Self {
        Self::from_code(ErrorCode::Cancelled)
    }

    /// Successful result from a serialized iperf3 report.
    ///
    /// A report that does not parse still counts as success; the throughput
    /// fields are then zero and the raw text is kept for the host.
    pub fn from_report(raw: String, protocol: Protocol) -> Self {
        let end = match serde_json::from_str::<Iperf3Report>(&raw) {
            Ok(report) => report.end,
            Err(e) => {
                warn!(error = %e, "iperf3 report did not parse, returning raw output only");
                Iperf3End::default()
            }
        };

        let sent = end.sent();
        let received = end.received();
        let (rtt, jitter, lost, total) = match protocol {
            Protocol::Tcp => (positive(end.mean_rtt_ms()), None, None, None),
            Protocol::Udp => {
                let sum = end.sum.clone().unwrap_or_default();
                (None, positive(sum.jitter_ms), sum.lost_packets, sum.packets)
            }
        };

        Self {
            success: true,
            send_mbps: sent.bits_per_second / 1_000_000.0,
            receive_mbps: received.bits_per_second / 1_000_000.0,
            sent_bits_per_second: sent.bits_per_second,
            received_bits_per_second: received.bits_per_second,
            round_trip_time_ms: rtt,
            jitter_ms: jitter,
            lost_packets: lost,
            total_packets: total,
            raw_report: Some(raw),
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Session phase this result ends in.
    pub fn terminal_state(&self) -> SessionState {
        if self.success {
            SessionState::Succeeded
        } else if self.error_code == Some(ErrorCode::Cancelled.code()) {
            SessionState::Cancelled
        } else {
            SessionState::Failed
        }
    }

    /// Taxonomy entry of `error_code`, if it is a known one.
    pub fn error_kind(&self) -> Option<ErrorCode> {
        self.error_code.and_then(ErrorCode::from_raw)
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// What the engine left behind, captured right after its run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOutcome {
    pub return_code: i32,
    pub last_error: i32,
    pub cancelled: bool,
}

/// Build the session result.  Cancellation wins over anything the engine
/// reported.
pub fn assemble(outcome: &EngineOutcome, engine: &dyn Engine, protocol: Protocol) -> ResultRecord {
    if outcome.cancelled {
        return ResultRecord::cancelled();
    }

    if outcome.return_code == 0 && outcome.last_error == NO_ERROR {
        return match engine.finish_report() {
            Some(raw) => ResultRecord::from_report(raw, protocol),
            None => ResultRecord::from_code(ErrorCode::NoOutput),
        };
    }

    if outcome.last_error == NO_ERROR {
        return ResultRecord::failure(NO_ERROR, "iperf3 test failed");
    }

    ResultRecord::failure(outcome.last_error, ErrorCode::describe(outcome.last_error))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Script, ScriptedEngine};
    use crate::engine::{Direction, EngineSettings};
    use std::path::Path;
    use std::time::Duration;

    fn outcome(return_code: i32, last_error: i32, cancelled: bool) -> EngineOutcome {
        EngineOutcome {
            return_code,
            last_error,
            cancelled,
        }
    }

    fn ran(script: Script, protocol: Protocol) -> ScriptedEngine {
        let engine = ScriptedEngine::new(script);
        engine.apply(EngineSettings {
            host: "10.0.0.1".into(),
            port: 5201,
            duration_secs: 10,
            parallel: 1,
            direction: Direction::Forward,
            protocol,
            rate_bps: None,
            json_output: true,
            connect_timeout: Duration::from_secs(5),
            ipv4_only: true,
        });
        engine.run_client();
        engine
    }

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("fixtures")
            .join("iperf3")
            .join(name);
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_cancel_wins_over_success() {
        let engine = ran(Script::tcp(3, 8_000_000.0), Protocol::Tcp);
        let result = assemble(&outcome(0, 0, true), &engine, Protocol::Tcp);
        assert!(!result.success);
        assert_eq!(result.error_code, Some(-999));
        assert_eq!(result.error_message.as_deref(), Some("Test cancelled by user"));
        assert_eq!(result.terminal_state(), SessionState::Cancelled);
        assert!(result.raw_report.is_none());
    }

    #[test]
    fn test_tcp_success() {
        let engine = ran(Script::tcp(10, 94_000_000.0), Protocol::Tcp);
        let result = assemble(&outcome(0, 0, false), &engine, Protocol::Tcp);
        assert!(result.success);
        assert_eq!(result.send_mbps, 94.0);
        assert_eq!(result.received_bits_per_second, 94_000_000.0);
        // mean of 1500..2400 us
        assert_eq!(result.round_trip_time_ms, Some(1.95));
        assert!(result.jitter_ms.is_none());
        assert!(result.raw_report.is_some());
        assert!(result.error_code.is_none());
        assert_eq!(result.terminal_state(), SessionState::Succeeded);
    }

    #[test]
    fn test_udp_success() {
        let engine = ran(Script::udp(5, 1_000_000.0, 0.25, 1), Protocol::Udp);
        let result = assemble(&outcome(0, 0, false), &engine, Protocol::Udp);
        assert!(result.success);
        assert_eq!(result.jitter_ms, Some(0.25));
        assert_eq!(result.lost_packets, Some(5));
        assert!(result.total_packets.unwrap() > 0);
        assert!(result.round_trip_time_ms.is_none());
    }

    #[test]
    fn test_missing_report_is_no_output() {
        let engine = ran(Script::tcp(2, 1.0).without_report(), Protocol::Tcp);
        let result = assemble(&outcome(0, 0, false), &engine, Protocol::Tcp);
        assert_eq!(result.error_code, Some(-1));
        assert_eq!(result.error_message.as_deref(), Some("No JSON output available"));
    }

    #[test]
    fn test_engine_error() {
        let engine = ran(Script::tcp(0, 0.0).failing(-1, 103), Protocol::Tcp);
        let result = assemble(&outcome(-1, 103, false), &engine, Protocol::Tcp);
        assert_eq!(result.error_code, Some(103));
        assert_eq!(
            result.error_message.as_deref(),
            Some("unable to connect to server")
        );
        assert_eq!(result.error_kind(), Some(ErrorCode::Connect));
        assert_eq!(result.terminal_state(), SessionState::Failed);
    }

    #[test]
    fn test_error_with_zero_return_code() {
        let engine = ran(Script::tcp(1, 1.0), Protocol::Tcp);
        let result = assemble(&outcome(0, 119, false), &engine, Protocol::Tcp);
        assert!(!result.success);
        assert_eq!(result.error_code, Some(119));
    }

    #[test]
    fn test_failure_without_error_code() {
        let engine = ran(Script::tcp(1, 1.0), Protocol::Tcp);
        let result = assemble(&outcome(-1, 0, false), &engine, Protocol::Tcp);
        assert_eq!(result.error_message.as_deref(), Some("iperf3 test failed"));
    }

    #[test]
    fn test_unknown_error_code() {
        let engine = ran(Script::tcp(1, 1.0), Protocol::Tcp);
        let result = assemble(&outcome(-1, 4242, false), &engine, Protocol::Tcp);
        assert_eq!(result.error_code, Some(4242));
        assert_eq!(
            result.error_message.as_deref(),
            Some("unknown error (code=4242)")
        );
        assert_eq!(result.error_kind(), None);
    }

    #[test]
    fn test_unparseable_report_is_still_success() {
        let result = ResultRecord::from_report("not json".into(), Protocol::Tcp);
        assert!(result.success);
        assert_eq!(result.send_mbps, 0.0);
        assert_eq!(result.raw_report.as_deref(), Some("not json"));
    }

    #[test]
    fn test_parse_tcp_fixture() {
        let result = ResultRecord::from_report(fixture("tcp-client.json"), Protocol::Tcp);
        assert!(result.success);
        assert!(result.send_mbps > 900.0);
        assert!(result.receive_mbps > 900.0);
        assert_eq!(result.round_trip_time_ms, Some(1.234));
    }

    #[test]
    fn test_parse_udp_fixture() {
        let result = ResultRecord::from_report(fixture("udp-client.json"), Protocol::Udp);
        assert!(result.success);
        assert_eq!(result.jitter_ms, Some(0.042));
        assert_eq!(result.lost_packets, Some(3));
        assert_eq!(result.total_packets, Some(864));
    }

    #[test]
    fn test_serialized_keys() {
        let v = serde_json::to_value(ResultRecord::cancelled()).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["errorCode"], -999);
        assert_eq!(v["error"], "Test cancelled by user");
        assert!(v.get("rtt").is_none());
        assert!(v.get("jsonOutput").is_none());
        assert!(v.get("sendMbps").is_some());
    }
}
