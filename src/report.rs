//! Human-readable formatting of session progress and results.

use crate::session::{ProgressEvent, ResultRecord};

fn format_rate(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// One line per interval.
pub fn format_progress(event: &ProgressEvent) -> String {
    let mut line = format!(
        "[{:>3}] {}",
        event.sequence_number,
        format_rate(event.mbps())
    );
    if event.round_trip_time_ms > 0.0 {
        line.push_str(&format!(", rtt: {:.2}ms", event.round_trip_time_ms));
    }
    if event.jitter_ms > 0.0 {
        line.push_str(&format!(", jitter: {:.2}ms", event.jitter_ms));
    }
    if event.lost_packets > 0 {
        line.push_str(&format!(", lost: {}", event.lost_packets));
    }
    line
}

/// Format a session result as a human-readable summary.
pub fn format_summary(result: &ResultRecord) -> String {
    if !result.success {
        return format!(
            "test failed: {} (code={})",
            result.error_message.as_deref().unwrap_or("iperf3 test failed"),
            result.error_code.unwrap_or_default()
        );
    }

    let mut summary = format!(
        "sent {}, received {}",
        format_rate(result.send_mbps),
        format_rate(result.receive_mbps)
    );

    if let Some(rtt) = result.round_trip_time_ms {
        summary.push_str(&format!(", rtt: {:.2}ms", rtt));
    }
    if let Some(jitter) = result.jitter_ms {
        summary.push_str(&format!(", jitter: {:.2}ms", jitter));
    }
    if let (Some(lost), Some(total)) = (result.lost_packets, result.total_packets) {
        let pct = if total > 0 {
            lost as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        summary.push_str(&format!(", loss: {}/{} ({:.2}%)", lost, total, pct));
    }

    summary
}
