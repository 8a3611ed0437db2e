//! Progress notifier.
//!
//! Wraps the engine's original reporting hook.  On every tick it runs the
//! original hook, then either stops the engine (when a cancel was accepted)
//! or turns each interval appended since the last tick into one
//! [`ProgressEvent`] and hands it to the host through a
//! [`CallbackAdapter`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::engine::{Engine, ReportingHook, TestState};

use super::cancel::CancellationCoordinator;
use super::interval::{self, IntervalSample};
use super::marshal::CallbackAdapter;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// One interval's worth of progress, as delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// 1-based, strictly increasing within a session.
    #[serde(rename = "interval")]
    pub sequence_number: u32,
    pub bytes_transferred: u64,
    pub bits_per_second: f64,
    #[serde(rename = "jitter")]
    pub jitter_ms: f64,
    pub lost_packets: u32,
    #[serde(rename = "rtt")]
    pub round_trip_time_ms: f64,
}

impl ProgressEvent {
    pub fn mbps(&self) -> f64 {
        self.bits_per_second / 1_000_000.0
    }
}

impl From<IntervalSample> for ProgressEvent {
    fn from(sample: IntervalSample) -> Self {
        let agg = sample.aggregate;
        Self {
            sequence_number: sample.sequence_number,
            bytes_transferred: agg.bytes.max(0.0) as u64,
            bits_per_second: agg.bits_per_second,
            jitter_ms: agg.jitter_ms,
            lost_packets: agg.lost_packets.max(0.0) as u32,
            round_trip_time_ms: sample.rtt_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressNotifier
// ---------------------------------------------------------------------------

/// Reporting-hook decorator for one session.
pub struct ProgressNotifier {
    original: Option<ReportingHook>,
    coordinator: Arc<CancellationCoordinator>,
    adapter: Option<Arc<CallbackAdapter>>,
    /// Number of intervals already delivered.
    cursor: AtomicUsize,
}

impl ProgressNotifier {
    pub fn new(
        original: Option<ReportingHook>,
        coordinator: Arc<CancellationCoordinator>,
        adapter: Option<Arc<CallbackAdapter>>,
    ) -> Self {
        Self {
            original,
            coordinator,
            adapter,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// One reporting tick.  Runs on the engine thread.
    pub fn on_report(&self, engine: &dyn Engine) {
        if let Some(original) = &self.original {
            original(engine);
        }

        if self.coordinator.is_cancelled() {
            engine.set_state(TestState::Done);
            return;
        }

        let cursor = self.cursor();
        let mut total = cursor;
        let mut fresh = Vec::new();
        engine.with_intervals(&mut |records: &[serde_json::Value]| {
            total = records.len().max(cursor);
            fresh = interval::extract_new(records, cursor);
        });

        // Deliver outside the engine's interval lock.
        if let Some(adapter) = &self.adapter {
            for sample in fresh {
                let event = ProgressEvent::from(sample);
                trace!(interval = event.sequence_number, mbps = event.mbps(), "progress");
                adapter.deliver(&event);
            }
        }

        self.cursor.store(total, Ordering::SeqCst);
    }

    /// The hook to install on the engine.
    pub fn into_hook(self: Arc<Self>) -> ReportingHook {
        Arc::new(move |engine: &dyn Engine| self.on_report(engine))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{tcp_interval, Script, ScriptedEngine};
    use std::sync::Mutex;

    fn collecting_adapter() -> (Arc<CallbackAdapter>, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let adapter = CallbackAdapter::inline(move |e: &ProgressEvent| {
            sink.lock().unwrap().push(*e);
        });
        (Arc::new(adapter), events)
    }

    #[test]
    fn test_delivers_each_interval_once_in_order() {
        let (adapter, events) = collecting_adapter();
        let coordinator = Arc::new(CancellationCoordinator::new());
        let notifier = Arc::new(ProgressNotifier::new(None, coordinator, Some(adapter)));

        let engine = ScriptedEngine::new(Script::tcp(7, 8_000_000.0).records_per_tick(3));
        engine.set_reporting_hook(Some(notifier.clone().into_hook()));
        engine.run_client();

        let events = events.lock().unwrap();
        let seqs: Vec<u32> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, (1..=7).collect::<Vec<u32>>());
        assert_eq!(notifier.cursor(), 7);
        assert_eq!(events[0].bytes_transferred, 1_000_000);
        assert_eq!(events[0].round_trip_time_ms, 1.5);
    }

    #[test]
    fn test_repeat_tick_without_new_records_delivers_nothing() {
        let (adapter, events) = collecting_adapter();
        let coordinator = Arc::new(CancellationCoordinator::new());
        let notifier = ProgressNotifier::new(None, coordinator, Some(adapter));

        let engine = ScriptedEngine::new(Script::with_intervals(vec![]));
        notifier.on_report(&engine);
        notifier.on_report(&engine);
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(notifier.cursor(), 0);
    }

    #[test]
    fn test_original_hook_runs_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let original_log = order.clone();
        let original: ReportingHook = Arc::new(move |_: &dyn Engine| {
            original_log.lock().unwrap().push("original");
        });
        let adapter_log = order.clone();
        let adapter = Arc::new(CallbackAdapter::inline(move |_: &ProgressEvent| {
            adapter_log.lock().unwrap().push("progress");
        }));

        let coordinator = Arc::new(CancellationCoordinator::new());
        let notifier = Arc::new(ProgressNotifier::new(Some(original), coordinator, Some(adapter)));
        let engine = ScriptedEngine::new(Script::tcp(2, 1_000.0));
        engine.set_reporting_hook(Some(notifier.into_hook()));
        engine.run_client();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["original", "progress", "original", "progress"]
        );
    }

    #[test]
    fn test_cancelled_tick_stops_engine_without_delivery() {
        let (adapter, events) = collecting_adapter();
        let coordinator = Arc::new(CancellationCoordinator::new());
        let notifier = ProgressNotifier::new(None, coordinator.clone(), Some(adapter));

        // One record is already queued when the tick arrives.
        let engine = Arc::new(ScriptedEngine::new(Script::with_intervals(vec![
            tcp_interval(0, 1.0, 1.0),
        ])));
        engine.run_client();
        let dynamic: Arc<dyn Engine> = engine.clone();
        coordinator.register(&dynamic).unwrap();
        assert!(coordinator.request_cancel());
        engine.set_state(TestState::Running);

        notifier.on_report(engine.as_ref());

        assert!(events.lock().unwrap().is_empty());
        assert!(engine.is_done());
        assert_eq!(notifier.cursor(), 0);
    }

    #[test]
    fn test_event_serializes_with_host_keys() {
        let event = ProgressEvent {
            sequence_number: 2,
            bytes_transferred: 10,
            bits_per_second: 80.0,
            jitter_ms: 0.0,
            lost_packets: 0,
            round_trip_time_ms: 1.5,
        };
        let v = serde_json::to_value(event).unwrap();
        assert_eq!(v["interval"], 2);
        assert_eq!(v["bytesTransferred"], 10);
        assert_eq!(v["rtt"], 1.5);
    }
}
