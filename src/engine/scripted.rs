//! Deterministic in-process engine.
//!
//! [`ScriptedEngine`] replays a fixed list of interval records, a configurable
//! number per tick, and then finishes with a scripted outcome.  It honours the
//! same state transitions as the iperf3 engine, which makes it suitable for
//! exercising a host integration without a reachable iperf3 server.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::error::NO_ERROR;

use super::{Engine, EngineFactory, EngineSettings, Protocol, ReportingHook, TestState};

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// How a scripted run ends once all intervals are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Return `0` with a clear error and produce a report.
    Complete,
    /// Return `return_code` with `error` as the last error.
    Fail { return_code: i32, error: i32 },
    /// Return `0` but produce no report.
    NoReport,
}

/// What a [`ScriptedEngine`] does when run.
#[derive(Debug, Clone)]
pub struct Script {
    pub intervals: Vec<Value>,
    pub records_per_tick: usize,
    pub tick: Duration,
    pub outcome: ScriptedOutcome,
    /// Whether [`Engine::send_state`] should fail, as when the control
    /// connection is already gone.
    pub peer_unreachable: bool,
}

impl Script {
    /// `count` one-second TCP intervals at a steady `bits_per_second`.
    pub fn tcp(count: usize, bits_per_second: f64) -> Self {
        let intervals = (0..count)
            .map(|i| tcp_interval(i, bits_per_second, 1500.0 + i as f64 * 100.0))
            .collect();
        Self::with_intervals(intervals)
    }

    /// `count` one-second UDP intervals as seen by a receiving client.
    pub fn udp(count: usize, bits_per_second: f64, jitter_ms: f64, lost_per_interval: u64) -> Self {
        let intervals = (0..count)
            .map(|i| udp_interval(i, bits_per_second, jitter_ms, lost_per_interval))
            .collect();
        Self::with_intervals(intervals)
    }

    pub fn with_intervals(intervals: Vec<Value>) -> Self {
        Self {
            intervals,
            records_per_tick: 1,
            tick: Duration::ZERO,
            outcome: ScriptedOutcome::Complete,
            peer_unreachable: false,
        }
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn records_per_tick(mut self, n: usize) -> Self {
        self.records_per_tick = n.max(1);
        self
    }

    pub fn failing(mut self, return_code: i32, error: i32) -> Self {
        self.outcome = ScriptedOutcome::Fail { return_code, error };
        self
    }

    pub fn without_report(mut self) -> Self {
        self.outcome = ScriptedOutcome::NoReport;
        self
    }

    pub fn peer_unreachable(mut self) -> Self {
        self.peer_unreachable = true;
        self
    }
}

/// A TCP interval record with one sender stream.
pub fn tcp_interval(index: usize, bits_per_second: f64, rtt_us: f64) -> Value {
    let bytes = (bits_per_second / 8.0).round();
    json!({
        "streams": [{
            "socket": 5,
            "start": index as f64,
            "end": index as f64 + 1.0,
            "seconds": 1.0,
            "bytes": bytes,
            "bits_per_second": bits_per_second,
            "retransmits": 0,
            "rtt": rtt_us,
            "sender": true
        }],
        "sum": {
            "start": index as f64,
            "end": index as f64 + 1.0,
            "seconds": 1.0,
            "bytes": bytes,
            "bits_per_second": bits_per_second,
            "retransmits": 0,
            "sender": true
        }
    })
}

/// A UDP interval record as reported by a receiving client.
pub fn udp_interval(index: usize, bits_per_second: f64, jitter_ms: f64, lost: u64) -> Value {
    let bytes = (bits_per_second / 8.0).round();
    let packets = (bytes / 1448.0).ceil() as u64;
    json!({
        "streams": [{
            "socket": 5,
            "start": index as f64,
            "end": index as f64 + 1.0,
            "seconds": 1.0,
            "bytes": bytes,
            "bits_per_second": bits_per_second,
            "jitter_ms": jitter_ms,
            "lost_packets": lost,
            "packets": packets,
            "sender": false
        }],
        "sum": {
            "start": index as f64,
            "end": index as f64 + 1.0,
            "seconds": 1.0,
            "bytes": bytes,
            "bits_per_second": bits_per_second,
            "jitter_ms": jitter_ms,
            "lost_packets": lost,
            "packets": packets,
            "sender": false
        }
    })
}

// ---------------------------------------------------------------------------
// ScriptedEngine
// ---------------------------------------------------------------------------

pub struct ScriptedEngine {
    script: Script,
    settings: Mutex<Option<EngineSettings>>,
    intervals: RwLock<Vec<Value>>,
    hook: Mutex<Option<ReportingHook>>,
    done: AtomicBool,
    last_error: AtomicI32,
    peer_notified: AtomicBool,
    ticks: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            settings: Mutex::new(None),
            intervals: RwLock::new(Vec::new()),
            hook: Mutex::new(None),
            done: AtomicBool::new(false),
            last_error: AtomicI32::new(NO_ERROR),
            peer_notified: AtomicBool::new(false),
            ticks: AtomicUsize::new(0),
        }
    }

    /// Settings applied by the last [`Engine::apply`].
    pub fn settings(&self) -> Option<EngineSettings> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a termination was sent to the (pretend) server.
    pub fn peer_notified(&self) -> bool {
        self.peer_notified.load(Ordering::SeqCst)
    }

    /// Whether the run loop was told to stop.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Number of reporting ticks executed.
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    fn protocol(&self) -> Protocol {
        self.settings()
            .map(|s| s.protocol)
            .unwrap_or(Protocol::Tcp)
    }

    fn report(&self) {
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Summarise the replayed intervals into an iperf3-style `end` block.
    fn end_block(&self, intervals: &[Value]) -> Value {
        let field = |v: &Value, key: &str| {
            v.get("sum")
                .and_then(|s| s.get(key))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };
        let n = intervals.len().max(1) as f64;
        let bytes: f64 = intervals.iter().map(|v| field(v, "bytes")).sum();
        let seconds = intervals.len() as f64;
        let bps = intervals.iter().map(|v| field(v, "bits_per_second")).sum::<f64>() / n;
        let sum = json!({
            "start": 0.0,
            "end": seconds,
            "seconds": seconds,
            "bytes": bytes,
            "bits_per_second": bps,
        });

        match self.protocol() {
            Protocol::Tcp => {
                let rtts: Vec<f64> = intervals
                    .iter()
                    .filter_map(|v| v.pointer("/streams/0/rtt").and_then(Value::as_f64))
                    .collect();
                let mean_rtt = if rtts.is_empty() {
                    0.0
                } else {
                    rtts.iter().sum::<f64>() / rtts.len() as f64
                };
                json!({
                    "streams": [{
                        "sender": { "bytes": bytes, "bits_per_second": bps, "mean_rtt": mean_rtt.round() },
                        "receiver": { "bytes": bytes, "bits_per_second": bps }
                    }],
                    "sum_sent": sum,
                    "sum_received": sum,
                })
            }
            Protocol::Udp => {
                let jitter = intervals.iter().map(|v| field(v, "jitter_ms")).sum::<f64>() / n;
                let lost: f64 = intervals.iter().map(|v| field(v, "lost_packets")).sum();
                let packets: f64 = intervals.iter().map(|v| field(v, "packets")).sum();
                let mut udp_sum = sum.clone();
                udp_sum["jitter_ms"] = json!(jitter);
                udp_sum["lost_packets"] = json!(lost as u64);
                udp_sum["packets"] = json!(packets as u64);
                json!({
                    "sum": udp_sum,
                    "sum_sent": sum,
                    "sum_received": sum,
                })
            }
        }
    }
}

impl Engine for ScriptedEngine {
    fn apply(&self, settings: EngineSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings);
    }

    fn run_client(&self) -> i32 {
        for chunk in self.script.intervals.chunks(self.script.records_per_tick.max(1)) {
            if self.is_done() {
                break;
            }
            if !self.script.tick.is_zero() {
                std::thread::sleep(self.script.tick);
            }
            if self.is_done() {
                break;
            }
            self.intervals
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(chunk.iter().cloned());
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.report();
        }

        if self.is_done() {
            return 0;
        }

        match self.script.outcome {
            ScriptedOutcome::Complete | ScriptedOutcome::NoReport => 0,
            ScriptedOutcome::Fail { return_code, error } => {
                self.last_error.store(error, Ordering::SeqCst);
                return_code
            }
        }
    }

    fn set_state(&self, state: TestState) {
        match state {
            TestState::Running => self.done.store(false, Ordering::SeqCst),
            TestState::Done | TestState::ClientTerminate | TestState::ServerTerminate => {
                self.done.store(true, Ordering::SeqCst)
            }
        }
    }

    fn send_state(&self, state: TestState) -> Result<()> {
        if self.script.peer_unreachable {
            return Err(anyhow!("control connection closed, cannot send {:?}", state));
        }
        self.peer_notified.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn with_intervals(&self, f: &mut dyn FnMut(&[Value])) {
        let intervals = self.intervals.read().unwrap_or_else(PoisonError::into_inner);
        f(&intervals);
    }

    fn finish_report(&self) -> Option<String> {
        if self.script.outcome == ScriptedOutcome::NoReport {
            return None;
        }
        let intervals = self
            .intervals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let settings = self.settings();
        let report = json!({
            "start": {
                "test_start": {
                    "protocol": self.protocol().to_string(),
                    "num_streams": settings.as_ref().map(|s| s.parallel).unwrap_or(1),
                    "duration": settings.as_ref().map(|s| s.duration_secs).unwrap_or(0),
                }
            },
            "end": self.end_block(&intervals),
            "intervals": intervals,
        });
        serde_json::to_string(&report).ok()
    }

    fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::SeqCst)
    }

    fn reset_last_error(&self) {
        self.last_error.store(NO_ERROR, Ordering::SeqCst);
    }

    fn reporting_hook(&self) -> Option<ReportingHook> {
        self.hook.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_reporting_hook(&self, hook: Option<ReportingHook>) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = hook;
    }
}

// ---------------------------------------------------------------------------
// ScriptedFactory
// ---------------------------------------------------------------------------

/// Hands out a fresh [`ScriptedEngine`] per session and keeps them around for
/// inspection.
pub struct ScriptedFactory {
    script: Script,
    default_hook: Option<ReportingHook>,
    unavailable: bool,
    created: Mutex<Vec<Arc<ScriptedEngine>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            default_hook: None,
            unavailable: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Install `hook` on every created engine, standing in for the engine's
    /// built-in reporter.
    pub fn with_default_hook(mut self, hook: ReportingHook) -> Self {
        self.default_hook = Some(hook);
        self
    }

    /// Make every [`EngineFactory::new_test`] call fail.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// The most recently created engine.
    pub fn last_engine(&self) -> Option<Arc<ScriptedEngine>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl EngineFactory for ScriptedFactory {
    fn new_test(&self) -> Result<Arc<dyn Engine>> {
        if self.unavailable {
            return Err(anyhow!("scripted engine unavailable"));
        }
        let engine = Arc::new(ScriptedEngine::new(self.script.clone()));
        engine.set_reporting_hook(self.default_hook.clone());
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(engine.clone());
        let engine: Arc<dyn Engine> = engine;
        Ok(engine)
    }

    fn version(&self) -> String {
        "scripted 1.0".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
