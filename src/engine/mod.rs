//! Engine control surface consumed by the session bridge.
//!
//! An [`Engine`] is one iperf3 test instance: it is configured once with
//! [`EngineSettings`], runs to completion synchronously on the caller's
//! thread, and publishes an append-only log of interval records while it
//! runs.  Once per interval it invokes its [`ReportingHook`], which is the
//! only point where the bridge observes progress.
//!
//! Two engines ship with the crate: [`iperf::Iperf3Engine`] drives the
//! `iperf3` binary, [`scripted::ScriptedEngine`] replays canned intervals
//! in-process.

pub mod iperf;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Transport used for the data streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream-oriented (TCP).
    Tcp,
    /// Datagram-oriented (UDP).
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Which side sends the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends to server (upload).
    Forward,
    /// Server sends to client (download, `-R`).
    Reverse,
}

/// Full configuration applied to an engine before it runs.
///
/// Role is always client and structured output is always on; the fields are
/// kept explicit so that engines can assert on them.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub host: String,
    pub port: u16,
    pub duration_secs: u32,
    pub parallel: u32,
    pub direction: Direction,
    pub protocol: Protocol,
    /// Target bitrate in bits/sec.  Always set for UDP, optional for TCP.
    pub rate_bps: Option<u64>,
    pub json_output: bool,
    pub connect_timeout: Duration,
    /// Restrict to IPv4, as the mobile hosts do.
    pub ipv4_only: bool,
}

// ---------------------------------------------------------------------------
// Test state
// ---------------------------------------------------------------------------

/// Externally driven state transitions of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Running,
    /// Stop after the current interval.
    Done,
    /// The client is terminating the test.
    ClientTerminate,
    /// The server terminated the test.
    ServerTerminate,
}

// ---------------------------------------------------------------------------
// Engine traits
// ---------------------------------------------------------------------------

/// Hook invoked by the engine once per measurement interval, on the engine's
/// own thread.
pub type ReportingHook = Arc<dyn Fn(&dyn Engine) + Send + Sync>;

/// One iperf3 test instance.
///
/// All methods take `&self`: the instance is shared between the thread
/// blocked in [`Engine::run_client`] and threads requesting cancellation.
pub trait Engine: Send + Sync {
    /// Apply client settings.  Must be called before [`Engine::run_client`].
    fn apply(&self, settings: EngineSettings);

    /// Run the client test to completion on the calling thread.
    ///
    /// Returns `0` on success and a negative value on failure; the reason is
    /// available through [`Engine::last_error`].
    fn run_client(&self) -> i32;

    /// Local state transition, observed by the run loop.
    fn set_state(&self, state: TestState);

    /// Tell the remote peer about a state transition.
    fn send_state(&self, state: TestState) -> Result<()>;

    /// Borrow the interval records produced so far.
    fn with_intervals(&self, f: &mut dyn FnMut(&[serde_json::Value]));

    /// Finalize the structured report and return it serialized, or `None` if
    /// the engine has nothing to report.
    fn finish_report(&self) -> Option<String>;

    /// Last internal error code (`0` when clear).
    fn last_error(&self) -> i32;

    fn reset_last_error(&self);

    /// Currently installed reporting hook.
    fn reporting_hook(&self) -> Option<ReportingHook>;

    fn set_reporting_hook(&self, hook: Option<ReportingHook>);
}

/// Creates engine instances and reports the engine version.
pub trait EngineFactory: Send + Sync {
    /// Create a fresh test instance.
    fn new_test(&self) -> Result<Arc<dyn Engine>>;

    /// Version string of the underlying engine.
    fn version(&self) -> String;
}

/// Number of intervals currently held by `engine`.
pub fn interval_count(engine: &dyn Engine) -> usize {
    let mut count = 0;
    engine.with_intervals(&mut |records: &[serde_json::Value]| count = records.len());
    count
}
