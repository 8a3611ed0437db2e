//! iperf3 process engine.
//!
//! Runs `iperf3 -c ... --json-stream` as a child process and reads its
//! line-delimited JSON events on the calling thread.  Each `interval` event is
//! appended to the interval log and followed by one call of the reporting
//! hook, so observers see intervals as iperf3 produces them rather than at
//! the end of the run.
//!
//! Cancellation sends SIGINT so iperf3 can tell its server, then force-kills
//! the child's process group if it is still running after the grace period.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{ErrorCode, NO_ERROR};

use super::{Direction, Engine, EngineFactory, EngineSettings, Protocol, ReportingHook, TestState};

#[derive(Debug, Error)]
pub enum ThroughputError {
    #[error("iperf3 not found at {path}")]
    Iperf3NotFound { path: String },

    #[error("no running iperf3 process to signal")]
    NotRunning,
}

/// Grace period between SIGINT and SIGKILL when none is configured.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How often the reaper checks whether the child has exited.
const REAP_POLL: Duration = Duration::from_millis(20);

/// PID of the running child, `None` once it has been reaped.  Signals are
/// only sent while holding this lock, and the reaper clears it under the same
/// lock, so a signal never reaches a recycled pid.
type ChildSlot = Arc<Mutex<Option<u32>>>;

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// One line of `--json-stream` output.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    event: String,
    #[serde(default)]
    data: Value,
}

// ---------------------------------------------------------------------------
// Iperf3Engine
// ---------------------------------------------------------------------------

/// Engine backed by an `iperf3` child process.
pub struct Iperf3Engine {
    iperf3_path: String,
    settings: Mutex<Option<EngineSettings>>,
    start: Mutex<Option<Value>>,
    intervals: RwLock<Vec<Value>>,
    end: Mutex<Option<Value>>,
    hook: Mutex<Option<ReportingHook>>,
    last_error: AtomicI32,
    done: AtomicBool,
    child: ChildSlot,
    /// SIGINT already delivered to the current child.
    interrupted: AtomicBool,
    terminate_grace: Duration,
}

impl Iperf3Engine {
    pub fn new(iperf3_path: impl Into<String>) -> Self {
        let default_hook: ReportingHook = Arc::new(log_latest_interval);
        Self {
            iperf3_path: iperf3_path.into(),
            settings: Mutex::new(None),
            start: Mutex::new(None),
            intervals: RwLock::new(Vec::new()),
            end: Mutex::new(None),
            hook: Mutex::new(Some(default_hook)),
            last_error: AtomicI32::new(NO_ERROR),
            done: AtomicBool::new(false),
            child: Arc::new(Mutex::new(None)),
            interrupted: AtomicBool::new(false),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    /// Time a cancelled child gets to exit before it is killed.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Handle one line of iperf3 output.
    fn handle_line(&self, line: &str) {
        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                debug!(line = line, "ignoring non-JSON iperf3 output");
                return;
            }
        };

        match event.event.as_str() {
            "start" => {
                *self.start.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.data);
            }
            "interval" => {
                self.intervals
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.data);
                self.report();
            }
            "end" => {
                *self.end.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.data);
            }
            "error" => {
                let message = event.data.as_str().unwrap_or_default().to_string();
                self.record_error(&message);
            }
            other => {
                debug!(event = other, "ignoring iperf3 event");
            }
        }
    }

    /// Map an iperf3 error message onto the taxonomy and keep the first one.
    fn record_error(&self, message: &str) {
        let code = match ErrorCode::from_message(message) {
            Some(code) => code,
            None => {
                warn!(message = message, "unrecognised iperf3 error, reporting as init failure");
                ErrorCode::InitTest
            }
        };
        info!(code = code.code(), message = message, "iperf3 reported an error");
        let _ = self.last_error.compare_exchange(
            NO_ERROR,
            code.code(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Invoke the reporting hook without holding any engine lock.
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

    /// Send SIGINT to the child; iperf3 tells its server about the
    /// termination before exiting.  Arms the kill timer on first delivery.
    fn interrupt(&self) -> Result<()> {
        let running = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pid) = *running else {
            return Err(ThroughputError::NotRunning.into());
        };
        // A second SIGINT aborts iperf3 before it can notify the server.
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        signal_interrupt(pid)
            .map_err(|e| anyhow!("failed to signal iperf3 (pid {}): {}", pid, e))?;
        drop(running);

        spawn_kill_timer(self.child.clone(), pid, self.terminate_grace);
        Ok(())
    }

    /// Wait for the child to exit, clearing the slot in the same critical
    /// section that reaps it.
    fn reap(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        loop {
            {
                let mut running = self.child.lock().unwrap_or_else(PoisonError::into_inner);
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *running = None;
                        return Ok(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        *running = None;
                        return Err(e);
                    }
                }
            }
            thread::sleep(REAP_POLL);
        }
    }
}

/// After `grace`, SIGKILL the process group of `pid` if it is still the
/// running child.
fn spawn_kill_timer(child: ChildSlot, pid: u32, grace: Duration) {
    let spawned = thread::Builder::new()
        .name("iperf3-kill-timer".to_string())
        .spawn(move || {
            thread::sleep(grace);
            let running = child.lock().unwrap_or_else(PoisonError::into_inner);
            if *running != Some(pid) {
                return;
            }
            warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "iperf3 did not exit after SIGINT, sending SIGKILL"
            );
            if let Err(e) = signal_kill(pid) {
                warn!(pid, error = %e, "failed to SIGKILL iperf3");
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start iperf3 kill timer");
    }
}

#[cfg(unix)]
fn signal_interrupt(pid: u32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGINT) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// The child leads its own process group, so this also takes down anything
/// it forked that still holds the output pipes.
#[cfg(unix)]
fn signal_kill(pid: u32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if rc != 0 {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_interrupt(_pid: u32) -> std::io::Result<()> {
    Err(unsupported())
}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) -> std::io::Result<()> {
    Err(unsupported())
}

#[cfg(not(unix))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process signals are not supported on this platform",
    )
}

impl Engine for Iperf3Engine {
    fn apply(&self, settings: EngineSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings);
    }

    fn run_client(&self) -> i32 {
        let settings = self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(settings) = settings else {
            warn!("run_client called before settings were applied");
            self.last_error.store(ErrorCode::InitTest.code(), Ordering::SeqCst);
            return -1;
        };

        let args = build_args(&settings);
        debug!(path = self.iperf3_path.as_str(), ?args, "spawning iperf3 client");

        let mut command = Command::new(&self.iperf3_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C reaches only the bridge, which
        // then cancels through `interrupt`.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        self.interrupted.store(false, Ordering::SeqCst);
        let mut child = {
            let mut running = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            match command.spawn() {
                Ok(child) => {
                    *running = Some(child.id());
                    child
                }
                Err(e) => {
                    warn!(path = self.iperf3_path.as_str(), error = %e, "failed to spawn iperf3");
                    self.last_error.store(ErrorCode::NewTest.code(), Ordering::SeqCst);
                    return -1;
                }
            }
        };

        // Drained concurrently so a chatty child cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                if let Err(e) = pipe.read_to_end(&mut buf) {
                    debug!(error = %e, "failed to read iperf3 stderr");
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to read iperf3 output");
                        break;
                    }
                };
                if !line.trim().is_empty() {
                    self.handle_line(&line);
                }
                if self.done.load(Ordering::SeqCst) {
                    if let Err(e) = self.interrupt() {
                        debug!(error = %e, "iperf3 already stopping");
                    }
                }
            }
        }

        let status = self.reap(&mut child);
        let stderr = stderr_reader
            .map(|reader| reader.join().unwrap_or_default())
            .unwrap_or_default();

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "failed to wait for iperf3");
                return -1;
            }
        };
        debug!(exit_code = status.code(), "iperf3 exited");

        if !status.success() && self.last_error() == NO_ERROR {
            // iperf3 ends with a single `iperf3: error - ...` line.
            if let Some(line) = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
                self.record_error(line);
            }
        }

        let finished = self
            .end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if self.last_error() != NO_ERROR || !status.success() || !finished {
            return -1;
        }
        0
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
        match state {
            TestState::ClientTerminate | TestState::Done => self.interrupt(),
            other => Err(anyhow!("cannot send {:?} to the server from a client", other)),
        }
    }

    fn with_intervals(&self, f: &mut dyn FnMut(&[Value])) {
        let intervals = self.intervals.read().unwrap_or_else(PoisonError::into_inner);
        f(&intervals);
    }

    fn finish_report(&self) -> Option<String> {
        let end = self
            .end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let start = self
            .start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| json!({}));
        let intervals = self
            .intervals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let report = json!({
            "start": start,
            "intervals": intervals,
            "end": end,
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

/// Default reporting behaviour: trace-log the newest interval.
fn log_latest_interval(engine: &dyn Engine) {
    engine.with_intervals(&mut |records: &[Value]| {
        if let Some(latest) = records.last() {
            let bps = latest
                .get("sum")
                .and_then(|s| s.get("bits_per_second"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            trace!(interval = records.len(), bits_per_second = bps, "iperf3 interval");
        }
    });
}

/// Build the iperf3 command line for `settings`.
pub fn build_args(settings: &EngineSettings) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        settings.host.clone(),
        "-p".to_string(),
        settings.port.to_string(),
        "-t".to_string(),
        settings.duration_secs.to_string(),
        "-P".to_string(),
        settings.parallel.to_string(),
        "--connect-timeout".to_string(),
        settings.connect_timeout.as_millis().to_string(),
    ];

    if settings.json_output {
        args.push("--json-stream".to_string());
        args.push("--forceflush".to_string());
    }
    if settings.protocol == Protocol::Udp {
        args.push("-u".to_string());
    }
    if let Some(rate) = settings.rate_bps {
        args.push("-b".to_string());
        args.push(rate.to_string());
    }
    if settings.direction == Direction::Reverse {
        args.push("-R".to_string());
    }
    if settings.ipv4_only {
        args.push("-4".to_string());
    }

    args
}

// ---------------------------------------------------------------------------
// Iperf3Factory
// ---------------------------------------------------------------------------

/// Creates [`Iperf3Engine`]s for the configured binary.
pub struct Iperf3Factory {
    iperf3_path: String,
    terminate_grace: Duration,
}

impl Iperf3Factory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            iperf3_path: config.iperf3_path.clone(),
            terminate_grace: Duration::from_millis(config.terminate_grace_ms),
        }
    }
}

impl EngineFactory for Iperf3Factory {
    fn new_test(&self) -> Result<Arc<dyn Engine>> {
        // Bare command names are resolved through $PATH at spawn time.
        if self.iperf3_path.contains('/') && !Path::new(&self.iperf3_path).exists() {
            return Err(ThroughputError::Iperf3NotFound {
                path: self.iperf3_path.clone(),
            }
            .into());
        }
        Ok(Arc::new(
            Iperf3Engine::new(self.iperf3_path.clone()).with_terminate_grace(self.terminate_grace),
        ))
    }

    fn version(&self) -> String {
        match Command::new(&self.iperf3_path).arg("--version").output() {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            Err(e) => {
                debug!(path = self.iperf3_path.as_str(), error = %e, "could not query iperf3 version");
                "unknown".to_string()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> EngineSettings {
        EngineSettings {
            host: "198.51.100.7".into(),
            port: 5201,
            duration_secs: 10,
            parallel: 2,
            direction: Direction::Forward,
            protocol: Protocol::Tcp,
            rate_bps: None,
            json_output: true,
            connect_timeout: Duration::from_millis(5000),
            ipv4_only: true,
        }
    }

    #[test]
    fn test_build_args_tcp() {
        let args = build_args(&settings());
        assert_eq!(&args[..8], ["-c", "198.51.100.7", "-p", "5201", "-t", "10", "-P", "2"]);
        assert!(args.windows(2).any(|w| w == ["--connect-timeout", "5000"]));
        assert!(args.contains(&"--json-stream".to_string()));
        assert!(args.contains(&"-4".to_string()));
        assert!(!args.contains(&"-u".to_string()));
        assert!(!args.contains(&"-R".to_string()));
        assert!(!args.contains(&"-b".to_string()));
    }

    #[test]
    fn test_build_args_udp_reverse() {
        let mut s = settings();
        s.protocol = Protocol::Udp;
        s.direction = Direction::Reverse;
        s.rate_bps = Some(1_000_000);
        let args = build_args(&s);
        assert!(args.contains(&"-u".to_string()));
        assert!(args.contains(&"-R".to_string()));
        assert!(args.windows(2).any(|w| w == ["-b", "1000000"]));
    }

    #[test]
    fn test_stream_lines_feed_intervals_and_hook() {
        let engine = Iperf3Engine::new("iperf3");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hook: ReportingHook = Arc::new(move |_: &dyn Engine| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        engine.set_reporting_hook(Some(hook));

        engine.handle_line(r#"{"event":"start","data":{"test_start":{"protocol":"TCP","num_streams":1,"duration":2}}}"#);
        engine.handle_line(r#"{"event":"interval","data":{"streams":[],"sum":{"bytes":1000,"bits_per_second":8000.0}}}"#);
        engine.handle_line("not json at all");
        engine.handle_line(r#"{"event":"interval","data":{"streams":[],"sum":{"bytes":2000,"bits_per_second":16000.0}}}"#);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(crate::engine::interval_count(&engine), 2);
        assert!(engine.finish_report().is_none(), "no end event yet");

        engine.handle_line(r#"{"event":"end","data":{"sum_sent":{"bits_per_second":12000.0}}}"#);
        let report: Value = serde_json::from_str(&engine.finish_report().unwrap()).unwrap();
        assert_eq!(report["intervals"].as_array().unwrap().len(), 2);
        assert_eq!(report["start"]["test_start"]["protocol"], "TCP");
        assert_eq!(report["end"]["sum_sent"]["bits_per_second"], 12000.0);
    }

    #[test]
    fn test_error_event_sets_last_error() {
        let engine = Iperf3Engine::new("iperf3");
        engine.handle_line(r#"{"event":"error","data":"unable to connect to server - server may have stopped running or use a different port, firewall issue, etc.: Connection refused"}"#);
        assert_eq!(engine.last_error(), ErrorCode::Connect.code());

        // The first error wins.
        engine.handle_line(r#"{"event":"error","data":"unable to receive results"}"#);
        assert_eq!(engine.last_error(), ErrorCode::Connect.code());

        engine.reset_last_error();
        assert_eq!(engine.last_error(), NO_ERROR);
    }

    #[test]
    fn test_run_without_settings_fails() {
        let engine = Iperf3Engine::new("iperf3");
        assert_eq!(engine.run_client(), -1);
        assert_eq!(engine.last_error(), ErrorCode::InitTest.code());
    }

    #[test]
    fn test_run_with_missing_binary_fails() {
        let engine = Iperf3Engine::new("/nonexistent/bin/iperf3");
        engine.apply(settings());
        assert_eq!(engine.run_client(), -1);
        assert_eq!(engine.last_error(), ErrorCode::NewTest.code());
    }

    #[test]
    fn test_send_state_without_child_errors() {
        let engine = Iperf3Engine::new("iperf3");
        assert!(engine.send_state(TestState::ClientTerminate).is_err());
    }

    #[test]
    fn test_factory_rejects_missing_path() {
        let config = EngineConfig {
            iperf3_path: "/nonexistent/bin/iperf3".into(),
            ..EngineConfig::default()
        };
        let factory = Iperf3Factory::new(&config);
        let err = factory.new_test().err().unwrap();
        assert!(err.to_string().contains("iperf3 not found"));
        assert_eq!(factory.version(), "unknown");
    }

    #[test]
    fn test_default_hook_is_installed() {
        let engine = Iperf3Engine::new("iperf3");
        assert!(engine.reporting_hook().is_some());
    }

    #[test]
    fn test_factory_carries_terminate_grace() {
        let config = EngineConfig {
            terminate_grace_ms: 250,
            ..EngineConfig::default()
        };
        let factory = Iperf3Factory::new(&config);
        assert_eq!(factory.terminate_grace, Duration::from_millis(250));
        assert_eq!(
            Iperf3Engine::new("iperf3").terminate_grace,
            DEFAULT_TERMINATE_GRACE
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Engine whose iperf3 binary is the shell script `body`.
        fn scripted_binary(dir: &TempDir, body: &str) -> Iperf3Engine {
            let path = dir.path().join("iperf3");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            let engine = Iperf3Engine::new(path.to_string_lossy().into_owned());
            engine.apply(settings());
            engine
        }

        #[test]
        fn test_child_slot_cleared_after_exit() {
            let dir = TempDir::new().unwrap();
            let engine = scripted_binary(&dir, "exit 0");
            assert_eq!(engine.run_client(), -1, "no end event");
            assert!(engine.child.lock().unwrap().is_none());
            assert!(engine.send_state(TestState::ClientTerminate).is_err());
        }

        #[test]
        fn test_last_stderr_line_sets_error() {
            let dir = TempDir::new().unwrap();
            let engine = scripted_binary(
                &dir,
                "echo 'warning: something harmless' >&2\n\
                 echo 'iperf3: error - unable to create new timer: Function not implemented' >&2\n\
                 exit 1",
            );
            assert_eq!(engine.run_client(), -1);
            assert_eq!(engine.last_error(), ErrorCode::NewTimer.code());
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn test_child_leads_its_own_process_group() {
            let dir = TempDir::new().unwrap();
            let engine = scripted_binary(
                &dir,
                r#"pgid=$(cut -d' ' -f5 /proc/$$/stat)
if [ "$pgid" = "$$" ]; then
  echo '{"event":"end","data":{}}'
  exit 0
fi
echo '{"event":"error","data":"unable to create a new test"}'
exit 1"#,
            );
            assert_eq!(engine.run_client(), 0);
            assert_eq!(engine.last_error(), NO_ERROR);
        }
    }
}
