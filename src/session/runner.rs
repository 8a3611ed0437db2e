//! Session runner.
//!
//! Drives one client session through `Idle -> Configuring -> Running ->
//! {Succeeded, Failed, Cancelled} -> Idle` on the calling thread.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{Direction, EngineFactory, EngineSettings, Protocol};
use crate::error::{BridgeError, ErrorCode, ErrorGroup};

use super::cancel::{CancellationCoordinator, SessionState};
use super::marshal::CallbackAdapter;
use super::progress::ProgressNotifier;
use super::result::{assemble, EngineOutcome, ResultRecord};

// ---------------------------------------------------------------------------
// Client parameters
// ---------------------------------------------------------------------------

/// Caller-supplied parameters of one client test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientParams {
    pub host: String,
    pub port: u16,
    #[serde(rename = "duration")]
    pub duration_secs: u32,
    pub parallel: u32,
    pub reverse: bool,
    pub use_udp: bool,
    /// Target bitrate in bits/sec, `0` for the engine default.
    #[serde(default)]
    pub bandwidth_bps: u64,
}

impl ClientParams {
    /// TCP upload to `host` on the default port, 10 s, one stream.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 5201,
            duration_secs: 10,
            parallel: 1,
            reverse: false,
            use_udp: false,
            bandwidth_bps: 0,
        }
    }

    pub fn protocol(&self) -> Protocol {
        if self.use_udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        validate_host(&self.host)?;
        if self.port == 0 {
            return Err(BridgeError::InvalidParams("port must be non-zero".into()));
        }
        if self.duration_secs == 0 {
            return Err(BridgeError::InvalidParams("duration must be non-zero".into()));
        }
        if self.parallel == 0 {
            return Err(BridgeError::InvalidParams(
                "parallel stream count must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Engine settings for these parameters.
    pub fn to_settings(&self, config: &EngineConfig) -> EngineSettings {
        let rate_bps = match self.protocol() {
            Protocol::Udp if self.bandwidth_bps > 0 => Some(self.bandwidth_bps),
            Protocol::Udp => Some(config.default_udp_rate_bps),
            Protocol::Tcp => Some(self.bandwidth_bps).filter(|bps| *bps > 0),
        };

        EngineSettings {
            host: self.host.clone(),
            port: self.port,
            duration_secs: self.duration_secs,
            parallel: self.parallel,
            direction: if self.reverse {
                Direction::Reverse
            } else {
                Direction::Forward
            },
            protocol: self.protocol(),
            rate_bps,
            json_output: true,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ipv4_only: true,
        }
    }
}

/// Host names end up on the iperf3 command line.
fn validate_host(host: &str) -> Result<(), BridgeError> {
    if host.is_empty() {
        return Err(BridgeError::InvalidParams("host cannot be empty".into()));
    }
    if host.starts_with('-') {
        return Err(BridgeError::InvalidParams(
            "host cannot start with hyphen".into(),
        ));
    }
    // Allow alphanumeric, dot, hyphen, underscore, colon (IPv6)
    if host
        .chars()
        .any(|c| !c.is_alphanumeric() && !matches!(c, '.' | '-' | '_' | ':'))
    {
        return Err(BridgeError::InvalidParams(
            "host contains invalid characters".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SessionRunner
// ---------------------------------------------------------------------------

pub struct SessionRunner {
    factory: Arc<dyn EngineFactory>,
    coordinator: Arc<CancellationCoordinator>,
    config: EngineConfig,
}

impl SessionRunner {
    pub fn new(factory: Arc<dyn EngineFactory>, config: EngineConfig) -> Self {
        Self {
            factory,
            coordinator: Arc::new(CancellationCoordinator::new()),
            config,
        }
    }

    /// Run one client test to completion on the calling thread.
    ///
    /// Only misuse is returned as `Err`; every test outcome, including
    /// cancellation and engine failures, is a [`ResultRecord`].
    pub fn start(
        &self,
        params: &ClientParams,
        progress: Option<Arc<CallbackAdapter>>,
    ) -> Result<ResultRecord, BridgeError> {
        let slot = self.coordinator.reserve()?;
        params.validate()?;

        let session_id = Uuid::new_v4();
        let span = info_span!("client_session", %session_id, host = %params.host, port = params.port);
        let _enter = span.enter();

        info!(
            duration_secs = params.duration_secs,
            parallel = params.parallel,
            protocol = %params.protocol(),
            reverse = params.reverse,
            bandwidth_bps = params.bandwidth_bps,
            "starting iperf3 client test"
        );

        let engine = match self.factory.new_test() {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "failed to create iperf3 test");
                slot.finish(SessionState::Failed);
                return Ok(ResultRecord::from_code(ErrorCode::EngineUnavailable));
            }
        };

        engine.apply(params.to_settings(&self.config));
        let original = engine.reporting_hook();
        let notifier = Arc::new(ProgressNotifier::new(
            original.clone(),
            self.coordinator.clone(),
            progress,
        ));
        engine.set_reporting_hook(Some(notifier.into_hook()));

        if let Err(e) = self.coordinator.register(&engine) {
            engine.set_reporting_hook(original);
            return Err(e);
        }

        engine.reset_last_error();
        let return_code = engine.run_client();
        let last_error = engine.last_error();
        let cancelled = self.coordinator.unregister();

        let outcome = EngineOutcome {
            return_code,
            last_error,
            cancelled,
        };
        let result = assemble(&outcome, engine.as_ref(), params.protocol());
        let state = result.terminal_state();
        log_outcome(&result, state);
        slot.finish(state);

        engine.set_reporting_hook(original);
        drop(engine);
        Ok(result)
    }

    /// Ask the running session to stop.  Safe from any thread and in any
    /// state; returns whether a session was there to cancel.
    pub fn cancel(&self) -> bool {
        self.coordinator.request_cancel()
    }

    pub fn state(&self) -> SessionState {
        self.coordinator.state()
    }

    pub fn coordinator(&self) -> &Arc<CancellationCoordinator> {
        &self.coordinator
    }

    pub fn version(&self) -> String {
        self.factory.version()
    }
}

fn log_outcome(result: &ResultRecord, state: SessionState) {
    if result.success {
        info!(
            %state,
            send_mbps = result.send_mbps,
            receive_mbps = result.receive_mbps,
            "iperf3 client test finished"
        );
        return;
    }

    let code = result.error_code.unwrap_or_default();
    let message = result.error_message.as_deref().unwrap_or_default();
    match result.error_kind().map(ErrorCode::group) {
        Some(ErrorGroup::Termination) => {
            info!(%state, code, message, "iperf3 client test terminated");
        }
        _ if state == SessionState::Cancelled => {
            info!(%state, "iperf3 client test cancelled by user");
        }
        _ => {
            warn!(%state, code, message, "iperf3 client test failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Script, ScriptedFactory};
    use crate::engine::{Engine, ReportingHook};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner(factory: ScriptedFactory) -> (SessionRunner, Arc<ScriptedFactory>) {
        let factory = Arc::new(factory);
        let runner = SessionRunner::new(factory.clone(), EngineConfig::default());
        (runner, factory)
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        let ok = ClientParams::new("iperf.example.net");
        assert!(ok.validate().is_ok());
        assert!(ClientParams::new("fe80::1").validate().is_ok());

        for bad in ["", "-R", "host;rm", "a b"] {
            assert!(
                matches!(ClientParams::new(bad).validate(), Err(BridgeError::InvalidParams(_))),
                "{bad:?} should be rejected"
            );
        }

        let mut p = ok.clone();
        p.port = 0;
        assert!(p.validate().is_err());
        let mut p = ok.clone();
        p.duration_secs = 0;
        assert!(p.validate().is_err());
        let mut p = ok;
        p.parallel = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_settings_rate_selection() {
        let config = EngineConfig::default();

        let mut p = ClientParams::new("10.0.0.1");
        assert_eq!(p.to_settings(&config).rate_bps, None);
        p.bandwidth_bps = 50_000_000;
        assert_eq!(p.to_settings(&config).rate_bps, Some(50_000_000));

        p.use_udp = true;
        p.bandwidth_bps = 0;
        let s = p.to_settings(&config);
        assert_eq!(s.protocol, Protocol::Udp);
        assert_eq!(s.rate_bps, Some(1_000_000));

        p.reverse = true;
        let s = p.to_settings(&config);
        assert_eq!(s.direction, Direction::Reverse);
        assert!(s.json_output);
        assert!(s.ipv4_only);
        assert_eq!(s.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_params_leave_runner_idle() {
        let (runner, factory) = runner(ScriptedFactory::new(Script::tcp(1, 1.0)));
        let err = runner.start(&ClientParams::new(""), None).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParams(_)));
        assert_eq!(runner.state(), SessionState::Idle);
        assert_eq!(factory.created_count(), 0);
    }

    #[test]
    fn test_engine_unavailable() {
        let (runner, _) = runner(ScriptedFactory::new(Script::tcp(1, 1.0)).unavailable());
        let result = runner.start(&ClientParams::new("10.0.0.1"), None).unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code, Some(-2));
        assert_eq!(result.error_message.as_deref(), Some("Failed to create test"));
        assert_eq!(runner.state(), SessionState::Idle);
    }

    #[test]
    fn test_settings_reach_engine() {
        let (runner, factory) = runner(ScriptedFactory::new(Script::udp(2, 1_000_000.0, 0.1, 0)));
        let mut params = ClientParams::new("10.0.0.1");
        params.use_udp = true;
        params.parallel = 4;
        runner.start(&params, None).unwrap();

        let settings = factory.last_engine().unwrap().settings().unwrap();
        assert_eq!(settings.parallel, 4);
        assert_eq!(settings.protocol, Protocol::Udp);
        assert_eq!(settings.rate_bps, Some(1_000_000));
    }

    #[test]
    fn test_original_hook_chained_and_restored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hook: ReportingHook = Arc::new(move |_: &dyn Engine| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (runner, factory) =
            runner(ScriptedFactory::new(Script::tcp(3, 1_000.0)).with_default_hook(hook.clone()));

        let result = runner.start(&ClientParams::new("10.0.0.1"), None).unwrap();
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let engine = factory.last_engine().unwrap();
        let restored = engine.reporting_hook().unwrap();
        assert!(Arc::ptr_eq(&restored, &hook));
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let (runner, _) = runner(ScriptedFactory::new(Script::tcp(1, 1.0)));
        assert!(!runner.cancel());
        assert_eq!(runner.state(), SessionState::Idle);
    }

    #[test]
    fn test_runner_is_reusable() {
        let (runner, factory) = runner(ScriptedFactory::new(Script::tcp(2, 1_000.0)));
        for _ in 0..3 {
            assert!(runner.start(&ClientParams::new("10.0.0.1"), None).unwrap().success);
            assert_eq!(runner.state(), SessionState::Idle);
        }
        assert_eq!(factory.created_count(), 3);
    }
}
