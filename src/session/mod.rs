//! Client session bridge.
//!
//! [`Bridge`] is the host-facing surface: run one blocking client test with
//! per-interval progress, cancel it from any thread, and report the engine
//! version.  It owns all session state; there are no process-wide globals.

pub mod cancel;
pub mod interval;
pub mod marshal;
pub mod progress;
pub mod result;
pub mod runner;

use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::engine::iperf::Iperf3Factory;
use crate::engine::EngineFactory;
use crate::error::BridgeError;

pub use cancel::SessionState;
pub use marshal::{CallbackAdapter, ChannelContext, ExecutionContext, InlineContext};
pub use progress::ProgressEvent;
pub use result::ResultRecord;
pub use runner::{ClientParams, SessionRunner};

pub struct Bridge {
    runner: SessionRunner,
    progress: Option<Arc<CallbackAdapter>>,
}

impl Bridge {
    pub fn new(factory: Arc<dyn EngineFactory>, config: &BridgeConfig) -> Self {
        Self {
            runner: SessionRunner::new(factory, config.engine.clone()),
            progress: None,
        }
    }

    /// Bridge over the configured iperf3 binary.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(Arc::new(Iperf3Factory::new(&config.engine)), config)
    }

    /// Deliver progress events through `adapter`.
    pub fn with_progress(mut self, adapter: CallbackAdapter) -> Self {
        self.progress = Some(Arc::new(adapter));
        self
    }

    /// Run one client test, blocking until it ends.
    pub fn run(&self, params: &ClientParams) -> Result<ResultRecord, BridgeError> {
        self.runner.start(params, self.progress.clone())
    }

    /// Positional form of [`Bridge::run`], matching the host call signature.
    #[allow(clippy::too_many_arguments)]
    pub fn run_client(
        &self,
        host: &str,
        port: u16,
        duration_secs: u32,
        parallel: u32,
        reverse: bool,
        use_udp: bool,
        bandwidth_bps: u64,
    ) -> Result<ResultRecord, BridgeError> {
        self.run(&ClientParams {
            host: host.to_string(),
            port,
            duration_secs,
            parallel,
            reverse,
            use_udp,
            bandwidth_bps,
        })
    }

    /// Cancel the running test, if any.  Safe from any thread.
    pub fn request_cancel(&self) -> bool {
        self.runner.cancel()
    }

    pub fn get_version(&self) -> String {
        self.runner.version()
    }

    pub fn state(&self) -> SessionState {
        self.runner.state()
    }
}
