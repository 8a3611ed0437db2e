//! TOML configuration for the iperf3 bridge.
//!
//! Every section has compiled-in defaults, so an empty or partial file is
//! valid.  The file location can be overridden with the
//! `IPERF3_BRIDGE_CONFIG` environment variable.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "IPERF3_BRIDGE_CONFIG";

/// Standard system-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/iperf3-bridge/bridge.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub client: ClientDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded bridge configuration");
        Ok(config)
    }

    /// Try, in order: `$IPERF3_BRIDGE_CONFIG`, [`SYSTEM_CONFIG_PATH`], then
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "IPERF3_BRIDGE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// How the iperf3 engine is located and tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path (or bare command name resolved via `$PATH`) to the iperf3 binary.
    /// Must support `--json-stream` (iperf3 3.17 or newer).
    pub iperf3_path: String,
    /// Control connection timeout.  Kept short so unreachable peers fail fast.
    pub connect_timeout_ms: u64,
    /// UDP target bitrate used when the caller passes no bandwidth.
    pub default_udp_rate_bps: u64,
    /// How long a cancelled iperf3 gets to notify its server and exit before
    /// it is killed.
    pub terminate_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            iperf3_path: "iperf3".to_string(),
            connect_timeout_ms: 5000,
            default_udp_rate_bps: 1_000_000,
            terminate_grace_ms: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Client defaults
// ---------------------------------------------------------------------------

/// Defaults for CLI arguments the user leaves out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientDefaults {
    pub port: u16,
    pub duration_secs: u32,
    pub parallel: u32,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            port: 5201,
            duration_secs: 10,
            parallel: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
