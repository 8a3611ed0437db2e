use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use iperf3_bridge::config::{BridgeConfig, LoggingConfig};
use iperf3_bridge::report::{format_progress, format_summary};
use iperf3_bridge::session::{Bridge, CallbackAdapter, ChannelContext, ClientParams, ProgressEvent};

#[derive(Parser)]
#[command(
    name = "iperf3-bridge",
    about = "Cancellable iperf3 client tests with live per-interval progress",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $IPERF3_BRIDGE_CONFIG, then /etc/iperf3-bridge/bridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an iperf3 client test against a server
    Run {
        /// Server host name or IPv4 address
        host: String,

        /// Server port
        #[arg(long)]
        port: Option<u16>,

        /// Test duration in seconds
        #[arg(long)]
        duration: Option<u32>,

        /// Number of parallel streams
        #[arg(long)]
        parallel: Option<u32>,

        /// Server sends, client receives (download)
        #[arg(long)]
        reverse: bool,

        /// Use UDP instead of TCP
        #[arg(long)]
        udp: bool,

        /// Target bitrate in bits/sec (0 = engine default)
        #[arg(long, default_value_t = 0)]
        bandwidth: u64,

        /// JSON lines output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the bridge and iperf3 versions
    Version,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            host,
            port,
            duration,
            parallel,
            reverse,
            udp,
            bandwidth,
            json,
        } => {
            let params = ClientParams {
                host,
                port: port.unwrap_or(config.client.port),
                duration_secs: duration.unwrap_or(config.client.duration_secs),
                parallel: parallel.unwrap_or(config.client.parallel),
                reverse,
                use_udp: udp,
                bandwidth_bps: bandwidth,
            };
            run_test(&config, params, json).await?;
        }
        Commands::Version => {
            let bridge = Bridge::from_config(&config);
            println!("iperf3-bridge {}", env!("CARGO_PKG_VERSION"));
            println!("engine: {}", bridge.get_version());
        }
    }

    Ok(())
}

fn print_progress(event: &ProgressEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}", format_progress(event));
    }
    Ok(())
}

async fn run_test(config: &BridgeConfig, params: ClientParams, json: bool) -> Result<()> {
    // Created on this thread, so the event loop itself stays attached and the
    // blocking worker attaches per interval.
    let (context, mut events) = ChannelContext::new();
    let bridge = Arc::new(Bridge::from_config(config).with_progress(CallbackAdapter::new(context)));

    let worker_bridge = bridge.clone();
    let mut worker = tokio::task::spawn_blocking(move || worker_bridge.run(&params));

    let joined = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => print_progress(&event, json)?,
            joined = &mut worker => break joined,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                if bridge.request_cancel() {
                    tracing::info!("Ctrl-C received, cancelling test");
                }
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        print_progress(&event, json)?;
    }

    let result = joined.context("session worker panicked")??;
    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else if result.success {
        println!("{}", format_summary(&result));
    }

    if !result.success {
        anyhow::bail!(
            "{}",
            result.error_message.as_deref().unwrap_or("iperf3 test failed")
        );
    }
    Ok(())
}
