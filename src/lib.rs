//! iperf3-bridge -- cancellable iperf3 client sessions with live progress.
//!
//! This crate wraps an iperf3 client test behind a blocking, host-friendly
//! call: per-interval progress is delivered to a host callback while the test
//! runs, a test can be cancelled from any thread, and every outcome comes
//! back as one [`session::ResultRecord`].

pub mod config;
pub mod engine;
pub mod error;
pub mod report;
pub mod session;

pub use session::{Bridge, ClientParams, ProgressEvent, ResultRecord};
