//! Error taxonomy for iperf3 client sessions.
//!
//! [`ErrorCode`] mirrors iperf3's `i_errno` numbering (100-series test and
//! control-channel errors, 200-series stream errors, 300-series timer
//! errors) plus a handful of sentinels defined by the bridge itself.  Every
//! code maps to exactly one fixed description.
//!
//! [`BridgeError`] covers the misuse cases that stop a session from starting
//! at all.  Everything that happens once a session is running is reported as
//! data in a [`ResultRecord`](crate::session::result::ResultRecord).

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw value iperf3 uses for "no error".
pub const NO_ERROR: i32 = 0;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Failure codes a session can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    // -- Local sentinels (outside the engine's own range) --
    Cancelled = -999,
    EngineUnavailable = -2,
    NoOutput = -1,

    // -- Test setup --
    Unimplemented = 13,
    NoSctp = 18,
    NewTest = 100,
    InitTest = 101,

    // -- Control channel --
    Listen = 102,
    Connect = 103,
    Accept = 104,
    SendCookie = 105,
    RecvCookie = 106,
    CtrlWrite = 107,
    CtrlRead = 108,
    CtrlClose = 109,
    Message = 110,
    SendMessage = 111,
    RecvMessage = 112,
    SendParams = 113,
    RecvParams = 114,
    PackageResults = 115,
    SendResults = 116,
    RecvResults = 117,
    Select = 118,
    ClientTerminated = 119,
    ServerTerminated = 120,
    AccessDenied = 121,

    // -- Streams --
    InitStream = 201,
    StreamListen = 202,
    StreamConnect = 203,
    StreamAccept = 204,
    StreamWrite = 205,
    StreamRead = 206,
    StreamClose = 207,
    StreamId = 208,

    // -- Timers --
    NewTimer = 300,
    UpdateTimer = 301,
}

/// Coarse grouping of [`ErrorCode`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorGroup {
    /// The engine could not set up the test locally.
    Setup,
    /// Control-socket, cookie, parameter and result exchange failures.
    ControlChannel,
    /// Data stream listen/connect/accept/read/write failures.
    Stream,
    Timer,
    /// Peer- or self-initiated termination; a normal terminal outcome.
    Termination,
    /// Codes produced by the bridge rather than the engine.
    Local,
}

impl ErrorCode {
    /// Every defined code, in numeric order within each group.
    pub const ALL: [ErrorCode; 37] = [
        ErrorCode::Cancelled,
        ErrorCode::EngineUnavailable,
        ErrorCode::NoOutput,
        ErrorCode::Unimplemented,
        ErrorCode::NoSctp,
        ErrorCode::NewTest,
        ErrorCode::InitTest,
        ErrorCode::Listen,
        ErrorCode::Connect,
        ErrorCode::Accept,
        ErrorCode::SendCookie,
        ErrorCode::RecvCookie,
        ErrorCode::CtrlWrite,
        ErrorCode::CtrlRead,
        ErrorCode::CtrlClose,
        ErrorCode::Message,
        ErrorCode::SendMessage,
        ErrorCode::RecvMessage,
        ErrorCode::SendParams,
        ErrorCode::RecvParams,
        ErrorCode::PackageResults,
        ErrorCode::SendResults,
        ErrorCode::RecvResults,
        ErrorCode::Select,
        ErrorCode::ClientTerminated,
        ErrorCode::ServerTerminated,
        ErrorCode::AccessDenied,
        ErrorCode::InitStream,
        ErrorCode::StreamListen,
        ErrorCode::StreamConnect,
        ErrorCode::StreamAccept,
        ErrorCode::StreamWrite,
        ErrorCode::StreamRead,
        ErrorCode::StreamClose,
        ErrorCode::StreamId,
        ErrorCode::NewTimer,
        ErrorCode::UpdateTimer,
    ];

    /// Numeric value as exposed to hosts.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a raw code.  Returns `None` for [`NO_ERROR`] and for values
    /// outside the taxonomy.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == raw)
    }

    /// Fixed human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "Test cancelled by user",
            ErrorCode::EngineUnavailable => "Failed to create test",
            ErrorCode::NoOutput => "No JSON output available",
            ErrorCode::Unimplemented => "function not implemented",
            ErrorCode::NoSctp => "SCTP not supported",
            ErrorCode::NewTest => "unable to create a new test",
            ErrorCode::InitTest => "test initialization failed",
            ErrorCode::Listen => "unable to listen for connections",
            ErrorCode::Connect => "unable to connect to server",
            ErrorCode::Accept => "unable to accept connection from client",
            ErrorCode::SendCookie => "unable to send cookie to server",
            ErrorCode::RecvCookie => "unable to receive cookie at server",
            ErrorCode::CtrlWrite => "unable to write to the control socket",
            ErrorCode::CtrlRead => "unable to read from the control socket",
            ErrorCode::CtrlClose => "control socket has closed unexpectedly",
            ErrorCode::Message => "received an unknown message",
            ErrorCode::SendMessage => "unable to send control message",
            ErrorCode::RecvMessage => "unable to receive control message",
            ErrorCode::SendParams => "unable to send parameters to server",
            ErrorCode::RecvParams => "unable to receive parameters from client",
            ErrorCode::PackageResults => "unable to package results",
            ErrorCode::SendResults => "unable to send results",
            ErrorCode::RecvResults => "unable to receive results",
            ErrorCode::Select => "select failed",
            ErrorCode::ClientTerminated => "the client has terminated",
            ErrorCode::ServerTerminated => "the server has terminated",
            ErrorCode::AccessDenied => "the server is busy running a test. try again later",
            ErrorCode::InitStream => "unable to initialize stream",
            ErrorCode::StreamListen => "unable to start stream listener",
            ErrorCode::StreamConnect => "unable to connect stream",
            ErrorCode::StreamAccept => "unable to accept stream connection",
            ErrorCode::StreamWrite => "unable to write to stream socket",
            ErrorCode::StreamRead => "unable to read from stream (check network/firewall)",
            ErrorCode::StreamClose => "stream has closed unexpectedly",
            ErrorCode::StreamId => "stream has invalid ID",
            ErrorCode::NewTimer => "unable to create new timer",
            ErrorCode::UpdateTimer => "unable to update timer",
        }
    }

    pub fn group(self) -> ErrorGroup {
        match self {
            ErrorCode::Cancelled | ErrorCode::EngineUnavailable | ErrorCode::NoOutput => {
                ErrorGroup::Local
            }
            ErrorCode::Unimplemented
            | ErrorCode::NoSctp
            | ErrorCode::NewTest
            | ErrorCode::InitTest => ErrorGroup::Setup,
            ErrorCode::ClientTerminated | ErrorCode::ServerTerminated => ErrorGroup::Termination,
            ErrorCode::InitStream
            | ErrorCode::StreamListen
            | ErrorCode::StreamConnect
            | ErrorCode::StreamAccept
            | ErrorCode::StreamWrite
            | ErrorCode::StreamRead
            | ErrorCode::StreamClose
            | ErrorCode::StreamId => ErrorGroup::Stream,
            ErrorCode::NewTimer | ErrorCode::UpdateTimer => ErrorGroup::Timer,
            _ => ErrorGroup::ControlChannel,
        }
    }

    /// Describe a raw code, falling back to `unknown error (code=<N>)`.
    pub fn describe(raw: i32) -> String {
        match Self::from_raw(raw) {
            Some(code) => code.description().to_string(),
            None => format!("unknown error (code={})", raw),
        }
    }

    /// Map an iperf3 error line (e.g. `"unable to connect to server - server
    /// may have stopped running...: Connection refused"`) back onto the
    /// taxonomy by matching the fixed description it starts from.
    ///
    /// iperf3 appends `strerror` text to many messages, so the description
    /// found earliest in the line wins, and the longer one on a tie.
    pub fn from_message(message: &str) -> Option<Self> {
        let message = message.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .filter(|c| c.group() != ErrorGroup::Local)
            .filter_map(|c| {
                let key = c.match_key().to_ascii_lowercase();
                message.find(&key).map(|pos| (pos, Reverse(key.len()), c))
            })
            .min_by_key(|&(pos, len, _)| (pos, len))
            .map(|(_, _, c)| c)
    }

    /// Description with any parenthesised hint removed; iperf3 itself does not
    /// print the hints.
    fn match_key(self) -> &'static str {
        let desc = self.description();
        match desc.find(" (") {
            Some(idx) => &desc[..idx],
            None => desc,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code={})", self.description(), self.code())
    }
}

// ---------------------------------------------------------------------------
// BridgeError
// ---------------------------------------------------------------------------

/// Errors that prevent a session from being started or registered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("an iperf3 client session is already active")]
    SessionAlreadyActive,

    #[error("a session is already registered for cancellation")]
    AlreadyActive,

    #[error("invalid client parameters: {0}")]
    InvalidParams(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
