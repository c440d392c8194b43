//! Tunnel session lifecycle
//!
//! A [`TunnelSession`] owns one authenticated transport connection and
//! everything spawned on its behalf. State only moves forward:
//!
//! ```text
//! Connecting ──▶ Established ──▶ Draining ──▶ Closed
//!                     └──────── peer gone ───────┘
//! ```

pub mod config;
pub mod control;
pub mod flows;
pub mod session;

pub use config::SessionConfig;
pub use control::{
    control_reader, next_control_line, request_discovery, serve_control, ControlExit,
    ControlReader, MAX_CONTROL_LINE,
};
pub use flows::FlowTracker;
pub use session::{connect, SessionListener, SessionState, TunnelSession};

use qtun_proto::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Failed to accept session: {0}")]
    AcceptFailed(String),

    #[error("Failed to open stream: {0}")]
    StreamOpenFailed(String),

    #[error("Failed to accept stream: {0}")]
    StreamAcceptFailed(String),

    #[error("Control stream error: {0}")]
    Control(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
