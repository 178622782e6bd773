//! Server error taxonomy
//!
//! Errors are split by how the tick loop reacts to them: protocol violations
//! are logged and the offending message dropped, resource violations degrade
//! the current tick, persistence failures abort the write and leave the
//! in-memory state authoritative.

use shared::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("packet encode failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("message for session {session} would exceed the {mtu}-byte packet budget ({size} bytes)")]
    OversizedMessage {
        session: SessionId,
        size: usize,
        mtu: usize,
    },
}

/// Why a login attempt was refused before a session was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginRefusal {
    #[error("protocol version mismatch (client {client}, server {server})")]
    VersionMismatch { client: u32, server: u32 },

    #[error("banned: {0}")]
    Banned(String),

    #[error("you are not on this server's whitelist")]
    NotWhitelisted,

    #[error("server is full")]
    ServerFull,
}

/// Why the vote coordinator refused to start a vote.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoteRefusal {
    #[error("please wait {seconds_left:.0} seconds before starting another vote of this kind")]
    Cooldown { seconds_left: f32 },

    #[error("this vote type is disabled on this server")]
    Disabled,
}

/// Ban list / whitelist / permission store persistence failures. The caller
/// logs these and keeps the in-memory state authoritative.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: malformed entry: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },
}
