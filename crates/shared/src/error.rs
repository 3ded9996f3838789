use std::time::Duration;

use thiserror::Error;

/// Fatal: the conferencing engine could not be brought up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineLoadError {
    #[error("failed to fetch engine script: {0}")]
    ScriptFetch(String),
    #[error("engine script does not expose constructor {constructor}")]
    MissingConstructor { constructor: String },
    #[error("failed to instantiate engine: {0}")]
    Instantiate(String),
    #[error("engine did not load within {0:?}")]
    Timeout(Duration),
    #[error("engine adapter was disposed before loading finished")]
    Disposed,
}

/// Non-fatal: captions are unavailable but the conference continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to connect caption channel: {0}")]
    Connect(String),
    #[error("caption channel handshake did not finish within {0:?}")]
    Timeout(Duration),
    #[error("caption channel rejected connection: {0}")]
    Rejected(String),
    #[error("caption channel disconnected: {0}")]
    Disconnected(String),
    #[error("caption stream was closed before connecting finished")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine.io packet type {0:?}")]
    UnknownEnginePacket(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketPacket(char),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(value: serde_json::Error) -> Self {
        Self::Malformed(value.to_string())
    }
}
