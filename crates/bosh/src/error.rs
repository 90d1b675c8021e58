use std::time::Duration;

use thiserror::Error;

use crate::reader::{StanzaErrorInfo, StreamErrorInfo};

/// Failure reported by the long-poll transport client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BoshError {
    #[error("invalid BOSH client configuration: {0}")]
    InvalidConfig(String),

    #[error("BOSH request failed: {0}")]
    Request(String),

    #[error("BOSH session terminated by connection manager: {condition}")]
    Terminated { condition: String },

    #[error("BOSH client is closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaslError {
    /// The mechanism itself failed to compute a response.
    #[error("SASL mechanism {mechanism} failed: {message}")]
    Local { mechanism: String, message: String },

    /// The server answered with `<failure/>`.
    #[error("SASL authentication {mechanism} failed: {condition}{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    Failure {
        mechanism: String,
        condition: String,
        text: Option<String>,
    },

    #[error("no supported SASL mechanism found; server offers: {}", .offered.join(", "))]
    NoSharedMechanism { offered: Vec<String> },
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("failed to set up BOSH session: {0}")]
    Setup(#[source] BoshError),

    #[error("Timeout reached for the connection to {host}:{port}.")]
    SessionTimeout { host: String, port: u16 },

    #[error("not connected to a server")]
    IllegalState,

    #[error("the connection is not connected")]
    NotConnected,

    #[error("failed to restart stream after SASL authentication: {0}")]
    AuthenticationRestart(#[source] BoshError),

    #[error("stream error: {0}")]
    Stream(StreamErrorInfo),

    #[error("XMPP error: {0}")]
    Xmpp(StanzaErrorInfo),

    #[error(transparent)]
    Sasl(#[from] SaslError),

    #[error("no response received within {}ms while waiting for {waiting_for}", .timeout.as_millis())]
    NoResponse {
        waiting_for: String,
        timeout: Duration,
    },

    #[error("interrupted while waiting for {waiting_for}")]
    Interrupted { waiting_for: String },

    #[error("transport error: {0}")]
    Transport(#[from] BoshError),

    #[error("failed to parse inbound body: {0}")]
    Parse(String),

    #[error("client is already logged in")]
    AlreadyLoggedIn,

    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ConnectionError {
    /// Whether the error ends the session rather than a single operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionError::Stream(_))
    }

    pub(crate) fn no_response(waiting_for: impl Into<String>, timeout: Duration) -> Self {
        ConnectionError::NoResponse {
            waiting_for: waiting_for.into(),
            timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("processor failed: {0}")]
    ProcessorFailed(String),
}

impl From<PipelineError> for ConnectionError {
    fn from(error: PipelineError) -> Self {
        ConnectionError::Parse(error.to_string())
    }
}
