use std::{collections::BTreeMap, sync::Arc};

use crate::{body::ComposableBody, error::BoshError};

/// Settings handed to the long-poll client when a session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshClientConfig {
    pub uri: String,
    pub domain: String,
    pub proxy: Option<(String, u16)>,
    pub compression: bool,
    pub http_headers: BTreeMap<String, String>,
}

impl BoshClientConfig {
    pub fn new(uri: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            domain: domain.into(),
            proxy: None,
            compression: false,
            http_headers: BTreeMap::new(),
        }
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some((host.into(), port));
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.insert(name.into(), value.into());
        self
    }
}

/// Connection state change reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(BoshError),
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected)
    }

    pub fn cause(&self) -> Option<&BoshError> {
        match self {
            ConnectionEvent::Error(cause) => Some(cause),
            _ => None,
        }
    }
}

/// A body that was received from, or sent to, the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshMessageEvent {
    pub body: Option<String>,
}

impl BoshMessageEvent {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
        }
    }
}

pub trait BoshConnectionListener: Send + Sync + 'static {
    fn connection_event(&self, event: ConnectionEvent);
}

pub trait BoshResponseListener: Send + Sync + 'static {
    fn response_received(&self, event: BoshMessageEvent);
}

pub trait BoshRequestListener: Send + Sync + 'static {
    fn request_sent(&self, event: BoshMessageEvent);
}

/// HTTP long-poll client for one BOSH session.
///
/// Listener callbacks are invoked on execution contexts owned by the
/// implementation, possibly in parallel with the caller. Implementations
/// must not invoke listeners re-entrantly from inside [`BoshClient::send`].
pub trait BoshClient: Send + Sync + 'static {
    /// Queue a body for delivery to the connection manager.
    fn send(&self, body: ComposableBody) -> Result<(), BoshError>;

    /// Terminate the session gracefully.
    fn disconnect(&self) -> Result<(), BoshError>;

    /// Release the client without notifying the connection manager.
    fn close(&self);

    fn add_connection_listener(&self, listener: Arc<dyn BoshConnectionListener>);

    fn add_response_listener(&self, listener: Arc<dyn BoshResponseListener>);

    fn add_request_listener(&self, listener: Arc<dyn BoshRequestListener>);
}

/// Creates a fresh [`BoshClient`] for every connect attempt.
pub trait BoshClientFactory: Send + Sync + 'static {
    type Client: BoshClient;

    fn create(&self, config: BoshClientConfig) -> Result<Self::Client, BoshError>;
}

impl<C> BoshClient for Arc<C>
where
    C: BoshClient + ?Sized,
{
    fn send(&self, body: ComposableBody) -> Result<(), BoshError> {
        (**self).send(body)
    }

    fn disconnect(&self) -> Result<(), BoshError> {
        (**self).disconnect()
    }

    fn close(&self) {
        (**self).close()
    }

    fn add_connection_listener(&self, listener: Arc<dyn BoshConnectionListener>) {
        (**self).add_connection_listener(listener)
    }

    fn add_response_listener(&self, listener: Arc<dyn BoshResponseListener>) {
        (**self).add_response_listener(listener)
    }

    fn add_request_listener(&self, listener: Arc<dyn BoshRequestListener>) {
        (**self).add_request_listener(listener)
    }
}
