use xmpp_parsers::{jid::FullJid, minidom::Element};

use crate::{error::ConnectionError, reader::StreamFeatures, stanza::Stanza};

/// Capacity of the broadcast channel behind [`crate::BoshConnection::subscribe`].
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything a session tells its subscribers about.
///
/// Subscribers that fall behind lose the oldest events; the session itself
/// never blocks on them.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The transport reported an established BOSH session.
    Connected,
    /// SASL succeeded and, if the server offered it, a resource was bound.
    Authenticated { jid: Option<FullJid> },
    /// [`crate::BoshConnection::disconnect`] completed.
    ConnectionClosed,
    ConnectionError(ConnectionError),
    /// An inbound stanza that survived the inbound pipeline.
    Stanza(Stanza),
    /// A top-level element that is neither a stanza nor part of the SASL exchange.
    Nonza(Element),
    Features(StreamFeatures),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Authenticated { .. } => "authenticated",
            SessionEvent::ConnectionClosed => "connection_closed",
            SessionEvent::ConnectionError(_) => "connection_error",
            SessionEvent::Stanza(_) => "stanza",
            SessionEvent::Nonza(_) => "nonza",
            SessionEvent::Features(_) => "features",
        }
    }
}
