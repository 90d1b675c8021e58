//! Routing of inbound `<body/>` payloads.
//!
//! Every body delivered by the transport is parsed once, its session
//! identifiers are latched, and each top-level child is routed in document
//! order. Errors end the body; they never escape [`read_body`].

use std::{fmt, str::FromStr};

use tracing::{debug, trace};
use xmpp_parsers::minidom::Element;

use crate::error::ConnectionError;

pub const STREAMS_NS: &str = "http://etherx.jabber.org/streams";
pub const STREAM_ERRORS_NS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const STANZA_ERRORS_NS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const JABBER_CLIENT: &str = "jabber:client";

/// A `<stream:error/>` received inside a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorInfo {
    pub condition: String,
    pub text: Option<String>,
}

impl StreamErrorInfo {
    pub fn from_element(element: &Element) -> Self {
        let (condition, text) = condition_and_text(element, STREAM_ERRORS_NS);
        Self { condition, text }
    }
}

impl fmt::Display for StreamErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.condition)?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

/// A top-level `<error/>` outside the stream namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaErrorInfo {
    pub error_type: Option<String>,
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaErrorInfo {
    pub fn from_element(element: &Element) -> Self {
        let (condition, text) = condition_and_text(element, STANZA_ERRORS_NS);
        Self {
            error_type: element.attr("type").map(str::to_string),
            condition,
            text,
        }
    }
}

impl fmt::Display for StanzaErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{error_type}/{}", self.condition)?,
            None => f.write_str(&self.condition)?,
        }
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

fn condition_and_text(element: &Element, condition_ns: &str) -> (String, Option<String>) {
    let condition = element
        .children()
        .find(|child| child.has_ns(condition_ns) && child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .children()
        .find(|child| child.name() == "text")
        .map(Element::text)
        .filter(|text| !text.is_empty());
    (condition, text)
}

/// Stream features announced by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFeatures {
    pub mechanisms: Vec<String>,
    pub bind: bool,
    pub element: Element,
}

impl StreamFeatures {
    pub fn from_element(element: Element) -> Self {
        let mechanisms = element
            .get_child("mechanisms", SASL_NS)
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .filter(|child| child.is("mechanism", SASL_NS))
                    .map(|child| child.text().trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let bind = element.has_child("bind", BIND_NS);

        Self {
            mechanisms,
            bind,
            element,
        }
    }

    pub fn offers_mechanism(&self, name: &str) -> bool {
        self.mechanisms.iter().any(|offered| offered == name)
    }
}

/// How one top-level child of a body is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundElement {
    Stanza,
    Features,
    StreamError,
    StanzaError,
    Nonza,
}

impl InboundElement {
    pub fn classify(element: &Element) -> Self {
        match element.name() {
            "message" | "presence" | "iq" => InboundElement::Stanza,
            "features" => InboundElement::Features,
            "error" if is_stream_error(element) => InboundElement::StreamError,
            "error" => InboundElement::StanzaError,
            _ => InboundElement::Nonza,
        }
    }
}

fn is_stream_error(element: &Element) -> bool {
    element.has_ns(STREAMS_NS)
        || element.has_ns(STREAM_ERRORS_NS)
        || element
            .children()
            .any(|child| child.has_ns(STREAM_ERRORS_NS))
}

/// Receiver of routed body content.
pub(crate) trait BodyHandler {
    /// Record identifiers carried on the body root. Already known values win.
    fn latch_session_ids(&self, sid: Option<&str>, authid: Option<&str>);

    fn is_connected(&self) -> bool;

    fn process_stanza(&self, element: Element) -> Result<(), ConnectionError>;

    fn process_features(&self, features: StreamFeatures) -> Result<(), ConnectionError>;

    fn process_nonza(&self, element: Element) -> Result<(), ConnectionError>;

    fn notify_connection_error(&self, error: ConnectionError);
}

/// Dispatch one body, reporting a failure only while still connected.
pub(crate) fn read_body<H>(handler: &H, xml: &str)
where
    H: BodyHandler + ?Sized,
{
    if let Err(error) = dispatch_body(handler, xml) {
        if handler.is_connected() {
            handler.notify_connection_error(error);
        } else {
            debug!(%error, "dropping body error for a disconnected session");
        }
    }
}

pub(crate) fn dispatch_body<H>(handler: &H, xml: &str) -> Result<(), ConnectionError>
where
    H: BodyHandler + ?Sized,
{
    let xml = xml.trim();
    if xml.is_empty() {
        return Ok(());
    }

    let body = Element::from_str(xml)
        .map_err(|error| ConnectionError::Parse(format!("malformed body: {error}")))?;
    handler.latch_session_ids(body.attr("sid"), body.attr("authid"));

    if let Some(stream_error) = body
        .children()
        .find(|child| InboundElement::classify(child) == InboundElement::StreamError)
    {
        return Err(ConnectionError::Stream(StreamErrorInfo::from_element(
            stream_error,
        )));
    }

    for child in body.children() {
        let kind = InboundElement::classify(child);
        trace!(element = child.name(), ?kind, "dispatching body child");
        match kind {
            InboundElement::Stanza => handler.process_stanza(child.clone())?,
            InboundElement::Features => {
                handler.process_features(StreamFeatures::from_element(child.clone()))?
            }
            InboundElement::StanzaError => {
                return Err(ConnectionError::Xmpp(StanzaErrorInfo::from_element(child)));
            }
            InboundElement::StreamError => {
                return Err(ConnectionError::Stream(StreamErrorInfo::from_element(child)));
            }
            InboundElement::Nonza => handler.process_nonza(child.clone())?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        connected: bool,
        sid: RefCell<Option<String>>,
        authid: RefCell<Option<String>>,
        routed: RefCell<Vec<String>>,
        errors: RefCell<Vec<ConnectionError>>,
    }

    impl RecordingHandler {
        fn connected() -> Self {
            Self {
                connected: true,
                ..Self::default()
            }
        }
    }

    impl BodyHandler for RecordingHandler {
        fn latch_session_ids(&self, sid: Option<&str>, authid: Option<&str>) {
            let mut known = self.sid.borrow_mut();
            if known.is_none() {
                *known = sid.map(str::to_string);
            }
            let mut known = self.authid.borrow_mut();
            if known.is_none() {
                *known = authid.map(str::to_string);
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn process_stanza(&self, element: Element) -> Result<(), ConnectionError> {
            self.routed
                .borrow_mut()
                .push(format!("stanza:{}", element.name()));
            Ok(())
        }

        fn process_features(&self, features: StreamFeatures) -> Result<(), ConnectionError> {
            self.routed
                .borrow_mut()
                .push(format!("features:{}", features.mechanisms.join(",")));
            Ok(())
        }

        fn process_nonza(&self, element: Element) -> Result<(), ConnectionError> {
            self.routed
                .borrow_mut()
                .push(format!("nonza:{}", element.name()));
            Ok(())
        }

        fn notify_connection_error(&self, error: ConnectionError) {
            self.errors.borrow_mut().push(error);
        }
    }

    const BODY_OPEN: &str = "<body xmlns='http://jabber.org/protocol/httpbind'";

    #[test]
    fn children_are_routed_in_document_order() {
        let handler = RecordingHandler::connected();
        let xml = format!(
            "{BODY_OPEN}><message xmlns='jabber:client'/><presence xmlns='jabber:client'/>\
             <unknown xmlns='urn:example:unknown'/></body>"
        );

        read_body(&handler, &xml);

        assert_eq!(
            *handler.routed.borrow(),
            vec!["stanza:message", "stanza:presence", "nonza:unknown"]
        );
        assert!(handler.errors.borrow().is_empty());
    }

    #[test]
    fn first_session_identifiers_are_kept() {
        let handler = RecordingHandler::connected();

        read_body(&handler, &format!("{BODY_OPEN} sid='first' authid='a1'/>"));
        read_body(&handler, &format!("{BODY_OPEN} sid='second' authid='a2'/>"));

        assert_eq!(handler.sid.borrow().as_deref(), Some("first"));
        assert_eq!(handler.authid.borrow().as_deref(), Some("a1"));
    }

    #[test]
    fn features_announce_offered_mechanisms_and_bind() {
        let handler = RecordingHandler::connected();
        let xml = format!(
            "{BODY_OPEN} xmlns:stream='http://etherx.jabber.org/streams'><stream:features>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms>\
             </stream:features></body>"
        );

        read_body(&handler, &xml);

        assert_eq!(*handler.routed.borrow(), vec!["features:SCRAM-SHA-1,PLAIN"]);
    }

    #[test]
    fn stream_features_parse_bind() {
        let element = Element::from_str(
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></features>",
        )
        .unwrap();
        let features = StreamFeatures::from_element(element);
        assert!(features.bind);
        assert!(features.mechanisms.is_empty());
        assert!(!features.offers_mechanism("PLAIN"));
    }

    #[test]
    fn stream_error_is_raised_without_dispatching_siblings() {
        let handler = RecordingHandler::connected();
        let xml = format!(
            "{BODY_OPEN} xmlns:stream='http://etherx.jabber.org/streams'>\
             <message xmlns='jabber:client'/>\
             <stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>no such host</text>\
             </stream:error></body>"
        );

        read_body(&handler, &xml);

        assert!(handler.routed.borrow().is_empty());
        let errors = handler.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert_matches!(&errors[0], ConnectionError::Stream(info) => {
            assert_eq!(info.condition, "host-unknown");
            assert_eq!(info.text.as_deref(), Some("no such host"));
        });
        assert!(errors[0].is_terminal());
    }

    #[test]
    fn stanza_error_ends_the_body_without_being_terminal() {
        let handler = RecordingHandler::connected();
        let xml = format!(
            "{BODY_OPEN}><presence xmlns='jabber:client'/>\
             <error xmlns='jabber:client' type='cancel'>\
             <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
             <message xmlns='jabber:client'/></body>"
        );

        read_body(&handler, &xml);

        assert_eq!(*handler.routed.borrow(), vec!["stanza:presence"]);
        let errors = handler.errors.borrow();
        assert_matches!(&errors[..], [ConnectionError::Xmpp(info)] => {
            assert_eq!(info.error_type.as_deref(), Some("cancel"));
            assert_eq!(info.condition, "item-not-found");
            assert_eq!(info.to_string(), "cancel/item-not-found");
        });
        assert!(!errors[0].is_terminal());
    }

    #[test]
    fn errors_are_dropped_once_disconnected() {
        let handler = RecordingHandler::default();

        read_body(&handler, "<body this is not xml");

        assert!(handler.errors.borrow().is_empty());
    }

    #[test]
    fn malformed_body_is_reported_while_connected() {
        let handler = RecordingHandler::connected();

        read_body(&handler, "<body this is not xml");

        assert_matches!(&handler.errors.borrow()[..], [ConnectionError::Parse(_)]);
    }

    #[test]
    fn empty_response_is_ignored() {
        let handler = RecordingHandler::connected();

        read_body(&handler, "  ");
        read_body(&handler, &format!("{BODY_OPEN}/>"));

        assert!(handler.routed.borrow().is_empty());
        assert!(handler.errors.borrow().is_empty());
    }
}
