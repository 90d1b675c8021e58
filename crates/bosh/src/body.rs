//! Outgoing `<body/>` wrappers for XEP-0124 requests.
//!
//! Bodies are immutable once built; [`ComposableBody::rebuild`] returns a
//! builder seeded with the current contents so attributes such as the
//! session identifier can be stamped on without touching the original.

use std::fmt::Write as _;

/// The BOSH namespace from XEP-0124.
pub const BOSH_NS: &str = "http://jabber.org/protocol/httpbind";

/// The XMPP over BOSH namespace from XEP-0206.
pub const XMPP_BOSH_NS: &str = "urn:xmpp:xbosh";

/// Prefix bound to [`XMPP_BOSH_NS`] on bodies that carry XEP-0206 attributes.
pub const XMPP_BOSH_PREFIX: &str = "xmpp";

/// Qualified name of a `<body/>` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BodyQName {
    namespace: &'static str,
    local: &'static str,
    prefix: Option<&'static str>,
}

impl BodyQName {
    /// An attribute in the BOSH namespace, rendered without prefix.
    pub const fn bosh(local: &'static str) -> Self {
        Self {
            namespace: BOSH_NS,
            local,
            prefix: None,
        }
    }

    /// An attribute in the XEP-0206 namespace, rendered as `xmpp:<local>`.
    pub const fn xmpp(local: &'static str) -> Self {
        Self {
            namespace: XMPP_BOSH_NS,
            local,
            prefix: Some(XMPP_BOSH_PREFIX),
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn local(&self) -> &'static str {
        self.local
    }

    fn qualified(&self) -> String {
        match self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local),
            None => self.local.to_string(),
        }
    }
}

pub const SID: BodyQName = BodyQName::bosh("sid");
pub const AUTHID: BodyQName = BodyQName::bosh("authid");
pub const TO: BodyQName = BodyQName::bosh("to");
pub const VERSION: BodyQName = BodyQName::xmpp("version");
pub const RESTART: BodyQName = BodyQName::xmpp("restart");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposableBody {
    namespaces: Vec<(String, String)>,
    attributes: Vec<(BodyQName, String)>,
    payload: String,
}

impl ComposableBody {
    pub fn builder() -> ComposableBodyBuilder {
        ComposableBodyBuilder::default()
    }

    /// A body wrapping a single serialized stanza or nonza.
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self::builder().payload_xml(payload).build()
    }

    pub fn rebuild(&self) -> ComposableBodyBuilder {
        ComposableBodyBuilder {
            body: self.clone(),
        }
    }

    pub fn attribute(&self, name: &BodyQName) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn namespace_definition(&self, prefix: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .find(|(known, _)| known == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    pub fn payload_xml(&self) -> &str {
        &self.payload
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!("<body xmlns='{BOSH_NS}'");
        for (prefix, uri) in &self.namespaces {
            let _ = write!(xml, " xmlns:{prefix}='{}'", escape_attribute(uri));
        }
        for (name, value) in &self.attributes {
            let _ = write!(xml, " {}='{}'", name.qualified(), escape_attribute(value));
        }

        if self.payload.is_empty() {
            xml.push_str("/>");
        } else {
            xml.push('>');
            xml.push_str(&self.payload);
            xml.push_str("</body>");
        }
        xml
    }
}

#[derive(Debug, Default)]
pub struct ComposableBodyBuilder {
    body: ComposableBody,
}

impl ComposableBodyBuilder {
    pub fn namespace_definition(mut self, prefix: &str, uri: &str) -> Self {
        match self
            .body
            .namespaces
            .iter_mut()
            .find(|(known, _)| known == prefix)
        {
            Some(entry) => entry.1 = uri.to_string(),
            None => self
                .body
                .namespaces
                .push((prefix.to_string(), uri.to_string())),
        }
        self
    }

    /// Set an attribute, replacing an earlier value with the same name.
    pub fn attribute(mut self, name: BodyQName, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.body.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.body.attributes.push((name, value)),
        }
        self
    }

    pub fn payload_xml(mut self, payload: impl Into<String>) -> Self {
        self.body.payload = payload.into();
        self
    }

    pub fn build(self) -> ComposableBody {
        self.body
    }
}

pub(crate) fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_creation_body_declares_xbosh_namespace_and_version() {
        let body = ComposableBody::builder()
            .namespace_definition(XMPP_BOSH_PREFIX, XMPP_BOSH_NS)
            .attribute(VERSION, "1.0")
            .build();

        assert_eq!(
            body.to_xml(),
            "<body xmlns='http://jabber.org/protocol/httpbind' \
             xmlns:xmpp='urn:xmpp:xbosh' xmpp:version='1.0'/>"
        );
    }

    #[test]
    fn rebuild_replaces_existing_attribute() {
        let body = ComposableBody::builder().attribute(SID, "old").build();
        let stamped = body.rebuild().attribute(SID, "new").build();

        assert_eq!(body.attribute(&SID), Some("old"));
        assert_eq!(stamped.attribute(&SID), Some("new"));
        assert_eq!(stamped.to_xml().matches("sid=").count(), 1);
    }

    #[test]
    fn payload_is_embedded_verbatim() {
        let body = ComposableBody::with_payload("<presence xmlns='jabber:client'/>");
        assert_eq!(
            body.to_xml(),
            "<body xmlns='http://jabber.org/protocol/httpbind'>\
             <presence xmlns='jabber:client'/></body>"
        );
    }

    #[test]
    fn attribute_values_are_escaped() {
        let body = ComposableBody::builder()
            .attribute(TO, "a'b&c")
            .build();
        assert!(body.to_xml().contains("to='a&apos;b&amp;c'"));
    }
}
