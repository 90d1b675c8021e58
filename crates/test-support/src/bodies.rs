//! Connection manager responses used by scripted sessions.

use waddle_bosh::body::BOSH_NS;

pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Wraps payload XML in a response `<body/>`.
pub fn wrap(payload: &str) -> String {
    format!("<body xmlns='{BOSH_NS}'>{payload}</body>")
}

/// Session creation response carrying `sid` and `authid`.
pub fn session_created(sid: &str, authid: &str) -> String {
    format!(
        "<body xmlns='{BOSH_NS}' xmlns:xmpp='urn:xmpp:xbosh' sid='{sid}' authid='{authid}' \
         wait='60' requests='2' xmpp:version='1.0'/>"
    )
}

pub fn features_with_mechanisms(mechanisms: &[&str]) -> String {
    let mechanisms: String = mechanisms
        .iter()
        .map(|name| format!("<mechanism>{name}</mechanism>"))
        .collect();
    wrap(&format!(
        "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
         <mechanisms xmlns='{SASL_NS}'>{mechanisms}</mechanisms>\
         </stream:features>"
    ))
}

pub fn features_with_bind() -> String {
    wrap(&format!(
        "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
         <bind xmlns='{BIND_NS}'/>\
         </stream:features>"
    ))
}

pub fn sasl_success() -> String {
    wrap(&format!("<success xmlns='{SASL_NS}'/>"))
}

/// `<success/>` carrying base64 additional data.
pub fn sasl_success_with(data: &str) -> String {
    wrap(&format!("<success xmlns='{SASL_NS}'>{data}</success>"))
}

pub fn sasl_challenge(data: &str) -> String {
    wrap(&format!("<challenge xmlns='{SASL_NS}'>{data}</challenge>"))
}

pub fn sasl_failure(condition: &str, text: Option<&str>) -> String {
    let text = text
        .map(|text| format!("<text xml:lang='en'>{text}</text>"))
        .unwrap_or_default();
    wrap(&format!(
        "<failure xmlns='{SASL_NS}'><{condition}/>{text}</failure>"
    ))
}

pub fn bind_result(id: &str, jid: &str) -> String {
    wrap(&format!(
        "<iq xmlns='jabber:client' type='result' id='{id}'>\
         <bind xmlns='{BIND_NS}'><jid>{jid}</jid></bind></iq>"
    ))
}

pub fn stream_error(condition: &str) -> String {
    wrap(&format!(
        "<stream:error xmlns:stream='http://etherx.jabber.org/streams'>\
         <{condition} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>"
    ))
}

/// Value of the first `id='…'` attribute in `xml`.
pub fn stanza_id(xml: &str) -> Option<String> {
    [" id='", " id=\""].iter().find_map(|marker| {
        let start = xml.find(marker)? + marker.len();
        let quote = marker.chars().last()?;
        let end = xml[start..].find(quote)?;
        Some(xml[start..start + end].to_string())
    })
}
