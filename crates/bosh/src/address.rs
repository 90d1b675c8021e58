//! Extended stanza addressing (XEP-0033) on top of an established session.
//!
//! Stateless and best effort: when the server offers a multicast service the
//! stanza goes out once with an `<addresses/>` extension, otherwise one copy
//! per recipient.

use std::{fmt, future::Future, str::FromStr};

use tracing::{debug, warn};
use xmpp_parsers::{
    jid::{FullJid, Jid},
    message::Message,
    minidom::{Element, rxml::NcName},
};

use crate::{
    connection::BoshConnection, error::ConnectionError, stanza::Stanza,
    transport::BoshClientFactory,
};

pub const ADDRESSES_NS: &str = "http://jabber.org/protocol/address";

const FEATURE_NAME: &str = "Extended Stanza Addressing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    To,
    Cc,
    Bcc,
    ReplyTo,
    ReplyRoom,
    NoReply,
}

impl AddressType {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressType::To => "to",
            AddressType::Cc => "cc",
            AddressType::Bcc => "bcc",
            AddressType::ReplyTo => "replyto",
            AddressType::ReplyRoom => "replyroom",
            AddressType::NoReply => "noreply",
        }
    }
}

impl FromStr for AddressType {
    type Err = ConnectionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "to" => Ok(AddressType::To),
            "cc" => Ok(AddressType::Cc),
            "bcc" => Ok(AddressType::Bcc),
            "replyto" => Ok(AddressType::ReplyTo),
            "replyroom" => Ok(AddressType::ReplyRoom),
            "noreply" => Ok(AddressType::NoReply),
            other => Err(ConnectionError::InvalidArgument(format!(
                "unknown address type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub kind: AddressType,
    pub jid: Option<Jid>,
    pub node: Option<String>,
    pub description: Option<String>,
    pub delivered: bool,
    pub uri: Option<String>,
}

impl Address {
    pub fn new(kind: AddressType, jid: Option<Jid>) -> Self {
        Self {
            kind,
            jid,
            node: None,
            description: None,
            delivered: false,
            uri: None,
        }
    }

    fn from_element(element: &Element) -> Option<Self> {
        let kind = element.attr("type")?.parse().ok()?;
        let jid = element.attr("jid").and_then(|jid| jid.parse().ok());
        Some(Self {
            kind,
            jid,
            node: element.attr("node").map(str::to_string),
            description: element.attr("desc").map(str::to_string),
            delivered: element.attr("delivered") == Some("true"),
            uri: element.attr("uri").map(str::to_string),
        })
    }

    fn to_element(&self) -> Element {
        let attributes = [
            ("type", Some(self.kind.as_str().to_string())),
            ("jid", self.jid.as_ref().map(Jid::to_string)),
            ("node", self.node.clone()),
            ("desc", self.description.clone()),
            ("delivered", self.delivered.then(|| "true".to_string())),
            ("uri", self.uri.clone()),
        ];
        attributes
            .into_iter()
            .fold(
                Element::builder("address", ADDRESSES_NS),
                |builder, (name, value)| match NcName::try_from(name) {
                    Ok(name) => builder.attr(name, value),
                    Err(error) => {
                        warn!(name, %error, "skipping address attribute with an invalid name");
                        builder
                    }
                },
            )
            .build()
    }
}

/// The `<addresses/>` extension element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipleAddresses {
    pub addresses: Vec<Address>,
}

impl MultipleAddresses {
    pub fn add_address(&mut self, kind: AddressType, jid: Jid) {
        self.addresses.push(Address::new(kind, Some(jid)));
    }

    pub fn set_no_reply(&mut self) {
        self.addresses.push(Address::new(AddressType::NoReply, None));
    }

    pub fn addresses_of_type(&self, kind: AddressType) -> impl Iterator<Item = &Address> {
        self.addresses.iter().filter(move |address| address.kind == kind)
    }

    /// Unknown address types and malformed JIDs are skipped.
    pub fn from_element(element: &Element) -> Option<Self> {
        if !element.is("addresses", ADDRESSES_NS) {
            return None;
        }
        Some(Self {
            addresses: element
                .children()
                .filter(|child| child.is("address", ADDRESSES_NS))
                .filter_map(Address::from_element)
                .collect(),
        })
    }

    pub fn to_element(&self) -> Element {
        Element::builder("addresses", ADDRESSES_NS)
            .append_all(self.addresses.iter().map(Address::to_element))
            .build()
    }
}

/// Addressing information carried by a received stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipleRecipientInfo {
    extension: MultipleAddresses,
}

impl MultipleRecipientInfo {
    pub fn to_addresses(&self) -> impl Iterator<Item = &Address> {
        self.extension.addresses_of_type(AddressType::To)
    }

    pub fn cc_addresses(&self) -> impl Iterator<Item = &Address> {
        self.extension.addresses_of_type(AddressType::Cc)
    }

    pub fn reply_room(&self) -> Option<&Jid> {
        self.extension
            .addresses_of_type(AddressType::ReplyRoom)
            .find_map(|address| address.jid.as_ref())
    }

    pub fn should_not_reply(&self) -> bool {
        self.extension
            .addresses_of_type(AddressType::NoReply)
            .next()
            .is_some()
    }

    pub fn reply_address(&self) -> Option<&Address> {
        self.extension.addresses_of_type(AddressType::ReplyTo).next()
    }

    pub fn extension(&self) -> &MultipleAddresses {
        &self.extension
    }
}

/// Where a fanned-out stanza should go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub to: Vec<Jid>,
    pub cc: Vec<Jid>,
    pub bcc: Vec<Jid>,
    pub reply_to: Option<Jid>,
    pub reply_room: Option<Jid>,
    pub no_reply: bool,
}

impl Recipients {
    pub fn to(to: impl IntoIterator<Item = Jid>) -> Self {
        Self {
            to: to.into_iter().collect(),
            ..Self::default()
        }
    }

    /// The only recipient, when plain addressing is enough.
    fn single_direct(&self) -> Option<&Jid> {
        match self.to.as_slice() {
            [only] if self.cc.is_empty() && self.bcc.is_empty() && !self.requests_reply_options() => {
                Some(only)
            }
            _ => None,
        }
    }

    fn requests_reply_options(&self) -> bool {
        self.no_reply || self.reply_to.is_some() || self.reply_room.is_some()
    }

    fn extension(&self) -> MultipleAddresses {
        let mut extension = MultipleAddresses::default();
        for jid in &self.to {
            extension.add_address(AddressType::To, jid.clone());
        }
        for jid in &self.cc {
            extension.add_address(AddressType::Cc, jid.clone());
        }
        for jid in &self.bcc {
            extension.add_address(AddressType::Bcc, jid.clone());
        }
        if self.no_reply {
            extension.set_no_reply();
        } else {
            if let Some(jid) = &self.reply_to {
                extension.add_address(AddressType::ReplyTo, jid.clone());
            }
            if let Some(jid) = &self.reply_room {
                extension.add_address(AddressType::ReplyRoom, jid.clone());
            }
        }
        extension
    }
}

/// The session a fan-out is sent through.
pub trait StanzaSender {
    fn send_stanza(&self, stanza: Stanza) -> Result<(), ConnectionError>;

    fn user(&self) -> Option<FullJid>;
}

impl<F: BoshClientFactory> StanzaSender for BoshConnection<F> {
    fn send_stanza(&self, stanza: Stanza) -> Result<(), ConnectionError> {
        BoshConnection::send_stanza(self, stanza)
    }

    fn user(&self) -> Option<FullJid> {
        BoshConnection::user(self)
    }
}

/// Looks up the server component that offers a feature.
pub trait ServiceDiscovery {
    fn find_service(
        &self,
        feature: &str,
    ) -> impl Future<Output = Result<Option<Jid>, ConnectionError>> + Send;
}

/// Sends `stanza` to every recipient.
///
/// A single `to` recipient without reply options is addressed directly.
/// Otherwise the server's multicast service is used when discovery finds one;
/// without it, reply options fail with
/// [`ConnectionError::FeatureNotSupported`] and everything else is sent once
/// per recipient.
pub async fn send<S, D>(
    sender: &S,
    discovery: &D,
    mut stanza: Stanza,
    recipients: &Recipients,
) -> Result<(), ConnectionError>
where
    S: StanzaSender + ?Sized,
    D: ServiceDiscovery,
{
    if let Some(to) = recipients.single_direct() {
        stanza.set_to(to.clone());
        return sender.send_stanza(stanza);
    }

    match discovery.find_service(ADDRESSES_NS).await? {
        Some(service) => send_through_service(sender, stanza, recipients, service),
        None if recipients.requests_reply_options() => {
            Err(ConnectionError::FeatureNotSupported(FEATURE_NAME.to_string()))
        }
        None => send_to_individual_recipients(sender, stanza, recipients),
    }
}

/// Replies to a message that carried addressing information.
pub async fn reply<S, D>(
    sender: &S,
    discovery: &D,
    original: &Message,
    mut reply: Message,
) -> Result<(), ConnectionError>
where
    S: StanzaSender + ?Sized,
    D: ServiceDiscovery,
{
    let info = info_from_payloads(&original.payloads).ok_or_else(|| {
        ConnectionError::InvalidArgument(
            "original message does not contain multiple recipient info".to_string(),
        )
    })?;
    if info.should_not_reply() {
        return Err(ConnectionError::InvalidArgument(
            "original message should not be replied".to_string(),
        ));
    }
    if info.reply_room().is_some() {
        return Err(ConnectionError::InvalidArgument(
            "reply should be sent through a room".to_string(),
        ));
    }

    if original.thread.is_some() {
        reply.thread = original.thread.clone();
    }

    if let Some(jid) = info.reply_address().and_then(|address| address.jid.clone()) {
        reply.to = Some(jid);
        return sender.send_stanza(Stanza::Message(Box::new(reply)));
    }

    let mut to: Vec<Jid> = info.to_addresses().filter_map(|a| a.jid.clone()).collect();
    let mut cc: Vec<Jid> = info.cc_addresses().filter_map(|a| a.jid.clone()).collect();
    if let Some(from) = &original.from
        && !to.contains(from)
        && !cc.contains(from)
    {
        to.push(from.clone());
    }

    if let Some(user) = sender.user() {
        let full = Jid::from(user.clone());
        if !remove_first(&mut to, &full) && !remove_first(&mut cc, &full) {
            let bare = Jid::from(user.to_bare());
            remove_first(&mut to, &bare);
            remove_first(&mut cc, &bare);
        }
    }

    let recipients = Recipients {
        to,
        cc,
        ..Recipients::default()
    };
    send(sender, discovery, Stanza::Message(Box::new(reply)), &recipients).await
}

/// Addressing information of a received stanza, if it carries any.
pub fn multiple_recipient_info(stanza: &Stanza) -> Option<MultipleRecipientInfo> {
    info_from_payloads(stanza.payloads())
}

fn info_from_payloads(payloads: &[Element]) -> Option<MultipleRecipientInfo> {
    payloads
        .iter()
        .find_map(MultipleAddresses::from_element)
        .map(|extension| MultipleRecipientInfo { extension })
}

fn send_through_service<S>(
    sender: &S,
    mut stanza: Stanza,
    recipients: &Recipients,
    service: Jid,
) -> Result<(), ConnectionError>
where
    S: StanzaSender + ?Sized,
{
    let extension = recipients.extension().to_element();
    let Some(payloads) = stanza.payloads_mut() else {
        return Err(ConnectionError::InvalidArgument(
            "IQ stanzas cannot carry extended addressing".to_string(),
        ));
    };
    payloads.push(extension);
    debug!(%service, "sending through multicast service");
    stanza.set_to(service);
    sender.send_stanza(stanza)
}

fn send_to_individual_recipients<S>(
    sender: &S,
    stanza: Stanza,
    recipients: &Recipients,
) -> Result<(), ConnectionError>
where
    S: StanzaSender + ?Sized,
{
    let all = recipients
        .to
        .iter()
        .chain(&recipients.cc)
        .chain(&recipients.bcc);
    for jid in all {
        let mut copy = stanza.clone();
        copy.set_to(jid.clone());
        sender.send_stanza(copy)?;
    }
    Ok(())
}

fn remove_first(jids: &mut Vec<Jid>, jid: &Jid) -> bool {
    match jids.iter().position(|candidate| candidate == jid) {
        Some(index) => {
            jids.remove(index);
            true
        }
        None => false,
    }
}
