//! SASL challenge/response handshake.
//!
//! Mechanisms registered in a [`SaslMechanismRegistry`] are templates. Every
//! login attempt gets a fresh instance through [`SaslMechanism::new_instance`],
//! wrapped in a [`SaslAttempt`] that drives it through the initial response,
//! zero or more challenges and the final success check.

mod anonymous;
mod plain;
mod scram;

use std::{collections::HashSet, fmt, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use xmpp_parsers::jid::BareJid;

use crate::{
    error::{ConnectionError, SaslError},
    reader::SASL_NS,
};

pub use anonymous::Anonymous;
pub use plain::Plain;
pub use scram::{Scram, ScramVariant};

/// Wire form of a zero-length response that is present (RFC 6120 6.4.2).
const EMPTY_RESPONSE_MARKER: &str = "=";

const AWAITED_EVENT: &str = "successful SASL authentication";

/// Normalizes a credential string with Unicode NFKC before it is encoded.
pub fn saslprep(value: &str) -> String {
    value.nfkc().collect()
}

/// Channel binding data of an established secure channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureChannel {
    TlsUnique(Vec<u8>),
    TlsExporter(Vec<u8>),
}

/// Per-attempt inputs seeded by [`SaslAttempt::authenticate`].
#[derive(Clone, Default)]
pub struct AttemptContext {
    pub authentication_id: String,
    pub authorization_id: Option<BareJid>,
    pub password: String,
    pub service_name: String,
    pub host: String,
    pub channel: Option<SecureChannel>,
}

impl fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptContext")
            .field("authentication_id", &self.authentication_id)
            .field("authorization_id", &self.authorization_id)
            .field("password", &"<redacted>")
            .field("service_name", &self.service_name)
            .field("host", &self.host)
            .field("channel", &self.channel.as_ref().map(|_| "<bound>"))
            .finish()
    }
}

/// A SASL mechanism implementation.
///
/// Implementations keep per-attempt state in `self`; the registry only ever
/// hands out values produced by [`SaslMechanism::new_instance`].
pub trait SaslMechanism: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Lower values are preferred when several mechanisms are offered.
    fn priority(&self) -> i32;

    fn authzid_supported(&self) -> bool {
        false
    }

    fn new_instance(&self) -> Box<dyn SaslMechanism>;

    fn authenticate_internal(&mut self, _context: &AttemptContext) -> Result<(), SaslError> {
        Ok(())
    }

    /// Initial response bytes. `None` and an empty vector both go out as `=`.
    fn authentication_text(
        &mut self,
        context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError>;

    fn evaluate_challenge(
        &mut self,
        _challenge: &[u8],
        _context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        Ok(None)
    }

    /// Mechanism specific conditions for accepting the server's success.
    fn check_if_successful_or_throw(&self) -> Result<(), SaslError>;
}

/// Outbound channel for `<auth/>` and `<response/>` nonzas.
pub trait NonzaSink {
    fn send_nonza_xml(&self, xml: String) -> Result<(), ConnectionError>;
}

/// Why an attempt ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslAttemptError {
    /// Our side failed to compute or verify something.
    Local(SaslError),
    /// The server answered with `<failure/>`.
    Failure(SaslError),
    NotConnected,
    Interrupted,
}

impl SaslAttemptError {
    fn from_send(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Interrupted { .. } => SaslAttemptError::Interrupted,
            _ => SaslAttemptError::NotConnected,
        }
    }
}

impl From<SaslAttemptError> for ConnectionError {
    fn from(error: SaslAttemptError) -> Self {
        match error {
            SaslAttemptError::Local(error) | SaslAttemptError::Failure(error) => {
                ConnectionError::Sasl(error)
            }
            SaslAttemptError::NotConnected => ConnectionError::NotConnected,
            SaslAttemptError::Interrupted => ConnectionError::Interrupted {
                waiting_for: AWAITED_EVENT.to_string(),
            },
        }
    }
}

/// One authentication attempt driving a fresh mechanism instance.
#[derive(Debug)]
pub struct SaslAttempt {
    mechanism: Box<dyn SaslMechanism>,
    context: AttemptContext,
    authentication_successful: bool,
    terminal: Option<SaslAttemptError>,
}

impl SaslAttempt {
    pub fn new(mechanism: Box<dyn SaslMechanism>) -> Self {
        Self {
            mechanism,
            context: AttemptContext::default(),
            authentication_successful: false,
            terminal: None,
        }
    }

    pub fn mechanism_name(&self) -> &'static str {
        self.mechanism.name()
    }

    /// Seed the attempt and send `<auth/>` with the initial response.
    ///
    /// # Panics
    ///
    /// In debug builds, if an authorization identity is supplied to a
    /// mechanism that does not support one.
    pub fn authenticate(
        &mut self,
        sink: &dyn NonzaSink,
        context: AttemptContext,
    ) -> Result<(), SaslAttemptError> {
        debug_assert!(
            context.authorization_id.is_none() || self.mechanism.authzid_supported(),
            "SASL mechanism {} does not support an authorization identity",
            self.mechanism.name()
        );
        self.context = context;

        self.mechanism
            .authenticate_internal(&self.context)
            .map_err(SaslAttemptError::Local)?;
        let initial = self
            .mechanism
            .authentication_text(&self.context)
            .map_err(SaslAttemptError::Local)?;

        let text = match initial {
            Some(bytes) if !bytes.is_empty() => STANDARD.encode(bytes),
            _ => EMPTY_RESPONSE_MARKER.to_string(),
        };

        debug!(mechanism = self.mechanism.name(), "sending SASL auth");
        sink.send_nonza_xml(auth_xml(self.mechanism.name(), &text))
            .map_err(SaslAttemptError::from_send)
    }

    /// Handle `<challenge/>` data, or the data of `<success/>` when `is_final`.
    pub fn challenge_received(
        &mut self,
        sink: &dyn NonzaSink,
        challenge: &str,
        is_final: bool,
    ) -> Result<(), SaslAttemptError> {
        let challenge = challenge.trim();
        let decoded = if challenge == EMPTY_RESPONSE_MARKER {
            Vec::new()
        } else {
            STANDARD.decode(challenge).map_err(|error| {
                SaslAttemptError::Local(SaslError::Local {
                    mechanism: self.mechanism.name().to_string(),
                    message: format!("challenge is not valid base64: {error}"),
                })
            })?
        };

        let response = self
            .mechanism
            .evaluate_challenge(&decoded, &self.context)
            .map_err(SaslAttemptError::Local)?;
        if is_final {
            return Ok(());
        }

        let xml = match response {
            Some(bytes) if !bytes.is_empty() => format!(
                "<response xmlns='{SASL_NS}'>{}</response>",
                STANDARD.encode(bytes)
            ),
            _ => format!("<response xmlns='{SASL_NS}'/>"),
        };
        sink.send_nonza_xml(xml).map_err(SaslAttemptError::from_send)
    }

    pub fn after_final_sasl_challenge(&mut self) -> Result<(), SaslAttemptError> {
        self.mechanism
            .check_if_successful_or_throw()
            .map_err(SaslAttemptError::Local)?;
        self.authentication_successful = true;
        Ok(())
    }

    pub fn is_authentication_successful(&self) -> bool {
        self.authentication_successful
    }

    pub fn is_finished(&self) -> bool {
        self.authentication_successful || self.terminal.is_some()
    }

    /// Record the terminal error. The first one recorded wins.
    pub fn set_exception(&mut self, error: SaslAttemptError) {
        if self.terminal.is_none() {
            self.terminal = Some(error);
        } else {
            warn!(
                mechanism = self.mechanism.name(),
                ?error,
                "ignoring SASL error after attempt already failed"
            );
        }
    }

    pub fn terminal_error(&self) -> Option<&SaslAttemptError> {
        self.terminal.as_ref()
    }

    pub fn throw_exception_if_required(&self, timeout: Duration) -> Result<(), ConnectionError> {
        if let Some(error) = &self.terminal {
            return Err(error.clone().into());
        }
        if !self.authentication_successful {
            return Err(ConnectionError::no_response(AWAITED_EVENT, timeout));
        }
        Ok(())
    }
}

fn auth_xml(mechanism: &str, text: &str) -> String {
    format!("<auth xmlns='{SASL_NS}' mechanism='{mechanism}'>{text}</auth>")
}

/// Mechanism templates known to a connection.
#[derive(Debug)]
pub struct SaslMechanismRegistry {
    templates: Vec<Box<dyn SaslMechanism>>,
    blacklist: HashSet<String>,
}

impl SaslMechanismRegistry {
    pub fn empty() -> Self {
        Self {
            templates: Vec::new(),
            blacklist: HashSet::new(),
        }
    }

    pub fn register(&mut self, template: Box<dyn SaslMechanism>) {
        self.templates
            .retain(|known| known.name() != template.name());
        self.templates.push(template);
        self.templates.sort_by_key(|template| template.priority());
    }

    pub fn blacklist(&mut self, name: impl Into<String>) {
        self.blacklist.insert(name.into());
    }

    pub fn unblacklist(&mut self, name: &str) -> bool {
        self.blacklist.remove(name)
    }

    /// Registered, non-blacklisted mechanism names in preference order.
    pub fn mechanisms(&self) -> Vec<&'static str> {
        self.templates
            .iter()
            .map(|template| template.name())
            .filter(|name| !self.blacklist.contains(*name))
            .collect()
    }

    /// A fresh attempt for the most preferred mechanism the server offers.
    ///
    /// With `authzid` set, mechanisms that cannot carry an authorization
    /// identity are skipped.
    pub fn select(&self, offered: &[String], authzid: bool) -> Result<SaslAttempt, SaslError> {
        let selected = self
            .templates
            .iter()
            .filter(|template| !self.blacklist.contains(template.name()))
            .filter(|template| !authzid || template.authzid_supported())
            .find(|template| offered.iter().any(|name| name == template.name()))
            .ok_or_else(|| SaslError::NoSharedMechanism {
                offered: offered.to_vec(),
            })?;

        debug!(mechanism = selected.name(), ?offered, "selected SASL mechanism");
        Ok(SaslAttempt::new(selected.new_instance()))
    }
}

impl Default for SaslMechanismRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(Scram::new(ScramVariant::Sha256)));
        registry.register(Box::new(Scram::new(ScramVariant::Sha1)));
        registry.register(Box::new(Plain::default()));
        registry.register(Box::new(Anonymous));
        registry
    }
}
