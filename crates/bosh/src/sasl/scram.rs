use sasl::client::Mechanism;
use sasl::client::mechanisms::Scram as ScramClient;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use crate::error::SaslError;

use super::{AttemptContext, SaslMechanism, saslprep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramVariant {
    Sha1,
    Sha256,
}

impl ScramVariant {
    pub fn name(self) -> &'static str {
        match self {
            ScramVariant::Sha1 => "SCRAM-SHA-1",
            ScramVariant::Sha256 => "SCRAM-SHA-256",
        }
    }

    fn priority(self) -> i32 {
        match self {
            ScramVariant::Sha256 => 100,
            ScramVariant::Sha1 => 110,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramState {
    Initial,
    AuthTextSent,
    ResponseSent,
    ValidServerResponse,
}

/// `SCRAM-SHA-1` / `SCRAM-SHA-256` on top of the `sasl` crate's client.
///
/// The server signature carried by `<success/>` is verified as the final
/// challenge; success is only accepted after that.
pub struct Scram {
    variant: ScramVariant,
    state: ScramState,
    client: Option<Box<dyn Mechanism + Send>>,
}

impl Scram {
    pub fn new(variant: ScramVariant) -> Self {
        Self {
            variant,
            state: ScramState::Initial,
            client: None,
        }
    }
}

fn local_error(variant: ScramVariant, message: impl Into<String>) -> SaslError {
    SaslError::Local {
        mechanism: variant.name().to_string(),
        message: message.into(),
    }
}

impl std::fmt::Debug for Scram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scram")
            .field("variant", &self.variant)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SaslMechanism for Scram {
    fn name(&self) -> &'static str {
        self.variant.name()
    }

    fn priority(&self) -> i32 {
        self.variant.priority()
    }

    fn new_instance(&self) -> Box<dyn SaslMechanism> {
        Box::new(Scram::new(self.variant))
    }

    fn authenticate_internal(&mut self, context: &AttemptContext) -> Result<(), SaslError> {
        let credentials = Credentials::default()
            .with_username(saslprep(&context.authentication_id))
            .with_password(saslprep(&context.password))
            .with_channel_binding(ChannelBinding::Unsupported);

        let client = match self.variant {
            ScramVariant::Sha256 => ScramClient::<Sha256>::from_credentials(credentials)
                .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
            ScramVariant::Sha1 => ScramClient::<Sha1>::from_credentials(credentials)
                .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
        }
        .map_err(|e| local_error(self.variant, format!("failed to initialize: {e:?}")))?;

        self.client = Some(client);
        Ok(())
    }

    fn authentication_text(
        &mut self,
        _context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        let variant = self.variant;
        let Some(client) = self.client.as_mut() else {
            return Err(local_error(variant, "authentication text requested before setup"));
        };
        let initial = client.initial();
        self.state = ScramState::AuthTextSent;
        Ok(Some(initial))
    }

    fn evaluate_challenge(
        &mut self,
        challenge: &[u8],
        _context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        let (variant, state) = (self.variant, self.state);
        let Some(client) = self.client.as_mut() else {
            return Err(local_error(variant, "challenge received before setup"));
        };

        match state {
            ScramState::AuthTextSent => {
                let response = client.response(challenge).map_err(|e| {
                    local_error(variant, format!("invalid server-first-message: {e:?}"))
                })?;
                self.state = ScramState::ResponseSent;
                Ok(Some(response))
            }
            ScramState::ResponseSent => {
                client.success(challenge).map_err(|e| {
                    local_error(variant, format!("server signature verification failed: {e:?}"))
                })?;
                self.state = ScramState::ValidServerResponse;
                Ok(None)
            }
            ScramState::Initial | ScramState::ValidServerResponse => {
                Err(local_error(variant, format!("unexpected challenge in state {state:?}")))
            }
        }
    }

    fn check_if_successful_or_throw(&self) -> Result<(), SaslError> {
        if self.state == ScramState::ValidServerResponse {
            Ok(())
        } else {
            Err(local_error(self.variant, "server final message was not verified"))
        }
    }
}
