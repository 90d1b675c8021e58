use crate::error::SaslError;

use super::{AttemptContext, SaslMechanism, saslprep};

/// `PLAIN` (RFC 4616): `[authzid] NUL authcid NUL passwd`.
#[derive(Debug, Clone, Default)]
pub struct Plain;

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn priority(&self) -> i32 {
        410
    }

    fn authzid_supported(&self) -> bool {
        true
    }

    fn new_instance(&self) -> Box<dyn SaslMechanism> {
        Box::new(Plain)
    }

    fn authentication_text(
        &mut self,
        context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        let authzid = context
            .authorization_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let authcid = saslprep(&context.authentication_id);
        let password = saslprep(&context.password);

        let mut text = Vec::with_capacity(authzid.len() + authcid.len() + password.len() + 2);
        text.extend_from_slice(authzid.as_bytes());
        text.push(0);
        text.extend_from_slice(authcid.as_bytes());
        text.push(0);
        text.extend_from_slice(password.as_bytes());
        Ok(Some(text))
    }

    fn check_if_successful_or_throw(&self) -> Result<(), SaslError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(authzid: Option<&str>) -> AttemptContext {
        AttemptContext {
            authentication_id: "alice".to_string(),
            authorization_id: authzid.map(|jid| jid.parse().unwrap()),
            password: "secret".to_string(),
            service_name: "example.com".to_string(),
            ..AttemptContext::default()
        }
    }

    #[test]
    fn initial_response_without_authzid() {
        let text = Plain.authentication_text(&context(None)).unwrap();
        assert_eq!(text.as_deref(), Some(&b"\0alice\0secret"[..]));
    }

    #[test]
    fn initial_response_with_authzid() {
        let text = Plain
            .authentication_text(&context(Some("admin@example.com")))
            .unwrap();
        assert_eq!(text.as_deref(), Some(&b"admin@example.com\0alice\0secret"[..]));
    }

    #[test]
    fn credentials_are_normalized() {
        let context = AttemptContext {
            authentication_id: "\u{FB01}".to_string(),
            password: "\u{2168}".to_string(),
            ..AttemptContext::default()
        };
        let text = Plain.authentication_text(&context).unwrap();
        assert_eq!(text.as_deref(), Some(&b"\0fi\0IX"[..]));
    }
}
