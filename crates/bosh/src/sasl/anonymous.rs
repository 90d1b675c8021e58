use crate::error::SaslError;

use super::{AttemptContext, SaslMechanism};

/// `ANONYMOUS` (RFC 4505) without trace information.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn priority(&self) -> i32 {
        500
    }

    fn new_instance(&self) -> Box<dyn SaslMechanism> {
        Box::new(Anonymous)
    }

    fn authentication_text(
        &mut self,
        _context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        Ok(None)
    }

    fn check_if_successful_or_throw(&self) -> Result<(), SaslError> {
        Ok(())
    }
}
