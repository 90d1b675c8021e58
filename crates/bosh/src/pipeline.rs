use tracing::trace;

use crate::{error::PipelineError, stanza::Stanza};

pub enum ProcessorResult {
    Continue,
    Drop,
    Replace(Box<Stanza>),
}

pub struct ProcessorContext {
    pub direction: StanzaDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaDirection {
    Inbound,
    Outbound,
}

pub trait StanzaProcessor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn process_inbound(&self, stanza: &mut Stanza, ctx: &ProcessorContext) -> ProcessorResult;

    fn process_outbound(&self, stanza: &mut Stanza, ctx: &ProcessorContext) -> ProcessorResult;

    fn priority(&self) -> i32;
}

/// Processors run in ascending priority order. Transport callbacks call into
/// the pipeline directly, so processors must not block.
pub struct StanzaPipeline {
    processors: Vec<Box<dyn StanzaProcessor>>,
}

impl StanzaPipeline {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub fn register(&mut self, processor: Box<dyn StanzaProcessor>) {
        self.processors.push(processor);
        self.processors.sort_by_key(|p| p.priority());
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Returns `None` when a processor dropped the stanza.
    pub fn process_inbound(&self, stanza: Stanza) -> Option<Stanza> {
        self.run(stanza, StanzaDirection::Inbound)
    }

    /// Runs the outbound processors and serializes what is left.
    pub fn process_outbound(&self, stanza: Stanza) -> Result<Option<Vec<u8>>, PipelineError> {
        self.run(stanza, StanzaDirection::Outbound)
            .map(|stanza| stanza.to_bytes())
            .transpose()
    }

    fn run(&self, mut stanza: Stanza, direction: StanzaDirection) -> Option<Stanza> {
        let ctx = ProcessorContext { direction };
        for processor in &self.processors {
            let result = match direction {
                StanzaDirection::Inbound => processor.process_inbound(&mut stanza, &ctx),
                StanzaDirection::Outbound => processor.process_outbound(&mut stanza, &ctx),
            };
            match result {
                ProcessorResult::Continue => {}
                ProcessorResult::Drop => {
                    trace!(
                        processor = processor.name(),
                        ?direction,
                        stanza_type = stanza.name(),
                        "stanza dropped"
                    );
                    return None;
                }
                ProcessorResult::Replace(replacement) => stanza = *replacement,
            }
        }
        Some(stanza)
    }
}

impl Default for StanzaPipeline {
    fn default() -> Self {
        Self::new()
    }
}
