//! Extraction engine: rendered documents in, candidate records out.
//!
//! # Strategies
//!
//! - [`Strategy::Structural`]: CSS selector schema, see [`structural`]
//! - [`Strategy::ModelAssisted`]: completion provider, see [`model`]
//!
//! The strategy is chosen per invocation from the source's schema and the
//! run's [`ExtractionMode`].

pub mod model;
pub mod structural;

use crate::error::ExtractionFailure;
use crate::fetch::Document;
use crate::models::{RawRecord, SelectorHealth, StrategyKind};
use crate::sources::{SelectorSchema, SourceConfig};

pub use model::{AwfulCompletion, CompletionProvider, DEFAULT_INSTRUCTION, RetryCompletion};

/// How a run picks strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Follow each source's schema.
    #[default]
    Auto,
    /// Force model-assisted extraction for every source.
    Model,
}

pub enum Strategy<'a, P> {
    Structural(&'a SelectorSchema),
    ModelAssisted {
        instruction: &'a str,
        provider: Option<&'a P>,
        max_chars: usize,
    },
}

impl<'a, P: CompletionProvider> Strategy<'a, P> {
    pub fn select(
        source: &'a SourceConfig,
        mode: ExtractionMode,
        provider: Option<&'a P>,
        max_chars: usize,
    ) -> Self {
        let model = |instruction: &'a str| Strategy::ModelAssisted {
            instruction,
            provider,
            max_chars,
        };
        let prompt = source.schema.prompt.as_deref();
        match (mode, &source.schema.selectors) {
            (ExtractionMode::Auto, Some(selectors)) => Strategy::Structural(selectors),
            _ => model(prompt.unwrap_or(DEFAULT_INSTRUCTION)),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Structural(_) => StrategyKind::Structural,
            Strategy::ModelAssisted { .. } => StrategyKind::ModelAssisted,
        }
    }

    pub async fn extract(&self, document: &Document) -> Result<Vec<RawRecord>, ExtractionFailure> {
        match self {
            Strategy::Structural(schema) => structural::extract_structural(document, schema),
            Strategy::ModelAssisted {
                instruction,
                provider,
                max_chars,
            } => model::extract_with_model(document, instruction, *provider, *max_chars).await,
        }
    }
}

/// Whether a document has anything a reader would see.
pub fn has_content(document: &Document) -> bool {
    !model::visible_text(&document.html).is_empty()
}

/// Selector-health verdict for one source's extraction.
///
/// Only structural extraction is judged: zero records from pages that had
/// content means the selectors no longer match the markup.
pub fn selector_health(
    kind: StrategyKind,
    found: usize,
    saw_content: bool,
    previously_found: Option<usize>,
) -> Option<SelectorHealth> {
    (kind == StrategyKind::Structural && found == 0 && saw_content)
        .then_some(SelectorHealth::ZeroResults { previously_found })
}
