//! Entity Extraction
//!
//! Turns raw message text into entity observations before resolution. The
//! engine treats extraction as pluggable: a pipeline of extractors runs over
//! the text and their observations are merged into the event. A failing
//! extractor is logged and skipped, it never blocks the message.

use anyhow::{Context as _, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::entity::EntityObservation;
use crate::event::{Event, EventKind};

/// Observations keyed by entity name.
pub type Observations = HashMap<String, Vec<EntityObservation>>;

/// Extracts entities from raw message text.
pub trait EntityExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, text: &str) -> Result<Observations>;
}

// ============ Pipeline ============

/// An ordered chain of extractors sharing one merged output.
#[derive(Clone, Default)]
pub struct ExtractorPipeline {
    extractors: Vec<Arc<dyn EntityExtractor>>,
}

impl ExtractorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Run every extractor over the text and merge the observations.
    pub fn run(&self, text: &str) -> Observations {
        let mut merged: Observations = HashMap::new();
        for extractor in &self.extractors {
            match extractor.extract(text) {
                Ok(observations) => {
                    for (name, mut values) in observations {
                        merged.entry(name).or_default().append(&mut values);
                    }
                }
                Err(e) => {
                    warn!("extractor {} failed: {:#}", extractor.name(), e);
                }
            }
        }
        merged
    }

    /// Enrich a message event in place. Non-message events and events
    /// without text are left untouched.
    pub fn enrich(&self, event: &mut Event) {
        if event.kind != EventKind::Message {
            return;
        }
        let Some(text) = event.text.clone() else {
            return;
        };
        let observations = self.run(&text);
        if !observations.is_empty() {
            debug!(
                "extracted entities: {:?}",
                observations.keys().collect::<Vec<_>>()
            );
        }
        for (name, values) in observations {
            event.entities.entry(name).or_default().extend(values);
        }
    }
}

// ============ Built-in extractors ============

/// Maps keyword alternatives to entity values. Keywords match on word
/// boundaries, case-insensitive.
pub struct KeywordExtractor {
    entity: String,
    patterns: Vec<(String, Regex)>,
}

impl KeywordExtractor {
    /// `values` maps an entity value to the keywords that produce it.
    pub fn new(entity: &str, values: &[(&str, &[&str])]) -> Result<Self> {
        let mut patterns = Vec::new();
        for (value, keywords) in values {
            let alternatives = keywords
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{})\b", alternatives);
            let regex = Regex::new(&pattern)
                .with_context(|| format!("bad keyword pattern for value {:?}", value))?;
            patterns.push((value.to_string(), regex));
        }
        Ok(Self {
            entity: entity.to_string(),
            patterns,
        })
    }
}

impl EntityExtractor for KeywordExtractor {
    fn name(&self) -> &str {
        "keyword"
    }

    fn extract(&self, text: &str) -> Result<Observations> {
        let mut observations = Observations::new();
        for (value, regex) in &self.patterns {
            if regex.is_match(text) {
                observations
                    .entry(self.entity.clone())
                    .or_default()
                    .push(EntityObservation::text(value));
            }
        }
        Ok(observations)
    }
}

/// Captures entity values with a regex. The first capture group becomes the
/// value; without groups the whole match does.
pub struct RegexExtractor {
    entity: String,
    regex: Regex,
}

impl RegexExtractor {
    pub fn new(entity: &str, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .with_context(|| format!("bad extraction pattern for entity {:?}", entity))?;
        Ok(Self {
            entity: entity.to_string(),
            regex,
        })
    }
}

impl EntityExtractor for RegexExtractor {
    fn name(&self) -> &str {
        "regex"
    }

    fn extract(&self, text: &str) -> Result<Observations> {
        let mut observations = Observations::new();
        for captures in self.regex.captures_iter(text) {
            let value = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str())
                .unwrap_or_default();
            observations
                .entry(self.entity.clone())
                .or_default()
                .push(EntityObservation::text(value));
        }
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_extractor_matches_alternatives() {
        let extractor = KeywordExtractor::new(
            "greeting",
            &[("hello", &["hi", "hello", "hey"]), ("bye", &["goodbye"])],
        )
        .unwrap();
        let observations = extractor.extract("Hey, how are you?").unwrap();
        let values = &observations["greeting"];
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value.as_ref().unwrap(), "hello");
    }

    #[test]
    fn test_keyword_extractor_respects_word_boundaries() {
        let extractor = KeywordExtractor::new("greeting", &[("hello", &["hi"])]).unwrap();
        assert!(extractor.extract("this is a hint").unwrap().is_empty());
    }

    #[test]
    fn test_regex_extractor_uses_first_capture_group() {
        let extractor = RegexExtractor::new("quantity", r"(\d+) pieces").unwrap();
        let observations = extractor.extract("give me 12 pieces please").unwrap();
        assert_eq!(observations["quantity"][0].value.as_ref().unwrap(), "12");
    }

    #[test]
    fn test_pipeline_merges_and_enriches_event() {
        struct Fixed;
        impl EntityExtractor for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            fn extract(&self, _text: &str) -> Result<Observations> {
                let mut observations = Observations::new();
                observations
                    .entry("product".to_string())
                    .or_default()
                    .push(EntityObservation::text("apples"));
                Ok(observations)
            }
        }
        struct Broken;
        impl EntityExtractor for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn extract(&self, _text: &str) -> Result<Observations> {
                anyhow::bail!("model offline")
            }
        }

        let pipeline = ExtractorPipeline::new()
            .with(Arc::new(Fixed))
            .with(Arc::new(Broken));
        let mut event = Event::message("apples please");
        pipeline.enrich(&mut event);
        assert!(event.entities.contains_key("product"));
        assert!(event.entities.contains_key("_message_text"));
    }
}
