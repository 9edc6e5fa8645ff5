//! Request Classifier
//!
//! Maps a free-form request onto registered workflows:
//! - Single workflow: the best keyword match above the confidence floor
//! - Decomposition: sequencing connectors ("then", "followed by", ...) that
//!   resolve to two or more workflows, or an orchestration keyword with
//!   several matching workflows

use crate::error::OrchestrationError;
use crate::models::{Candidate, ClassificationResult, DecompositionPlan, PatternType};
use crate::registry::RegistryView;
use crate::Result;
use chrono::Utc;
use std::cmp::Ordering;

/// Phrases that split a request into ordered parts
const SEQUENCE_CONNECTORS: &[&str] = &[" then ", " after that ", " followed by ", ";"];

/// Words asking for several workflows at once
const ORCHESTRATION_KEYWORDS: &[&str] = &["coordinate", "orchestrate", "comprehensive", "end-to-end"];

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Pure mapping from a request and registry snapshot to a classification.
pub trait Classifier: Send + Sync {
    fn classify(&self, request: &str, registry: &RegistryView) -> Result<ClassificationResult>;
}

/// Keyword classifier
pub struct KeywordClassifier {
    min_confidence: f32,
}

impl KeywordClassifier {
    pub fn new(min_confidence: f32) -> Self {
        Self {
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    /// Ranked candidates for one piece of text.
    fn rank(&self, text: &str, registry: &RegistryView) -> Vec<Candidate> {
        let haystack = normalize(text);

        let mut candidates: Vec<Candidate> = registry
            .workflows()
            .iter()
            .filter_map(|workflow| {
                let matched: Vec<String> = workflow
                    .keywords
                    .iter()
                    .filter(|kw| contains_phrase(&haystack, kw))
                    .cloned()
                    .collect();

                // Multi-word phrases are stronger evidence than single words
                let score: f32 = matched
                    .iter()
                    .map(|kw| kw.split_whitespace().count() as f32)
                    .sum();
                let confidence = 1.0 - 1.0 / (1.0 + score);

                (confidence >= self.min_confidence && !matched.is_empty()).then(|| Candidate {
                    workflow_id: workflow.workflow_id.clone(),
                    confidence,
                    matched_keywords: matched,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        candidates
    }

    fn decompose(
        &self,
        request: &str,
        candidates: &[Candidate],
        registry: &RegistryView,
    ) -> Option<DecompositionPlan> {
        let is_master = |id: &str| {
            registry
                .get(id)
                .is_some_and(|w| w.pattern == PatternType::MasterOrchestration)
        };

        // A registered orchestration already encodes its own plan
        if candidates.first().is_some_and(|c| is_master(&c.workflow_id)) {
            return None;
        }

        let lowered = format!(" {} ", request.to_lowercase());
        let mut segments = vec![lowered.as_str()];
        for connector in SEQUENCE_CONNECTORS {
            segments = segments
                .into_iter()
                .flat_map(|segment| segment.split(*connector))
                .collect();
        }

        if segments.len() > 1 {
            let mut stages: Vec<Vec<String>> = Vec::new();
            for segment in segments {
                let best = self
                    .rank(segment, registry)
                    .into_iter()
                    .find(|c| !is_master(&c.workflow_id));
                if let Some(best) = best {
                    if !stages.iter().flatten().any(|id| *id == best.workflow_id) {
                        stages.push(vec![best.workflow_id]);
                    }
                }
            }
            if stages.len() >= 2 {
                return Some(DecompositionPlan::new(stages));
            }
        }

        let haystack = normalize(request);
        if ORCHESTRATION_KEYWORDS.iter().any(|kw| contains_phrase(&haystack, kw)) {
            let members: Vec<String> = candidates
                .iter()
                .filter(|c| !is_master(&c.workflow_id))
                .map(|c| c.workflow_id.clone())
                .collect();
            if members.len() >= 2 {
                return Some(DecompositionPlan::new(vec![members]));
            }
        }

        None
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONFIDENCE)
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, request: &str, registry: &RegistryView) -> Result<ClassificationResult> {
        let candidates = self.rank(request, registry);

        if candidates.is_empty() {
            return Err(OrchestrationError::NoConfidentMatch {
                request: request.to_string(),
                candidates: Vec::new(),
            });
        }

        let decomposition = self.decompose(request, &candidates, registry);

        Ok(ClassificationResult {
            candidates,
            requires_decomposition: decomposition.is_some(),
            decomposition,
            classified_at: Utc::now(),
        })
    }
}

/// Highest-confidence candidate; an exact tie at the top is not a match.
pub fn select_single<'a>(classification: &'a ClassificationResult, request: &str) -> Result<&'a Candidate> {
    let no_match = |candidates: Vec<String>| OrchestrationError::NoConfidentMatch {
        request: request.to_string(),
        candidates,
    };

    let Some(top) = classification.top() else {
        return Err(no_match(Vec::new()));
    };

    let tied: Vec<String> = classification
        .candidates
        .iter()
        .filter(|c| c.confidence == top.confidence)
        .map(|c| c.workflow_id.clone())
        .collect();

    if tied.len() > 1 {
        return Err(no_match(tied));
    }

    Ok(top)
}

/// Lowercase, punctuation to spaces, padded so phrases match on word starts.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let needle = normalize(phrase);
    // Keep the leading boundary only so "crash" also matches "crashing"
    haystack.contains(needle.trim_end())
}
