//! Three-tier task classifier (spec.md §4.6): heuristic keyword matching,
//! then a small learned linear model, then an LLM fallback for ambiguous
//! input. Each tier only runs if the previous one's confidence fell below
//! its configured threshold — the literal control flow is the escalation-
//! monotonicity property spec.md §8 asks to hold.

mod heuristic;
mod learned;
mod llm_tier;

use crate::domain::ClassificationResult;
use crate::llm::LlmService;
use std::sync::Arc;

/// Versioned, checked-in scoring artifact for the learned tier — there is no
/// training pipeline in this core (spec.md Non-goals); only serving.
const MODEL_V1_JSON: &str = include_str!("classifier/model_v1.json");

pub struct HybridClassifier {
    heuristic_threshold: f64,
    learned_threshold: f64,
    learned_model: learned::LearnedModel,
    llm: Option<Arc<dyn LlmService>>,
}

impl HybridClassifier {
    pub fn new(heuristic_threshold: f64, learned_threshold: f64, llm: Option<Arc<dyn LlmService>>) -> Self {
        let learned_model = learned::LearnedModel::parse(MODEL_V1_JSON)
            .expect("classifier/model_v1.json must parse at startup");
        Self {
            heuristic_threshold,
            learned_threshold,
            learned_model,
            llm,
        }
    }

    pub async fn classify(&self, text: &str) -> ClassificationResult {
        let h = heuristic::classify(text);
        if h.confidence >= self.heuristic_threshold {
            tracing::debug!(confidence = h.confidence, tier = "heuristic", "classification resolved");
            return h;
        }

        let l = learned::classify(text, &self.learned_model);
        if l.confidence >= self.learned_threshold {
            tracing::debug!(confidence = l.confidence, tier = "learned", "classification resolved");
            return l;
        }

        match &self.llm {
            Some(llm) => match llm_tier::classify(llm.as_ref(), text).await {
                Ok(result) => {
                    tracing::debug!(tier = "llm", "classification resolved");
                    result
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LLM classification tier failed, falling back to learned result");
                    l
                }
            },
            None => l,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClassifierTier, Complexity, TaskType};

    #[tokio::test]
    async fn heuristic_tier_resolves_clear_bug_fix() {
        // spec.md §8's first cascade example, verbatim.
        let classifier = HybridClassifier::new(0.85, 0.70, None);
        let result = classifier.classify("fix the off-by-one in sum()").await;
        assert_eq!(result.task_type, TaskType::BugFix);
        assert_eq!(result.classifier_used, ClassifierTier::Heuristic);
        assert!(result.confidence >= 0.85);
    }

    #[tokio::test]
    async fn ambiguous_input_escalates_past_heuristic_and_clears_learned_threshold() {
        // spec.md §8's second cascade example, verbatim: fails heuristic,
        // passes learned at >= 0.70.
        let classifier = HybridClassifier::new(0.85, 0.70, None);
        let result = classifier.classify("please take a look at this when you can").await;
        assert_ne!(result.classifier_used, ClassifierTier::Heuristic);
        assert_eq!(result.classifier_used, ClassifierTier::Learned);
        assert!(result.confidence >= 0.70);
    }

    #[tokio::test]
    async fn chitchat_is_simple_chat() {
        let classifier = HybridClassifier::new(0.85, 0.70, None);
        let result = classifier.classify("hey, how's it going?").await;
        assert!(result.is_chitchat() || result.task_type == TaskType::Chat);
        assert_eq!(result.complexity, Complexity::Simple);
    }
}
