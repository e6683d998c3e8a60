//! Tier 3: ask the model itself to classify the turn. Used only when the
//! heuristic and learned tiers both come back under their confidence
//! thresholds — the slowest and most expensive tier, reserved for genuinely
//! ambiguous input.

use crate::domain::{ClassificationResult, ClassifierTier, Complexity, TaskType};
use crate::llm::{ContentBlock, LlmError, LlmMessage, LlmRequest, LlmService, MessageRole, SystemContent};
use serde::Deserialize;

const SYSTEM_PROMPT: &str = r#"Classify the user's message. Respond with ONLY a JSON object of this exact shape, no prose:
{"task_type": "chat" | "bug_fix" | "feature" | "refactor" | "question", "complexity": "simple" | "medium" | "complex" | "epic", "confidence": <number between 0 and 1>}

- "chat" is for greetings, thanks, and small talk that needs no engineering work.
- "complexity" should reflect how much work the request implies, not how long the message is."#;

#[derive(Debug, Deserialize)]
struct LlmClassification {
    task_type: String,
    complexity: String,
    confidence: f64,
}

pub async fn classify(llm: &dyn LlmService, text: &str) -> Result<ClassificationResult, LlmError> {
    let request = LlmRequest {
        system: vec![SystemContent::new(SYSTEM_PROMPT)],
        messages: vec![LlmMessage {
            role: MessageRole::User,
            content: vec![ContentBlock::text(text)],
        }],
        tools: vec![],
        max_tokens: Some(200),
    };

    let response = llm.complete(&request).await?;
    let raw = response.text();
    let parsed: LlmClassification = parse_json_object(&raw)
        .ok_or_else(|| LlmError::invalid_request("classifier tier: model did not return valid JSON"))?;

    let task_type = parse_task_type(&parsed.task_type)
        .ok_or_else(|| LlmError::invalid_request(format!("unknown task_type: {}", parsed.task_type)))?;
    let complexity = parse_complexity(&parsed.complexity)
        .ok_or_else(|| LlmError::invalid_request(format!("unknown complexity: {}", parsed.complexity)))?;
    let confidence = parsed.confidence.clamp(0.0, 1.0);

    Ok(ClassificationResult {
        task_type,
        complexity,
        confidence,
        classifier_used: ClassifierTier::Llm,
        suggested_strategy: complexity.suggested_strategy(),
        estimated_tokens: complexity.estimated_tokens(),
    })
}

/// Models occasionally wrap JSON in prose or code fences despite instructions;
/// find the first balanced `{...}` span and parse that.
fn parse_json_object(raw: &str) -> Option<LlmClassification> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn parse_task_type(s: &str) -> Option<TaskType> {
    match s {
        "chat" => Some(TaskType::Chat),
        "bug_fix" => Some(TaskType::BugFix),
        "feature" => Some(TaskType::Feature),
        "refactor" => Some(TaskType::Refactor),
        "question" => Some(TaskType::Question),
        _ => None,
    }
}

fn parse_complexity(s: &str) -> Option<Complexity> {
    match s {
        "simple" => Some(Complexity::Simple),
        "medium" => Some(Complexity::Medium),
        "complex" => Some(Complexity::Complex),
        "epic" => Some(Complexity::Epic),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_wrapped_in_prose() {
        let raw = "Sure, here you go:\n```json\n{\"task_type\": \"bug_fix\", \"complexity\": \"medium\", \"confidence\": 0.9}\n```";
        let parsed = parse_json_object(raw).expect("should find the JSON span");
        assert_eq!(parsed.task_type, "bug_fix");
        assert_eq!(parsed.confidence, 0.9);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_json_object("not json at all").is_none());
    }
}
