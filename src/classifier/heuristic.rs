//! Tier 1: keyword-table matching. Cheap, synchronous, and confident only
//! when the input is unambiguous — anything else falls through to the
//! learned tier.

use crate::domain::{ClassificationResult, ClassifierTier, Complexity, TaskType};

struct Keywords {
    task_type: TaskType,
    words: &'static [&'static str],
}

const TABLE: &[Keywords] = &[
    Keywords {
        task_type: TaskType::BugFix,
        words: &[
            "bug", "fix", "broken", "crash", "error", "exception", "fails", "failing",
            "regression", "doesn't work", "not working", "stack trace", "panic", "traceback",
        ],
    },
    Keywords {
        task_type: TaskType::Feature,
        words: &[
            "add", "implement", "build", "create", "new feature", "support for", "would like",
            "can you add", "i want", "it would be nice",
        ],
    },
    Keywords {
        task_type: TaskType::Refactor,
        words: &[
            "refactor", "clean up", "cleanup", "reorganize", "simplify", "restructure",
            "extract", "rename", "dedupe", "tech debt",
        ],
    },
    Keywords {
        task_type: TaskType::Question,
        words: &[
            "why", "how do", "how does", "what is", "what does", "explain", "difference between",
            "is it possible", "can i",
        ],
    },
];

const CHITCHAT_WORDS: &[&str] = &[
    "hi", "hey", "hello", "thanks", "thank you", "how's it going", "how are you", "good morning",
    "good night", "lol", "nice", "cool", "great job", "awesome",
];

/// Tokens that push an otherwise-matched task into a higher complexity band.
const COMPLEXITY_MARKERS: &[(&str, Complexity)] = &[
    ("across the codebase", Complexity::Epic),
    ("entire system", Complexity::Epic),
    ("multiple services", Complexity::Epic),
    ("end to end", Complexity::Complex),
    ("several files", Complexity::Complex),
    ("integration", Complexity::Complex),
    ("migrate", Complexity::Complex),
];

pub fn classify(text: &str) -> ClassificationResult {
    let lower = text.to_lowercase();
    let word_count = text.split_whitespace().count();

    if CHITCHAT_WORDS.iter().any(|w| lower.contains(w)) && word_count <= 12 {
        return build(TaskType::Chat, Complexity::Simple, 0.95);
    }

    let mut best: Option<(TaskType, usize)> = None;
    for entry in TABLE {
        let hits = entry.words.iter().filter(|w| lower.contains(*w)).count();
        if hits > 0 && best.map(|(_, best_hits)| hits > best_hits).unwrap_or(true) {
            best = Some((entry.task_type, hits));
        }
    }

    let Some((task_type, hits)) = best else {
        return build(TaskType::Chat, Complexity::Simple, 0.2);
    };

    // A single unambiguous keyword hit already clears the heuristic tier's
    // threshold (spec.md's own "fix the off-by-one in sum()" example has
    // exactly one); density beyond that pushes confidence toward certainty.
    let confidence = (0.75 + 0.15 * hits as f64).min(0.98);
    let complexity = complexity_for(&lower, word_count);
    build(task_type, complexity, confidence)
}

fn complexity_for(lower: &str, word_count: usize) -> Complexity {
    let marker_complexity = COMPLEXITY_MARKERS
        .iter()
        .filter(|(marker, _)| lower.contains(marker))
        .map(|(_, c)| *c)
        .max();

    let size_complexity = if word_count > 80 {
        Complexity::Epic
    } else if word_count > 40 {
        Complexity::Complex
    } else if word_count > 15 {
        Complexity::Medium
    } else {
        Complexity::Simple
    };

    marker_complexity.map(|m| m.max(size_complexity)).unwrap_or(size_complexity)
}

fn build(task_type: TaskType, complexity: Complexity, confidence: f64) -> ClassificationResult {
    ClassificationResult {
        task_type,
        complexity,
        confidence,
        classifier_used: ClassifierTier::Heuristic,
        suggested_strategy: complexity.suggested_strategy(),
        estimated_tokens: complexity.estimated_tokens(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_bug_fix_is_confident() {
        let result = classify("there's a bug causing a crash on startup, please fix it");
        assert_eq!(result.task_type, TaskType::BugFix);
        assert!(result.confidence >= 0.85);
    }

    #[test]
    fn spec_example_single_keyword_hit_clears_threshold() {
        // spec.md §8's literal first cascade example: one keyword hit ("fix")
        // still needs to clear the 0.85 heuristic threshold.
        let result = classify("fix the off-by-one in sum()");
        assert_eq!(result.task_type, TaskType::BugFix);
        assert!(result.confidence >= 0.85);
    }

    #[test]
    fn chitchat_short_greeting() {
        let result = classify("hey there!");
        assert_eq!(result.task_type, TaskType::Chat);
        assert_eq!(result.complexity, Complexity::Simple);
    }

    #[test]
    fn unrelated_prose_is_low_confidence() {
        let result = classify("the weather today is unusually pleasant for this time of year");
        assert!(result.confidence < 0.85);
    }

    #[test]
    fn codebase_wide_marker_forces_epic() {
        let result = classify("refactor error handling across the codebase");
        assert_eq!(result.complexity, Complexity::Epic);
    }
}
