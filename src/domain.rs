//! Core entity types shared by the store, gateway, and orchestration worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier resolved from verified authentication claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_user_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.owner_user_id == user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_user_id: Option<UserId>,
    pub role: MessageRole,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    /// Set when this message is a synthetic error reply surfaced to the client.
    #[serde(default)]
    pub is_error: bool,
}

/// Task type produced by the `HybridClassifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Chat,
    BugFix,
    Feature,
    Refactor,
    Question,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Chat => "chat",
            TaskType::BugFix => "bug_fix",
            TaskType::Feature => "feature",
            TaskType::Refactor => "refactor",
            TaskType::Question => "question",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    Epic,
}

/// Execution strategy a complexity maps to. The strategies themselves are
/// out of core scope (spec.md §4.5); this is only the routing label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SingleShot,
    Iterative,
    MultiAgent,
    HybridEnsemble,
}

impl Complexity {
    pub fn suggested_strategy(self) -> Strategy {
        match self {
            Complexity::Simple => Strategy::SingleShot,
            Complexity::Medium => Strategy::Iterative,
            Complexity::Complex => Strategy::MultiAgent,
            Complexity::Epic => Strategy::HybridEnsemble,
        }
    }

    /// Fixed function of complexity, per spec.md §4.6.
    pub fn estimated_tokens(self) -> u32 {
        match self {
            Complexity::Simple => 2_000,
            Complexity::Medium => 8_000,
            Complexity::Complex => 25_000,
            Complexity::Epic => 75_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierTier {
    Heuristic,
    Learned,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub confidence: f64,
    pub classifier_used: ClassifierTier,
    pub suggested_strategy: Strategy,
    pub estimated_tokens: u32,
}

impl ClassificationResult {
    /// Whether this turn should be answered directly by the chat pipeline
    /// rather than handed off to a longer-running strategy (spec.md §4.5).
    pub fn is_chitchat(&self) -> bool {
        self.task_type == TaskType::Chat && self.complexity == Complexity::Simple
    }
}

/// Lifecycle state of a materialized `Task`. The core only ever produces
/// `Created` — it hands the task off as a routing decision and stops there;
/// the execution strategies that would advance a task past this state are
/// out of scope (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
}

/// The routing record materialized for any non-chitchat turn (spec.md §4.5
/// "Supplemented"): a `Task` derived from the current turn's
/// `ClassificationResult`, persisted as a `System` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub conversation_id: String,
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub suggested_strategy: Strategy,
    pub estimated_tokens: u32,
    pub status: TaskStatus,
}

impl Task {
    pub fn from_classification(id: String, conversation_id: String, classification: &ClassificationResult) -> Self {
        Self {
            id,
            conversation_id,
            task_type: classification.task_type,
            complexity: classification.complexity,
            suggested_strategy: classification.suggested_strategy,
            estimated_tokens: classification.estimated_tokens,
            status: TaskStatus::Created,
        }
    }
}
