// Data model (spec.md §3). Timestamps are UTC; identifiers are UUID strings except
// `project_id`, which is a stable caller-supplied string ("global" is distinguished).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const GLOBAL_PROJECT_ID: &str = "global";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub is_active: bool,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn lazy(project_id: &str) -> Self {
        Project {
            project_id: project_id.to_string(),
            name: project_id.to_string(),
            is_active: true,
            settings: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub project_id: String,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub token_count: i64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Human,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Human => "HUMAN",
            Role::Assistant => "ASSISTANT",
            Role::System => "SYSTEM",
            Role::Tool => "TOOL",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HUMAN" => Ok(Role::Human),
            "ASSISTANT" => Ok(Role::Assistant),
            "SYSTEM" => Ok(Role::System),
            "TOOL" => Ok(Role::Tool),
            other => Err(crate::error::MemoryError::Validation(format!(
                "unknown message role: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: i64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitType {
    Conversation,
    ErrorLog,
    Decision,
    CodeSnippet,
    Documentation,
    Archive,
}

impl UnitType {
    /// Stage D `type_priority` weight table (spec.md §4.6 Stage D).
    pub fn priority_weight(&self) -> f32 {
        match self {
            UnitType::Documentation => 1.3,
            UnitType::Decision => 1.4,
            UnitType::ErrorLog => 1.3,
            UnitType::CodeSnippet => 1.2,
            UnitType::Conversation => 1.0,
            UnitType::Archive => 1.1,
        }
    }

    /// Ordinal used for Stage D's "higher unit_type priority" tie-break and for
    /// the Injector's type-priority reordering — higher is more important.
    pub fn priority_rank(&self) -> u8 {
        match self {
            UnitType::Decision => 5,
            UnitType::Documentation => 4,
            UnitType::ErrorLog => 3,
            UnitType::CodeSnippet => 2,
            UnitType::Archive => 1,
            UnitType::Conversation => 0,
        }
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitType::Conversation => "CONVERSATION",
            UnitType::ErrorLog => "ERROR_LOG",
            UnitType::Decision => "DECISION",
            UnitType::CodeSnippet => "CODE_SNIPPET",
            UnitType::Documentation => "DOCUMENTATION",
            UnitType::Archive => "ARCHIVE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UnitType {
    type Err = crate::error::MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONVERSATION" => Ok(UnitType::Conversation),
            "ERROR_LOG" => Ok(UnitType::ErrorLog),
            "DECISION" => Ok(UnitType::Decision),
            "CODE_SNIPPET" => Ok(UnitType::CodeSnippet),
            "DOCUMENTATION" => Ok(UnitType::Documentation),
            "ARCHIVE" => Ok(UnitType::Archive),
            other => Err(crate::error::MemoryError::Validation(format!(
                "unknown unit_type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub unit_id: String,
    pub project_id: String,
    pub conversation_id: Option<String>,
    pub unit_type: UnitType,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub keywords: BTreeSet<String>,
    pub relevance_score: f32,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl MemoryUnit {
    /// I6: `expires_at`, when set, must be strictly after `created_at`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.title.len() > 500 {
            return Err(crate::error::MemoryError::Validation(
                "title exceeds 500 characters".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.relevance_score) {
            return Err(crate::error::MemoryError::Validation(
                "relevance_score must be in [0,1]".to_string(),
            ));
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= self.created_at {
                return Err(crate::error::MemoryError::Validation(
                    "expires_at must be strictly after created_at".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Dense vector bound 1:1 to a `MemoryUnit`. Stored only in the vector store; the
/// relational store holds at most a reference (spec.md §3).
#[derive(Debug, Clone)]
pub struct Embedding {
    pub unit_id: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub provider: String,
    pub model: String,
    pub operation: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
}
