//! Error types for the activity engine hot path.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("rule {rule_index} match compile failed: {reason}")]
    MatchCompile { rule_index: usize, reason: String },

    #[error("rule {rule_index} summary template compile failed: {reason}")]
    TemplateCompile { rule_index: usize, reason: String },

    #[error("policy {policy} rule {rule_index} evaluation failed: {reason}")]
    Evaluation {
        policy: String,
        rule_index: usize,
        reason: String,
    },

    #[error("no resource mapping for {group}/{kind}")]
    ResourceNotFound { group: String, kind: String },

    #[error("discovery failed: {reason}")]
    Discovery { reason: String },

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("deserialization error: {source}")]
    Deserialize {
        #[from]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// Evaluation error tagged with the owning policy and rule index.
    pub fn evaluation(policy: &str, rule_index: usize, reason: impl ToString) -> Self {
        EngineError::Evaluation {
            policy: policy.to_string(),
            rule_index,
            reason: reason.to_string(),
        }
    }

    /// The rule index carried by evaluation-shaped errors, if any.
    pub fn rule_index(&self) -> Option<usize> {
        match self {
            EngineError::MatchCompile { rule_index, .. }
            | EngineError::TemplateCompile { rule_index, .. }
            | EngineError::Evaluation { rule_index, .. } => Some(*rule_index),
            _ => None,
        }
    }
}
