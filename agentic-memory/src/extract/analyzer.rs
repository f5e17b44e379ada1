//! Personal memory analysis capability

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::Message;
use crate::temporal::ValidityWindow;

/// Semantic memory content produced by an analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticDraft {
    pub subject: Option<String>,
    pub summary: String,
    pub evidence: Option<String>,
    #[serde(default)]
    pub validity: ValidityWindow,
}

/// Event log content produced by an analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub fact: String,
    pub evidence: Option<String>,
}

/// Everything an analyzer derived from one message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalDrafts {
    pub semantic_memories: Vec<SemanticDraft>,
    pub event_logs: Vec<EventDraft>,
}

/// Derives personal memories from a message
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, message: &Message) -> Result<PersonalDrafts>;
}

/// Analyzer that treats every sentence of the message as an atomic fact
///
/// Used when no inference model is wired in. It never produces semantic
/// memories.
#[derive(Debug, Clone, Default)]
pub struct SentenceAnalyzer;

const SENTENCE_BREAKS: &[char] = &['.', '!', '?', '。', '！', '？', '；', ';', '\n'];

#[async_trait]
impl Analyzer for SentenceAnalyzer {
    async fn analyze(&self, message: &Message) -> Result<PersonalDrafts> {
        let event_logs = message
            .content
            .split(SENTENCE_BREAKS)
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .map(|sentence| EventDraft {
                fact: format!("{}: {}", message.display_sender(), sentence),
                evidence: Some(message.content.clone()),
            })
            .collect();

        Ok(PersonalDrafts {
            semantic_memories: Vec::new(),
            event_logs,
        })
    }
}
