//! Episode summarization capability

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::Message;

/// Episode content produced by a summarizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeDraft {
    pub subject: Option<String>,
    pub episode: String,
}

/// Turns a message into episode content
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, message: &Message) -> Result<EpisodeDraft>;
}

/// Summarizer that records the message verbatim as a transcript line
///
/// Used when no summarization model is wired in. The group name, when known,
/// becomes the subject.
#[derive(Debug, Clone, Default)]
pub struct TranscriptSummarizer;

#[async_trait]
impl Summarizer for TranscriptSummarizer {
    async fn summarize(&self, message: &Message) -> Result<EpisodeDraft> {
        Ok(EpisodeDraft {
            subject: message.group_name.clone(),
            episode: format!("{}: {}", message.display_sender(), message.content.trim()),
        })
    }
}
