//! Message and memory record types
//!
//! Core types for representing inbound chat messages and the typed memory
//! records derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::temporal::ValidityWindow;

/// An inbound chat message. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub create_time: DateTime<Utc>,
    /// User id of the author
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    /// Ids of referenced messages, in order
    #[serde(default)]
    pub refer_list: Vec<String>,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            create_time: Utc::now(),
            sender: sender.into(),
            sender_name: None,
            content: content.into(),
            group_id: None,
            group_name: None,
            refer_list: Vec::new(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_create_time(mut self, time: DateTime<Utc>) -> Self {
        self.create_time = time;
        self
    }

    /// Reject messages missing a required field
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("message_id", &self.message_id),
            ("sender", &self.sender),
            ("content", &self.content),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(MemoryError::validation(format!("{} is required", field)));
            }
        }
        Ok(())
    }

    /// Name to show for the author
    pub fn display_sender(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }

    /// Ids this message derives from: itself, then whatever it references
    pub fn provenance(&self) -> Vec<String> {
        std::iter::once(self.message_id.clone())
            .chain(self.refer_list.iter().cloned())
            .collect()
    }
}

/// Stable identifier shared by the record store and both indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Create a new random RecordId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The three record collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episode,
    SemanticMemory,
    EventLog,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 3] = [Self::Episode, Self::SemanticMemory, Self::EventLog];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episode => "episode",
            Self::SemanticMemory => "semantic_memory",
            Self::EventLog => "event_log",
        }
    }

    /// Personal kinds always carry a user id; group kinds never do
    pub fn is_personal(&self) -> bool {
        !matches!(self, Self::Episode)
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MemoryError::validation(format!("unknown memory kind: {}", s)))
    }
}

/// Kind-specific content of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    /// Conversation summary, group scoped
    Episode {
        #[serde(skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        episode: String,
    },
    /// Derived personal memory with an optional validity window
    SemanticMemory {
        #[serde(skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        evidence: Option<String>,
        #[serde(default)]
        validity: ValidityWindow,
    },
    /// Atomic personal fact
    EventLog {
        fact: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        evidence: Option<String>,
    },
}

impl RecordBody {
    pub fn kind(&self) -> MemoryKind {
        match self {
            Self::Episode { .. } => MemoryKind::Episode,
            Self::SemanticMemory { .. } => MemoryKind::SemanticMemory,
            Self::EventLog { .. } => MemoryKind::EventLog,
        }
    }
}

/// A memory record derived from one message
///
/// Records are append-only: once committed to the record store their content
/// never changes. A later record supersedes an earlier one only by convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Join key across the record store and both indexes
    pub id: RecordId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub body: RecordBody,
    /// Assigned during sync, never at creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Originating message ids
    #[serde(default)]
    pub provenance: Vec<String>,
    /// Open extension map (always a JSON object)
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl MemoryRecord {
    /// Create a new builder for MemoryRecord
    pub fn builder() -> MemoryRecordBuilder {
        MemoryRecordBuilder::new()
    }

    pub fn kind(&self) -> MemoryKind {
        self.body.kind()
    }

    /// Primary text: episode text, semantic summary, or event fact
    pub fn content_text(&self) -> &str {
        match &self.body {
            RecordBody::Episode { episode, .. } => episode,
            RecordBody::SemanticMemory { summary, .. } => summary,
            RecordBody::EventLog { fact, .. } => fact,
        }
    }

    /// Text that is embedded and tokenized during sync
    pub fn searchable_text(&self) -> String {
        let (subject, evidence) = match &self.body {
            RecordBody::Episode { subject, .. } => (subject.as_deref(), None),
            RecordBody::SemanticMemory {
                subject, evidence, ..
            } => (subject.as_deref(), evidence.as_deref()),
            RecordBody::EventLog { evidence, .. } => (None, evidence.as_deref()),
        };
        [subject, Some(self.content_text()), evidence]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Validity window; episodes and event logs are always valid
    pub fn validity(&self) -> ValidityWindow {
        match &self.body {
            RecordBody::SemanticMemory { validity, .. } => *validity,
            _ => ValidityWindow::unbounded(),
        }
    }

    /// Check the personal/group scoping invariant
    pub fn check_scope(&self) -> Result<()> {
        let kind = self.kind();
        let has_user = self
            .user_id
            .as_deref()
            .map_or(false, |user| !user.trim().is_empty());
        match (kind.is_personal(), has_user) {
            (true, false) => Err(MemoryError::scope(format!(
                "{} record {} requires a user_id",
                kind, self.id
            ))),
            (false, true) => Err(MemoryError::scope(format!(
                "{} record {} must not carry a user_id",
                kind, self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Builder for MemoryRecord with fluent API
#[derive(Debug, Default)]
pub struct MemoryRecordBuilder {
    id: Option<RecordId>,
    body: Option<RecordBody>,
    user_id: Option<String>,
    group_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    provenance: Vec<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl MemoryRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record ID (auto-generated if not set)
    pub fn id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set as episode
    pub fn episode(mut self, subject: Option<String>, episode: impl Into<String>) -> Self {
        self.body = Some(RecordBody::Episode {
            subject,
            episode: episode.into(),
        });
        self
    }

    /// Set as semantic memory
    pub fn semantic_memory(
        mut self,
        subject: Option<String>,
        summary: impl Into<String>,
        evidence: Option<String>,
        validity: ValidityWindow,
    ) -> Self {
        self.body = Some(RecordBody::SemanticMemory {
            subject,
            summary: summary.into(),
            evidence,
            validity,
        });
        self
    }

    /// Set as event log
    pub fn event_log(mut self, fact: impl Into<String>, evidence: Option<String>) -> Self {
        self.body = Some(RecordBody::EventLog {
            fact: fact.into(),
            evidence,
        });
        self
    }

    /// Set the body directly
    pub fn body(mut self, body: RecordBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn group_id(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn provenance(mut self, provenance: Vec<String>) -> Self {
        self.provenance = provenance;
        self
    }

    /// Add one metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the MemoryRecord, enforcing the scoping invariant
    pub fn build(self) -> std::result::Result<MemoryRecord, RecordBuilderError> {
        let body = self.body.ok_or(RecordBuilderError::MissingBody)?;
        let record = MemoryRecord {
            id: self.id.unwrap_or_default(),
            user_id: self.user_id,
            group_id: self.group_id,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            body,
            embedding: None,
            provenance: self.provenance,
            metadata: serde_json::Value::Object(self.metadata),
        };
        record
            .check_scope()
            .map_err(|e| RecordBuilderError::Scope(e.to_string()))?;
        Ok(record)
    }
}

/// Errors that can occur when building a MemoryRecord
#[derive(Debug, thiserror::Error)]
pub enum RecordBuilderError {
    #[error("Missing required field: body")]
    MissingBody,
    #[error("{0}")]
    Scope(String),
}

impl From<RecordBuilderError> for MemoryError {
    fn from(err: RecordBuilderError) -> Self {
        match err {
            RecordBuilderError::Scope(msg) => MemoryError::ScopeViolation(msg),
            other => MemoryError::Other(other.to_string()),
        }
    }
}
