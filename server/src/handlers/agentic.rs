//! Memorize, retrieve and profile endpoints.

use agentic_memory::router::{DEFAULT_TIME_RANGE_DAYS, DEFAULT_TOP_K};
use agentic_memory::{
    DataSource, MemoryError, MemoryRecord, MemoryScope, MemoryService, Message, ProfileMemory,
    RetrievalMetadata, RetrievalMode, RetrievalQuery, RetrievedMemory,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::ApiResponse;
use crate::error::{ServerError, ServerResult};

// ==========================================
// Memorize
// ==========================================

/// Parameters for memorizing one chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct MemorizeRequest {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    pub message_id: String,
    /// ISO-8601 timestamp; naive values are read as UTC
    pub create_time: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub refer_list: Option<Vec<String>>,
}

impl MemorizeRequest {
    pub fn into_message(self) -> ServerResult<Message> {
        let create_time = parse_timestamp("create_time", &self.create_time)?;
        Ok(Message {
            message_id: self.message_id,
            create_time,
            sender: self.sender,
            sender_name: non_blank(self.sender_name),
            content: self.content,
            group_id: non_blank(self.group_id),
            group_name: non_blank(self.group_name),
            refer_list: self.refer_list.unwrap_or_default(),
        })
    }
}

/// One committed memory in a memorize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedMemory {
    pub memory_type: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

impl From<&MemoryRecord> for SavedMemory {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            memory_type: record.kind().as_str().to_string(),
            user_id: record.user_id.clone(),
            group_id: record.group_id.clone(),
            timestamp: record.created_at,
            content: record.content_text().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorizeResult {
    pub saved_memories: Vec<SavedMemory>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

// ==========================================
// Retrieve
// ==========================================

/// Parameters for a lightweight retrieval.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_time_range_days")]
    pub time_range_days: u32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
    /// `"memcell"` is accepted for `"episode"`
    #[serde(default)]
    pub data_source: DataSource,
    #[serde(default)]
    pub memory_scope: MemoryScope,
    #[serde(default)]
    pub current_time: Option<String>,
}

fn default_time_range_days() -> u32 {
    DEFAULT_TIME_RANGE_DAYS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl RetrieveRequest {
    pub fn into_query(self) -> ServerResult<RetrievalQuery> {
        let current_time = non_blank(self.current_time)
            .map(|value| parse_timestamp("current_time", &value))
            .transpose()?;

        let mut query = RetrievalQuery::new(self.query)
            .time_range_days(self.time_range_days)
            .top_k(self.top_k)
            .mode(self.retrieval_mode)
            .source(self.data_source)
            .scope(self.memory_scope);
        query.user_id = non_blank(self.user_id);
        query.group_id = non_blank(self.group_id);
        query.current_time = current_time;
        Ok(query)
    }
}

/// One retrieved memory as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryView {
    pub score: f32,
    pub event_id: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    pub metadata: Value,
}

impl From<RetrievedMemory> for MemoryView {
    fn from(memory: RetrievedMemory) -> Self {
        Self {
            score: memory.score,
            event_id: memory.record_id.to_string(),
            user_id: memory.user_id,
            group_id: memory.group_id,
            timestamp: memory.timestamp,
            subject: memory.subject,
            episode: memory.episode,
            summary: memory.summary,
            evidence: memory.evidence,
            metadata: memory.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResult {
    pub memories: Vec<MemoryView>,
    pub count: usize,
    pub metadata: RetrievalMetadata,
}

// ==========================================
// Profile
// ==========================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileRequest {
    pub user_id: String,
}

// ==========================================
// Handler
// ==========================================

/// Serves the endpoints over a shared service
pub struct AgenticHandler {
    service: Arc<MemoryService>,
}

impl AgenticHandler {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self { service }
    }

    pub async fn memorize(&self, params: Value) -> ApiResponse<MemorizeResult> {
        ApiResponse::from_result("memorize", self.try_memorize(params).await)
    }

    pub async fn retrieve_lightweight(&self, params: Value) -> ApiResponse<RetrieveResult> {
        ApiResponse::from_result("retrieve_lightweight", self.try_retrieve(params).await)
    }

    pub async fn profile(&self, params: Value) -> ApiResponse<ProfileMemory> {
        ApiResponse::from_result("profile", self.try_profile(params))
    }

    fn try_profile(&self, params: Value) -> ServerResult<(String, ProfileMemory)> {
        let request: ProfileRequest = serde_json::from_value(params)?;
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(ServerError::invalid("user_id is required"));
        }

        let profile = self
            .service
            .profile(user_id)
            .ok_or_else(|| MemoryError::NotFound(format!("profile of {}", user_id)))?;
        Ok((format!("Profile of {}", user_id), profile))
    }

    async fn try_memorize(&self, params: Value) -> ServerResult<(String, MemorizeResult)> {
        let request: MemorizeRequest = serde_json::from_value(params)?;
        let message = request.into_message()?;
        let message_id = message.message_id.clone();

        let outcome = self.service.memorize(message).await?;
        let saved_memories: Vec<SavedMemory> = outcome.saved.iter().map(SavedMemory::from).collect();

        let summary = if outcome.replayed {
            format!("Message {} was already memorized", message_id)
        } else {
            format!("Extracted {} memories", saved_memories.len())
        };
        tracing::info!("memorize {}: {}", message_id, summary);

        Ok((
            summary,
            MemorizeResult {
                count: saved_memories.len(),
                saved_memories,
                notice: outcome.notice,
            },
        ))
    }

    async fn try_retrieve(&self, params: Value) -> ServerResult<(String, RetrieveResult)> {
        let request: RetrieveRequest = serde_json::from_value(params)?;
        let query = request.into_query()?;

        let response = self.service.retrieve(query).await?;
        let memories: Vec<MemoryView> = response.memories.into_iter().map(MemoryView::from).collect();

        tracing::debug!(
            "retrieve_lightweight: {} memories in {} ms",
            memories.len(),
            response.metadata.total_latency_ms
        );

        Ok((
            format!("Retrieved {} memories", memories.len()),
            RetrieveResult {
                count: memories.len(),
                memories,
                metadata: response.metadata,
            },
        ))
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
fn parse_timestamp(field: &str, value: &str) -> ServerResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            ServerError::invalid(format!("{} is not an ISO-8601 timestamp: {:?}", field, value))
        })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
