//! Profile memory
//!
//! A profile is a running per-user summary: stated traits, the projects a
//! user works on, and how active they are in each group. Records are
//! append-only, so an update never edits the previous profile. It commits a
//! new semantic memory tagged `memory_type = "profile"` that names the record
//! it supersedes, and readers take the latest one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::record::{MemoryKind, MemoryRecord, Message, RecordId};
use crate::temporal::ValidityWindow;

pub const PROFILE_MEMORY_TYPE: &str = "profile";
pub const PROFILE_SUBJECT: &str = "profile";

/// Activity counters behind a group importance judgement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportanceEvidence {
    /// Messages the user sent in the group
    pub message_count: u32,
    /// Earlier messages those messages referred to
    pub reference_count: u32,
}

impl ImportanceEvidence {
    fn absorb(&mut self, other: ImportanceEvidence) {
        self.message_count = self.message_count.saturating_add(other.message_count);
        self.reference_count = self.reference_count.saturating_add(other.reference_count);
    }

    fn weight(&self) -> u32 {
        self.message_count.saturating_add(self.reference_count)
    }
}

/// Activity observed in one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupActivity {
    pub group_id: String,
    pub evidence: ImportanceEvidence,
}

/// Accumulated activity in one group and whether it makes the user important there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupImportanceEvidence {
    pub group_id: String,
    pub evidence: ImportanceEvidence,
    pub is_important: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// The merged profile of one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMemory {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
    /// Sorted by group id
    #[serde(default)]
    pub groups: Vec<GroupImportanceEvidence>,
}

impl ProfileMemory {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Text stored as the record summary, so the profile is searchable
    pub fn render(&self) -> String {
        let mut parts = vec![format!(
            "Profile of {}",
            self.user_name.as_deref().unwrap_or(&self.user_id)
        )];
        if !self.traits.is_empty() {
            parts.push(format!("traits: {}", self.traits.join(", ")));
        }
        if !self.projects.is_empty() {
            let projects: Vec<String> = self
                .projects
                .iter()
                .map(|project| match &project.role {
                    Some(role) => format!("{} ({})", project.name, role),
                    None => project.name.clone(),
                })
                .collect();
            parts.push(format!("projects: {}", projects.join(", ")));
        }
        let important: Vec<&str> = self
            .groups
            .iter()
            .filter(|group| group.is_important)
            .map(|group| group.group_id.as_str())
            .collect();
        if !important.is_empty() {
            parts.push(format!("important in: {}", important.join(", ")));
        }
        parts.join("; ")
    }

    /// Decode the profile carried by a record, if it is a profile record
    pub fn from_record(record: &MemoryRecord) -> Option<Self> {
        if record.kind() != MemoryKind::SemanticMemory
            || record.metadata.get("memory_type").and_then(|v| v.as_str())
                != Some(PROFILE_MEMORY_TYPE)
        {
            return None;
        }
        let profile = record.metadata.get("profile")?.clone();
        match serde_json::from_value(profile) {
            Ok(profile) => Some(profile),
            Err(e) => {
                log::warn!("Unreadable profile in record {}: {}", record.id, e);
                None
            }
        }
    }

    /// Build the record that stores this profile
    pub fn to_record(
        &self,
        message: &Message,
        created_at: DateTime<Utc>,
        supersedes: Option<RecordId>,
    ) -> Result<MemoryRecord> {
        let mut builder = MemoryRecord::builder()
            .semantic_memory(
                Some(PROFILE_SUBJECT.to_string()),
                self.render(),
                None,
                ValidityWindow::unbounded(),
            )
            .user_id(self.user_id.clone())
            .created_at(created_at)
            .provenance(message.provenance())
            .metadata("message_id", message.message_id.clone())
            .metadata("memory_type", PROFILE_MEMORY_TYPE)
            .metadata("profile", serde_json::to_value(self)?);
        if let Some(previous) = supersedes {
            builder = builder.metadata("supersedes", previous.to_string());
        }
        builder.build().map_err(MemoryError::from)
    }
}

/// Latest profile of `user_id` among `records`, with the record holding it
pub fn latest_profile(
    records: impl IntoIterator<Item = MemoryRecord>,
    user_id: &str,
) -> Option<(MemoryRecord, ProfileMemory)> {
    records
        .into_iter()
        .filter(|record| record.user_id.as_deref() == Some(user_id))
        .filter_map(|record| ProfileMemory::from_record(&record).map(|profile| (record, profile)))
        .max_by_key(|(record, _)| (record.created_at, record.id))
}

/// What one message adds to its sender's profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub user_name: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
    #[serde(default)]
    pub activity: Vec<GroupActivity>,
}

/// Derives profile updates from a message
#[async_trait]
pub trait ProfileExtractor: Send + Sync {
    async fn extract_profile(&self, message: &Message) -> Result<ProfileDraft>;
}

/// Profile extractor that only tracks group activity
///
/// Used when no inference model is wired in: it records the sender's display
/// name and counts the message (and its references) toward the group.
#[derive(Debug, Clone, Default)]
pub struct ActivityProfiler;

#[async_trait]
impl ProfileExtractor for ActivityProfiler {
    async fn extract_profile(&self, message: &Message) -> Result<ProfileDraft> {
        let activity = message
            .group_id
            .iter()
            .map(|group_id| GroupActivity {
                group_id: group_id.clone(),
                evidence: ImportanceEvidence {
                    message_count: 1,
                    reference_count: u32::try_from(message.refer_list.len()).unwrap_or(u32::MAX),
                },
            })
            .collect();

        Ok(ProfileDraft {
            user_name: message.sender_name.clone(),
            activity,
            ..ProfileDraft::default()
        })
    }
}

/// Folds a draft into the previous profile
#[derive(Debug, Clone, Copy)]
pub struct ProfileMemoryMerger {
    /// Activity weight at which a user counts as important in a group
    importance_threshold: u32,
}

impl ProfileMemoryMerger {
    pub fn new(importance_threshold: u32) -> Self {
        Self {
            importance_threshold,
        }
    }

    pub fn merge(
        &self,
        user_id: &str,
        previous: Option<&ProfileMemory>,
        draft: ProfileDraft,
    ) -> ProfileMemory {
        let mut profile = previous
            .cloned()
            .unwrap_or_else(|| ProfileMemory::new(user_id));

        if let Some(name) = draft.user_name.filter(|name| !name.trim().is_empty()) {
            profile.user_name = Some(name);
        }

        for trait_text in draft.traits {
            let trait_text = trait_text.trim();
            let known = profile
                .traits
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(trait_text));
            if !trait_text.is_empty() && !known {
                profile.traits.push(trait_text.to_string());
            }
        }

        for project in draft.projects {
            if project.name.trim().is_empty() {
                continue;
            }
            match profile
                .projects
                .iter_mut()
                .find(|existing| existing.name.eq_ignore_ascii_case(project.name.trim()))
            {
                Some(existing) => {
                    if project.role.is_some() {
                        existing.role = project.role;
                    }
                    if project.status.is_some() {
                        existing.status = project.status;
                    }
                }
                None => profile.projects.push(ProjectInfo {
                    name: project.name.trim().to_string(),
                    ..project
                }),
            }
        }

        for activity in draft.activity {
            match profile
                .groups
                .iter_mut()
                .find(|group| group.group_id == activity.group_id)
            {
                Some(group) => group.evidence.absorb(activity.evidence),
                None => profile.groups.push(GroupImportanceEvidence {
                    group_id: activity.group_id,
                    evidence: activity.evidence,
                    is_important: false,
                }),
            }
        }
        for group in &mut profile.groups {
            group.is_important = group.evidence.weight() >= self.importance_threshold;
        }
        profile.groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));

        profile
    }
}
