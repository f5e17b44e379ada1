//! Retrieval routing
//!
//! Maps a query's `data_source` to a collection and its `memory_scope` to a
//! filter. Both axes are declarative tables, so every (data_source × scope)
//! combination is one row lookup per axis rather than a nested branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::index::IndexPayload;
use crate::record::MemoryKind;
use crate::temporal::CreationWindow;

pub const DEFAULT_TIME_RANGE_DAYS: u32 = 365;
pub const DEFAULT_TOP_K: usize = 20;

/// How candidates are ranked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Vector index only
    Embedding,
    /// Lexical index only
    Bm25,
    /// Both, fused with Reciprocal Rank Fusion
    #[default]
    Rrf,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Bm25 => "bm25",
            Self::Rrf => "rrf",
        }
    }
}

/// Which collection a query reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    #[serde(alias = "memcell")]
    Episode,
    SemanticMemory,
    EventLog,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episode => "episode",
            Self::SemanticMemory => "semantic_memory",
            Self::EventLog => "event_log",
        }
    }
}

/// Which owner a query filters on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    #[default]
    All,
    Personal,
    Group,
}

/// A retrieval request
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub query_text: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub time_range_days: u32,
    pub top_k: usize,
    pub retrieval_mode: RetrievalMode,
    pub data_source: DataSource,
    pub memory_scope: MemoryScope,
    /// Reference time for the creation window and the validity check
    pub current_time: Option<DateTime<Utc>>,
}

impl RetrievalQuery {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            user_id: None,
            group_id: None,
            time_range_days: DEFAULT_TIME_RANGE_DAYS,
            top_k: DEFAULT_TOP_K,
            retrieval_mode: RetrievalMode::default(),
            data_source: DataSource::default(),
            memory_scope: MemoryScope::default(),
            current_time: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn mode(mut self, mode: RetrievalMode) -> Self {
        self.retrieval_mode = mode;
        self
    }

    pub fn source(mut self, source: DataSource) -> Self {
        self.data_source = source;
        self
    }

    pub fn scope(mut self, scope: MemoryScope) -> Self {
        self.memory_scope = scope;
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.current_time = Some(time);
        self
    }

    pub fn time_range_days(mut self, days: u32) -> Self {
        self.time_range_days = days;
        self
    }
}

/// Constraint on a record's `user_id`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UserClause {
    /// No constraint
    #[default]
    Any,
    /// `user_id == U`
    Equals(String),
    /// `user_id == U` for personal records; group records carry no user id
    /// and pass
    EqualsOrGroupScoped(String),
    /// Any non-null `user_id`
    Present,
    /// `user_id IS NULL`
    Absent,
}

impl UserClause {
    fn matches(&self, user_id: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Equals(expected) => user_id == Some(expected.as_str()),
            Self::EqualsOrGroupScoped(expected) => {
                user_id.map_or(true, |user| user == expected)
            }
            Self::Present => user_id.is_some(),
            Self::Absent => user_id.is_none(),
        }
    }
}

/// Predicate evaluated against index payloads
///
/// The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub user: UserClause,
    /// `group_id == G` when set
    pub group_id: Option<String>,
    /// Bounds on `created_at`
    pub created: Option<CreationWindow>,
    /// Validity window must contain this instant
    pub valid_at: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn matches(&self, payload: &IndexPayload) -> bool {
        self.user.matches(payload.user_id.as_deref())
            && self
                .group_id
                .as_deref()
                .map_or(true, |group| payload.group_id.as_deref() == Some(group))
            && self
                .created
                .map_or(true, |window| window.contains(payload.timestamp))
            && self
                .valid_at
                .map_or(true, |time| payload.validity.contains(time))
    }
}

/// Owner clauses produced by a scope row
type ScopeBuilder = fn(&RetrievalQuery) -> (UserClause, Option<String>);

fn all_scope(query: &RetrievalQuery) -> (UserClause, Option<String>) {
    let user = query
        .user_id
        .clone()
        .map_or(UserClause::Any, UserClause::EqualsOrGroupScoped);
    (user, query.group_id.clone())
}

fn personal_scope(query: &RetrievalQuery) -> (UserClause, Option<String>) {
    let user = query
        .user_id
        .clone()
        .map_or(UserClause::Present, UserClause::Equals);
    (user, None)
}

fn group_scope(query: &RetrievalQuery) -> (UserClause, Option<String>) {
    (UserClause::Absent, query.group_id.clone())
}

const SCOPE_TABLE: [(MemoryScope, ScopeBuilder); 3] = [
    (MemoryScope::All, all_scope),
    (MemoryScope::Personal, personal_scope),
    (MemoryScope::Group, group_scope),
];

/// Collection selected by a data source row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRoute {
    pub collection: MemoryKind,
    /// Apply the validity-window clause when a reference time is given
    pub checks_validity: bool,
}

const SOURCE_TABLE: [(DataSource, SourceRoute); 3] = [
    (
        DataSource::Episode,
        SourceRoute {
            collection: MemoryKind::Episode,
            checks_validity: false,
        },
    ),
    (
        DataSource::SemanticMemory,
        SourceRoute {
            collection: MemoryKind::SemanticMemory,
            checks_validity: true,
        },
    ),
    (
        DataSource::EventLog,
        SourceRoute {
            collection: MemoryKind::EventLog,
            checks_validity: false,
        },
    ),
];

/// Resolved target of a query
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub collection: MemoryKind,
    pub filter: RecordFilter,
}

/// Resolves queries to a collection and a filter
#[derive(Debug, Clone)]
pub struct RetrievalRouter {
    max_top_k: usize,
}

impl RetrievalRouter {
    pub fn new(max_top_k: usize) -> Self {
        Self { max_top_k }
    }

    /// Validate the query and resolve its route. `now` is the reference time
    /// when the query carries none.
    pub fn resolve(&self, query: &RetrievalQuery, now: DateTime<Utc>) -> Result<Route> {
        if query.query_text.trim().is_empty() {
            return Err(MemoryError::validation("query is required"));
        }
        if query.top_k == 0 || query.top_k > self.max_top_k {
            return Err(MemoryError::validation(format!(
                "top_k must be between 1 and {}",
                self.max_top_k
            )));
        }

        let source = lookup(&SOURCE_TABLE, &query.data_source)
            .ok_or_else(|| MemoryError::other("data source has no route"))?;
        let scope = lookup(&SCOPE_TABLE, &query.memory_scope)
            .ok_or_else(|| MemoryError::other("memory scope has no route"))?;

        let (user, group_id) = scope(query);
        let reference = query.current_time.unwrap_or(now);
        let valid_at = query.current_time.filter(|_| source.checks_validity);

        Ok(Route {
            collection: source.collection,
            filter: RecordFilter {
                user,
                group_id,
                created: Some(CreationWindow::looking_back(
                    reference,
                    query.time_range_days,
                )),
                valid_at,
            },
        })
    }
}

impl Default for RetrievalRouter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_TOP_K)
    }
}

fn lookup<K: PartialEq, V: Copy>(table: &[(K, V)], key: &K) -> Option<V> {
    table
        .iter()
        .find(|(candidate, _)| candidate == key)
        .map(|(_, value)| *value)
}
