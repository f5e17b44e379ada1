//! Memory extraction
//!
//! Turns one inbound message into typed memory records: always exactly one
//! group-scoped episode, plus personal semantic memories and event logs when
//! personal extraction is enabled. Profile extraction yields a draft that the
//! caller merges into the sender's previous profile.

mod analyzer;
mod profile;
mod summarizer;

use std::sync::Arc;

use crate::config::ExtractionConfig;
use crate::error::{MemoryError, Result};
use crate::record::{MemoryRecord, Message};

pub use analyzer::{Analyzer, EventDraft, PersonalDrafts, SemanticDraft, SentenceAnalyzer};
pub use profile::{
    latest_profile, ActivityProfiler, GroupActivity, GroupImportanceEvidence, ImportanceEvidence,
    ProfileDraft, ProfileExtractor, ProfileMemory, ProfileMemoryMerger, ProjectInfo,
    PROFILE_MEMORY_TYPE,
};
pub use summarizer::{EpisodeDraft, Summarizer, TranscriptSummarizer};

/// Records derived from one message
#[derive(Debug, Clone)]
pub struct Extraction {
    /// The episode first, then semantic memories, then event logs
    pub records: Vec<MemoryRecord>,
    /// Set when the analyzer or profiler failed; the episode is still present
    pub notice: Option<String>,
    /// Profile update for the sender, when profile extraction ran
    pub profile: Option<ProfileDraft>,
}

/// Runs the summarizer and (optionally) the analyzer and profiler over a message
pub struct MemoryExtractor {
    summarizer: Arc<dyn Summarizer>,
    analyzer: Option<Arc<dyn Analyzer>>,
    profiler: Option<Arc<dyn ProfileExtractor>>,
    config: ExtractionConfig,
}

impl MemoryExtractor {
    pub fn new(summarizer: Arc<dyn Summarizer>, config: ExtractionConfig) -> Self {
        Self {
            summarizer,
            analyzer: None,
            profiler: None,
            config,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_profiler(mut self, profiler: Arc<dyn ProfileExtractor>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    fn personal_analyzer(&self) -> Option<&Arc<dyn Analyzer>> {
        self.analyzer
            .as_ref()
            .filter(|_| self.config.personal_memory)
    }

    fn profiler(&self) -> Option<&Arc<dyn ProfileExtractor>> {
        self.profiler
            .as_ref()
            .filter(|_| self.config.profile_memory)
    }

    /// Extract records from a message
    ///
    /// # Errors
    /// `Extraction` when the summarizer fails or returns an empty episode.
    /// Analyzer and profiler failures are not errors; they set
    /// [`Extraction::notice`].
    pub async fn extract(&self, message: &Message) -> Result<Extraction> {
        let analysis = async {
            match self.personal_analyzer() {
                Some(analyzer) => Some(analyzer.analyze(message).await),
                None => None,
            }
        };
        let profiling = async {
            match self.profiler() {
                Some(profiler) => Some(profiler.extract_profile(message).await),
                None => None,
            }
        };
        let (summary, analysis, profiling) =
            tokio::join!(self.summarizer.summarize(message), analysis, profiling);

        let draft = summary.map_err(|e| MemoryError::extraction(e.to_string()))?;
        if draft.episode.trim().is_empty() {
            return Err(MemoryError::extraction("summarizer returned an empty episode"));
        }

        let mut records = vec![MemoryRecord::builder()
            .episode(draft.subject, draft.episode)
            .group_id(message.group_id.clone())
            .created_at(message.create_time)
            .provenance(message.provenance())
            .metadata("message_id", message.message_id.clone())
            .build()?];

        let mut failures = Vec::new();
        match analysis {
            Some(Ok(drafts)) => records.extend(personal_records(message, drafts)?),
            Some(Err(e)) => {
                log::warn!(
                    "Analyzer failed for message {}: {}. Keeping episode only.",
                    message.message_id,
                    e
                );
                failures.push(e.to_string());
            }
            None => {}
        }

        let profile = match profiling {
            Some(Ok(draft)) => Some(draft),
            Some(Err(e)) => {
                log::warn!(
                    "Profiler failed for message {}: {}. Profile left unchanged.",
                    message.message_id,
                    e
                );
                failures.push(e.to_string());
                None
            }
            None => None,
        };
        let notice = (!failures.is_empty())
            .then(|| MemoryError::PartialExtraction(failures.join("; ")).to_string());

        log::debug!(
            "Extracted {} records from message {}",
            records.len(),
            message.message_id
        );
        Ok(Extraction {
            records,
            notice,
            profile,
        })
    }
}

fn personal_records(message: &Message, drafts: PersonalDrafts) -> Result<Vec<MemoryRecord>> {
    let base = || {
        MemoryRecord::builder()
            .user_id(message.sender.clone())
            .group_id(message.group_id.clone())
            .created_at(message.create_time)
            .provenance(message.provenance())
            .metadata("message_id", message.message_id.clone())
    };

    let semantic = drafts
        .semantic_memories
        .into_iter()
        .filter(|draft| !draft.summary.trim().is_empty())
        .map(|draft| {
            base()
                .semantic_memory(draft.subject, draft.summary, draft.evidence, draft.validity)
                .build()
        });
    let events = drafts
        .event_logs
        .into_iter()
        .filter(|draft| !draft.fact.trim().is_empty())
        .map(|draft| base().event_log(draft.fact, draft.evidence).build());

    semantic
        .chain(events)
        .map(|built| built.map_err(MemoryError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryKind;
    use crate::temporal::ValidityWindow;
    use async_trait::async_trait;

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _message: &Message) -> Result<EpisodeDraft> {
            Err(MemoryError::other("model unavailable"))
        }
    }

    struct BlankSummarizer;

    #[async_trait]
    impl Summarizer for BlankSummarizer {
        async fn summarize(&self, _message: &Message) -> Result<EpisodeDraft> {
            Ok(EpisodeDraft {
                subject: None,
                episode: "   ".into(),
            })
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl Analyzer for FailingAnalyzer {
        async fn analyze(&self, _message: &Message) -> Result<PersonalDrafts> {
            Err(MemoryError::other("analysis timed out"))
        }
    }

    struct FixedAnalyzer;

    #[async_trait]
    impl Analyzer for FixedAnalyzer {
        async fn analyze(&self, _message: &Message) -> Result<PersonalDrafts> {
            Ok(PersonalDrafts {
                semantic_memories: vec![SemanticDraft {
                    subject: Some("Travel".into()),
                    summary: "Travels to Beijing for work".into(),
                    evidence: None,
                    validity: ValidityWindow::unbounded(),
                }],
                event_logs: vec![
                    EventDraft {
                        fact: "Ate roast duck".into(),
                        evidence: None,
                    },
                    EventDraft {
                        fact: " ".into(),
                        evidence: None,
                    },
                ],
            })
        }
    }

    fn message() -> Message {
        Message::new("m1", "user_001", "我昨天去北京出差，吃了烤鸭").with_group("G1")
    }

    struct FailingProfiler;

    #[async_trait]
    impl ProfileExtractor for FailingProfiler {
        async fn extract_profile(&self, _message: &Message) -> Result<ProfileDraft> {
            Err(MemoryError::other("profile model offline"))
        }
    }

    fn personal() -> ExtractionConfig {
        ExtractionConfig {
            personal_memory: true,
            ..ExtractionConfig::default()
        }
    }

    fn profiling() -> ExtractionConfig {
        ExtractionConfig {
            profile_memory: true,
            ..ExtractionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_exactly_one_group_scoped_episode() {
        let extractor = MemoryExtractor::new(Arc::new(TranscriptSummarizer), ExtractionConfig::default());
        let extraction = extractor.extract(&message()).await.unwrap();

        assert_eq!(extraction.records.len(), 1);
        let episode = &extraction.records[0];
        assert_eq!(episode.kind(), MemoryKind::Episode);
        assert!(episode.user_id.is_none());
        assert_eq!(episode.group_id.as_deref(), Some("G1"));
        assert_eq!(episode.provenance, vec!["m1"]);
        assert!(extraction.notice.is_none());
    }

    #[tokio::test]
    async fn test_summarizer_failure_fails_extraction() {
        let extractor = MemoryExtractor::new(Arc::new(FailingSummarizer), personal())
            .with_analyzer(Arc::new(FixedAnalyzer));
        let err = extractor.extract(&message()).await.unwrap_err();
        assert!(matches!(err, MemoryError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_blank_episode_is_an_extraction_error() {
        let extractor = MemoryExtractor::new(Arc::new(BlankSummarizer), ExtractionConfig::default());
        let err = extractor.extract(&message()).await.unwrap_err();
        assert!(matches!(err, MemoryError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_analyzer_failure_keeps_episode() {
        let extractor = MemoryExtractor::new(Arc::new(TranscriptSummarizer), personal())
            .with_analyzer(Arc::new(FailingAnalyzer));
        let extraction = extractor.extract(&message()).await.unwrap();

        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0].kind(), MemoryKind::Episode);
        let notice = extraction.notice.unwrap();
        assert!(notice.contains("analysis timed out"));
    }

    #[tokio::test]
    async fn test_personal_records_scoped_to_sender() {
        let extractor = MemoryExtractor::new(Arc::new(TranscriptSummarizer), personal())
            .with_analyzer(Arc::new(FixedAnalyzer));
        let extraction = extractor.extract(&message()).await.unwrap();

        let kinds: Vec<MemoryKind> = extraction.records.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![MemoryKind::Episode, MemoryKind::SemanticMemory, MemoryKind::EventLog]
        );
        for record in &extraction.records[1..] {
            assert_eq!(record.user_id.as_deref(), Some("user_001"));
            assert_eq!(record.group_id.as_deref(), Some("G1"));
        }
    }

    #[tokio::test]
    async fn test_analyzer_skipped_when_disabled() {
        let extractor = MemoryExtractor::new(Arc::new(TranscriptSummarizer), ExtractionConfig::default())
            .with_analyzer(Arc::new(FailingAnalyzer));
        let extraction = extractor.extract(&message()).await.unwrap();

        assert_eq!(extraction.records.len(), 1);
        assert!(extraction.notice.is_none());
    }

    #[tokio::test]
    async fn test_profile_draft_only_when_enabled() {
        let extractor = MemoryExtractor::new(Arc::new(TranscriptSummarizer), profiling())
            .with_profiler(Arc::new(ActivityProfiler));
        let extraction = extractor.extract(&message()).await.unwrap();
        assert_eq!(extraction.records.len(), 1);
        let draft = extraction.profile.unwrap();
        assert_eq!(draft.activity[0].group_id, "G1");

        let disabled = MemoryExtractor::new(Arc::new(TranscriptSummarizer), ExtractionConfig::default())
            .with_profiler(Arc::new(ActivityProfiler));
        assert!(disabled.extract(&message()).await.unwrap().profile.is_none());
    }

    #[tokio::test]
    async fn test_profiler_failure_is_a_notice() {
        let extractor = MemoryExtractor::new(Arc::new(TranscriptSummarizer), profiling())
            .with_profiler(Arc::new(FailingProfiler));
        let extraction = extractor.extract(&message()).await.unwrap();

        assert_eq!(extraction.records.len(), 1);
        assert!(extraction.profile.is_none());
        assert!(extraction.notice.unwrap().contains("profile model offline"));
    }
}
