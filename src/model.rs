//! Core domain types: chapters, sections, source references, stage payloads.
//!
//! A `Chapter` exclusively owns its sections and per-stage payloads; sources
//! are referenced by stable identifier, never by pointer. Version snapshots
//! take deep immutable copies of the content fields.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::schemas::{
    ChapterAnalysis, CriticalInfoCheck, FactCheck, ResearchContext, ReviewNotes, SynthesisPlan,
};

// ── Stages ───────────────────────────────────────────────────────────

/// The fourteen pipeline stages, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    InputValid,
    Context,
    ResearchInternal,
    ResearchExternal,
    SynthesisPlan,
    SectionGeneration,
    ImageIntegration,
    CitationBuild,
    QaScoring,
    FactCheck,
    Formatting,
    Review,
    GapAnalysis,
    Finalize,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [StageId; 14] = [
        StageId::InputValid,
        StageId::Context,
        StageId::ResearchInternal,
        StageId::ResearchExternal,
        StageId::SynthesisPlan,
        StageId::SectionGeneration,
        StageId::ImageIntegration,
        StageId::CitationBuild,
        StageId::QaScoring,
        StageId::FactCheck,
        StageId::Formatting,
        StageId::Review,
        StageId::GapAnalysis,
        StageId::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputValid => "input_valid",
            Self::Context => "context",
            Self::ResearchInternal => "research_internal",
            Self::ResearchExternal => "research_external",
            Self::SynthesisPlan => "synthesis_plan",
            Self::SectionGeneration => "section_generation",
            Self::ImageIntegration => "image_integration",
            Self::CitationBuild => "citation_build",
            Self::QaScoring => "qa_scoring",
            Self::FactCheck => "fact_check",
            Self::Formatting => "formatting",
            Self::Review => "review",
            Self::GapAnalysis => "gap_analysis",
            Self::Finalize => "finalize",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Invalid stage: {}", s))
    }

    /// One-based position in the pipeline, used in progress events.
    pub fn number(&self) -> u32 {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0) as u32 + 1
    }

    /// The stage that follows this one, or `None` for `finalize`.
    pub fn next(&self) -> Option<StageId> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a chapter run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    InProgress,
    Completed,
    Failed,
}

impl ChapterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid chapter status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

// ── Topic classification ─────────────────────────────────────────────

/// Chapter archetype; bounds the planned section count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChapterType {
    SurgicalDisease,
    PureAnatomy,
    SurgicalTechnique,
}

impl ChapterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SurgicalDisease => "surgical_disease",
            Self::PureAnatomy => "pure_anatomy",
            Self::SurgicalTechnique => "surgical_technique",
        }
    }

    /// Inclusive (min, max) bounds on the outline's section count.
    pub fn section_bounds(&self) -> (usize, usize) {
        match self {
            Self::SurgicalDisease => (80, 120),
            Self::PureAnatomy => (48, 80),
            Self::SurgicalTechnique => (60, 100),
        }
    }

    /// Typical section count, used when the planner must be clamped.
    pub fn typical_sections(&self) -> usize {
        match self {
            Self::SurgicalDisease => 100,
            Self::PureAnatomy => 60,
            Self::SurgicalTechnique => 80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

// ── Sources ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    InternalDoc,
    ExternalPub,
}

/// Uniform wrapper for internal documents and external publications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub origin: SourceOrigin,
    /// Document id, DOI, or external publication id.
    pub stable_id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub abstract_text: Option<String>,
    /// Retrieval relevance in [0,1].
    pub relevance_score: f64,
    /// Set by the AI relevance filter; absent until filtering runs.
    #[serde(default)]
    pub ai_relevance_score: Option<f64>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Cosine-similarity threshold above which two sources are considered the
/// same publication.
pub const FUZZY_DUP_THRESHOLD: f64 = 0.85;

impl SourceRef {
    /// Hex digest of the lowercased, alphanumeric-only title. Two records of
    /// the same publication normalize to the same hash even when punctuation
    /// or casing differ.
    pub fn normalized_title_hash(&self) -> String {
        let normalized: String = self
            .title
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex_digest(&hasher.finalize())
    }

    /// Whether two refs denote the same source: matching stable identifier,
    /// matching normalized title, or near-identical embeddings.
    pub fn same_source(&self, other: &SourceRef) -> bool {
        if self.stable_id == other.stable_id {
            return true;
        }
        if self.normalized_title_hash() == other.normalized_title_hash() {
            return true;
        }
        match (&self.embedding, &other.embedding) {
            (Some(a), Some(b)) => cosine_similarity(a, b) >= FUZZY_DUP_THRESHOLD,
            _ => false,
        }
    }

    /// Blended ranking score: relevance discounted by citation age.
    pub fn combined_score(&self, current_year: i32) -> f64 {
        let relevance = self.ai_relevance_score.unwrap_or(self.relevance_score);
        relevance * recency_weight(self.year, current_year)
    }
}

/// Recency weight in (0,1]: 5% decay per year of age, floored at 0.25.
pub fn recency_weight(year: Option<i32>, current_year: i32) -> f64 {
    match year {
        Some(y) => {
            let age = (current_year - y).max(0) as f64;
            (1.0 - 0.05 * age).max(0.25)
        }
        None => 0.5,
    }
}

/// Cosine similarity of two equal-length vectors; 0.0 when degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Sections & chapter content ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub index: usize,
    pub title: String,
    pub content: String,
    /// Stable ids of the sources this section cites.
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    pub word_count: usize,
    pub generation_cost_usd: f64,
    pub generated_at: DateTime<Utc>,
}

impl Section {
    pub fn word_count_of(content: &str) -> usize {
        content.split_whitespace().count()
    }
}

/// Deterministic quality scalars computed by the `qa_scoring` stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub depth: f64,
    pub coverage: f64,
    pub evidence: f64,
    pub currency: f64,
}

/// Chapter-level fact-check verdict aggregated over section checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckVerdict {
    pub passed: bool,
    pub overall_accuracy: f64,
    pub critical_issue_count: usize,
    /// Per-section claim records, indexed by section.
    pub sections: Vec<FactCheck>,
}

/// A single identified gap, weighted by severity in the final score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub dimension: GapDimension,
    pub severity: crate::schemas::Severity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapDimension {
    ContentCompleteness,
    SourceCoverage,
    SectionBalance,
    TemporalCoverage,
    CriticalInformation,
}

/// Output of the gap-analysis stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapReport {
    /// Weighted completeness score in [0,1].
    pub completeness: f64,
    /// Per-dimension raw scores in [0,1].
    pub dimension_scores: BTreeMap<String, f64>,
    pub gaps: Vec<Gap>,
    pub recommendations: Vec<String>,
    pub requires_revision: bool,
    #[serde(default)]
    pub critical_info: Option<CriticalInfoCheck>,
}

/// Deterministic image placement computed by `image_integration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePlacement {
    pub section_index: usize,
    pub image_id: String,
    pub document_id: String,
    pub caption: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePlan {
    pub placements: Vec<ImagePlacement>,
}

/// One bibliography entry with back-references into sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BibliographyEntry {
    /// One-based citation number, stable across the chapter.
    pub number: usize,
    pub source: SourceRef,
    /// Indices of the sections citing this source.
    pub cited_by: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bibliography {
    pub entries: Vec<BibliographyEntry>,
}

/// Structural normalization report from the `formatting` stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormattingReport {
    /// Slug anchors, one per section, in section order.
    pub anchors: Vec<String>,
    pub headings_normalized: usize,
    pub tables_normalized: usize,
}

/// Summary payload persisted by the section-generation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionGenSummary {
    pub sections_generated: usize,
    pub total_words: usize,
    pub total_cost_usd: f64,
}

/// Terminal payload written by `finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRecord {
    pub version: u32,
    pub completed_at: DateTime<Utc>,
    pub total_cost_usd: f64,
}

// ── Stage payloads ───────────────────────────────────────────────────

/// Typed result of one completed stage.
///
/// Persisted as a single opaque JSON column but always materialized into
/// this enum in memory, so stage consumers match on variants instead of
/// probing dynamic maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum StagePayload {
    InputValid(ChapterAnalysis),
    Context(ResearchContext),
    ResearchInternal(Vec<SourceRef>),
    ResearchExternal(Vec<SourceRef>),
    SynthesisPlan(SynthesisPlan),
    SectionGeneration(SectionGenSummary),
    ImageIntegration(ImagePlan),
    CitationBuild(Bibliography),
    QaScoring(QualityScores),
    FactCheck(FactCheckVerdict),
    Formatting(FormattingReport),
    Review(ReviewNotes),
    GapAnalysis(GapReport),
    Finalize(FinalizeRecord),
}

impl StagePayload {
    /// The stage this payload belongs to.
    pub fn stage(&self) -> StageId {
        match self {
            Self::InputValid(_) => StageId::InputValid,
            Self::Context(_) => StageId::Context,
            Self::ResearchInternal(_) => StageId::ResearchInternal,
            Self::ResearchExternal(_) => StageId::ResearchExternal,
            Self::SynthesisPlan(_) => StageId::SynthesisPlan,
            Self::SectionGeneration(_) => StageId::SectionGeneration,
            Self::ImageIntegration(_) => StageId::ImageIntegration,
            Self::CitationBuild(_) => StageId::CitationBuild,
            Self::QaScoring(_) => StageId::QaScoring,
            Self::FactCheck(_) => StageId::FactCheck,
            Self::Formatting(_) => StageId::Formatting,
            Self::Review(_) => StageId::Review,
            Self::GapAnalysis(_) => StageId::GapAnalysis,
            Self::Finalize(_) => StageId::Finalize,
        }
    }
}

// ── Chapter ──────────────────────────────────────────────────────────

/// The central entity: one generated document and its run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: Uuid,
    pub owner_id: String,
    pub topic: String,
    pub title: String,
    pub status: ChapterStatus,
    pub current_stage: StageId,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// One payload per completed stage; append-only once a stage completes.
    pub stage_payloads: BTreeMap<StageId, StagePayload>,
    pub quality: QualityScores,
    #[serde(default)]
    pub completeness: Option<f64>,
    #[serde(default)]
    pub fact_check_passed: Option<bool>,
    #[serde(default)]
    pub requires_revision: bool,
    /// Monotonically increasing snapshot counter; 0 until first completion.
    pub version: u32,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub failure_kind: Option<crate::errors::ErrorKind>,
    #[serde(default)]
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    pub fn new(owner_id: impl Into<String>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            title: topic.clone(),
            topic,
            status: ChapterStatus::InProgress,
            current_stage: StageId::InputValid,
            sections: Vec::new(),
            summary: None,
            key_points: Vec::new(),
            tags: Vec::new(),
            stage_payloads: BTreeMap::new(),
            quality: QualityScores::default(),
            completeness: None,
            fact_check_passed: None,
            requires_revision: false,
            version: 0,
            total_cost_usd: 0.0,
            failure_kind: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn payload(&self, stage: StageId) -> Option<&StagePayload> {
        self.stage_payloads.get(&stage)
    }

    /// The topic analysis from stage 1, if that stage has completed.
    pub fn analysis(&self) -> Option<&ChapterAnalysis> {
        match self.payload(StageId::InputValid) {
            Some(StagePayload::InputValid(a)) => Some(a),
            _ => None,
        }
    }

    pub fn research_context(&self) -> Option<&ResearchContext> {
        match self.payload(StageId::Context) {
            Some(StagePayload::Context(c)) => Some(c),
            _ => None,
        }
    }

    pub fn outline(&self) -> Option<&SynthesisPlan> {
        match self.payload(StageId::SynthesisPlan) {
            Some(StagePayload::SynthesisPlan(p)) => Some(p),
            _ => None,
        }
    }

    /// Union of internal and external research sources, internal first.
    pub fn research_sources(&self) -> Vec<&SourceRef> {
        let mut out = Vec::new();
        if let Some(StagePayload::ResearchInternal(refs)) = self.payload(StageId::ResearchInternal)
        {
            out.extend(refs.iter());
        }
        if let Some(StagePayload::ResearchExternal(refs)) = self.payload(StageId::ResearchExternal)
        {
            out.extend(refs.iter());
        }
        out
    }
}

/// Immutable copy of chapter content taken at completion and at each
/// user-initiated edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterVersion {
    pub chapter_id: Uuid,
    pub version: u32,
    pub title: String,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub summary: Option<String>,
    pub is_current: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ── Indexed documents (research inputs) ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Committed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid document status: {}", s)),
        }
    }
}

/// An indexed source document. Produced by the ingestion pipeline; the
/// research layer only reads documents whose status is `Committed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    pub status: DocumentStatus,
    /// Citation strings extracted from the document text.
    #[serde(default)]
    pub citations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub page: u32,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub document_id: String,
    pub page: u32,
    pub bytes_path: String,
    #[serde(default)]
    pub analysis: Option<crate::schemas::ImageAnalysis>,
    /// Relevance of the image within its document, in [0,1].
    #[serde(default)]
    pub relevance: f64,
}
