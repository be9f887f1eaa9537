//! Structured-output contracts for schema-constrained provider calls.
//!
//! Every LLM call that must return machine-readable data goes through one of
//! these types. The router serializes the schemars-generated JSON Schema into
//! the provider request (`strict` mode where the provider supports it) and
//! validates the returned payload against the same schema before handing it
//! to the caller, so orchestrator code never sees malformed structured
//! output.
//!
//! All contracts reject unknown fields; validation failures are
//! [`ProviderError::SchemaViolation`] and count against the provider for
//! breaker and fallback purposes.

use schemars::{JsonSchema, SchemaGenerator};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

use crate::errors::ProviderError;
use crate::model::{ChapterType, Complexity};

/// A contract couples a Rust type with its schema name as sent to providers.
pub trait SchemaContract: DeserializeOwned + JsonSchema {
    /// Stable name used in provider requests and error messages.
    const NAME: &'static str;

    /// The compiled JSON Schema for this contract.
    fn json_schema() -> serde_json::Value {
        let schema = SchemaGenerator::default().into_root_schema_for::<Self>();
        serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Validate `raw` against `T`'s schema and deserialize it.
///
/// Used by the router on every schema-constrained response; a failure here
/// is a provider failure, not a caller bug.
pub fn validate_and_parse<T: SchemaContract>(raw: &serde_json::Value) -> Result<T, ProviderError> {
    let schema = <T as SchemaContract>::json_schema();
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ProviderError::SchemaViolation {
            schema: T::NAME.to_string(),
            message: format!("schema failed to compile: {e}"),
        })?;
    if let Err(error) = validator.validate(raw) {
        return Err(ProviderError::SchemaViolation {
            schema: T::NAME.to_string(),
            message: error.to_string(),
        });
    }
    serde_json::from_value(raw.clone()).map_err(|e| ProviderError::SchemaViolation {
        schema: T::NAME.to_string(),
        message: e.to_string(),
    })
}

// ── Stage 1: topic analysis ──────────────────────────────────────────

/// Output of the `input_valid` stage: what kind of chapter the topic calls
/// for and how large it should be.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChapterAnalysis {
    pub primary_concepts: Vec<String>,
    pub chapter_type: ChapterType,
    /// 3–20 search keywords derived from the topic.
    #[schemars(length(min = 3, max = 20))]
    pub keywords: Vec<String>,
    pub complexity: Complexity,
    /// Planned section count, bounded before the outline refines it.
    #[schemars(range(min = 10, max = 150))]
    pub estimated_section_count: u32,
}

impl SchemaContract for ChapterAnalysis {
    const NAME: &'static str = "ChapterAnalysis";
}

// ── Stage 2: research context ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct KeyReference {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfidenceAssessment {
    #[schemars(range(min = 0.0, max = 1.0))]
    pub overall_confidence: f64,
}

/// Output of the `context` stage: synonyms, query sets for each retrieval
/// path, and the entity categories the chapter must cover.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ResearchContext {
    pub research_gaps: Vec<String>,
    pub key_references: Vec<KeyReference>,
    /// Entity categories (e.g. "anatomy" -> terms) the content must address.
    pub content_categories: BTreeMap<String, Vec<String>>,
    pub confidence_assessment: ConfidenceAssessment,
    #[serde(default)]
    pub temporal_coverage: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Queries for internal vector search.
    #[serde(default)]
    pub vector_queries: Vec<String>,
    /// Queries for the external bibliographic API.
    #[serde(default)]
    pub external_queries: Vec<String>,
    /// Plain keyword queries.
    #[serde(default)]
    pub keyword_queries: Vec<String>,
}

impl SchemaContract for ResearchContext {
    const NAME: &'static str = "ResearchContext";
}

// ── Research: relevance scoring ──────────────────────────────────────

/// Relevance verdict for a single research candidate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SourceRelevance {
    #[schemars(range(min = 0.0, max = 1.0))]
    pub relevance_score: f64,
    pub reason: String,
}

impl SchemaContract for SourceRelevance {
    const NAME: &'static str = "SourceRelevance";
}

// ── Stage 5: synthesis plan ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PlannedSection {
    pub title: String,
    #[schemars(range(min = 50, max = 5000))]
    pub estimated_words: u32,
    /// Stable identifiers of the sources this section should draw on.
    #[serde(default)]
    pub source_ids: Vec<String>,
}

/// Ordered outline produced by the `synthesis_plan` stage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SynthesisPlan {
    pub sections: Vec<PlannedSection>,
}

impl SchemaContract for SynthesisPlan {
    const NAME: &'static str = "SynthesisPlan";
}

// ── Stage 10: fact check ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClaimCategory {
    Anatomy,
    Diagnosis,
    Treatment,
    Prognosis,
    Epidemiology,
    Technique,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClaimRecord {
    pub claim: String,
    pub verified: bool,
    #[schemars(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
    #[serde(default)]
    pub source_id: Option<String>,
    pub category: ClaimCategory,
    pub severity_if_wrong: Severity,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Per-section output of the fact-check stage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FactCheck {
    pub claims: Vec<ClaimRecord>,
    #[schemars(range(min = 0.0, max = 1.0))]
    pub overall_accuracy: f64,
    pub unverified_count: u32,
    pub critical_issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SchemaContract for FactCheck {
    const NAME: &'static str = "FactCheck";
}

// ── Stage 12: review ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReviewSuggestion {
    /// Zero-based index of the section the suggestion targets, if any.
    #[serde(default)]
    pub section_index: Option<u32>,
    pub suggestion: String,
    pub priority: Severity,
}

/// Suggestions from the review stage. Recorded on the chapter; never
/// applied to content.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReviewNotes {
    pub suggestions: Vec<ReviewSuggestion>,
    #[serde(default)]
    pub overall_assessment: Option<String>,
}

impl SchemaContract for ReviewNotes {
    const NAME: &'static str = "ReviewNotes";
}

// ── Stage 13: critical-information probe ─────────────────────────────

/// Schema-guided check for essential safety/contraindication content,
/// consumed by the gap analyzer's critical-information dimension.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CriticalInfoCheck {
    /// Essential items (contraindications, safety warnings) present.
    pub present: Vec<String>,
    /// Essential items that are missing from the chapter.
    pub missing: Vec<String>,
}

impl SchemaContract for CriticalInfoCheck {
    const NAME: &'static str = "CriticalInfoCheck";
}

// ── Generic extraction contracts ─────────────────────────────────────

/// Generic key-value extraction used by ingestion and research filtering.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MetadataExtraction {
    pub entries: BTreeMap<String, serde_json::Value>,
}

impl SchemaContract for MetadataExtraction {
    const NAME: &'static str = "MetadataExtraction";
}

/// Vision-provider output for a single extracted image. Opaque to the
/// orchestrator; the ingestion pipeline stores it alongside the image.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ImageAnalysis {
    pub description: String,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub anatomical_structures: Vec<String>,
    #[serde(default)]
    pub extracted_text: Option<String>,
}

impl SchemaContract for ImageAnalysis {
    const NAME: &'static str = "ImageAnalysis";
}
