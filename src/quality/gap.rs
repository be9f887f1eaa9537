//! Gap analysis: score a generated chapter across five weighted dimensions
//! and decide whether it needs revision.
//!
//! Four dimensions are pure functions of persisted content; the
//! critical-information dimension is schema-guided through the router. The
//! analyses run concurrently and aggregate into one report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Datelike;

use crate::errors::StageError;
use crate::model::{Chapter, Gap, GapDimension, GapReport, StageId, StagePayload};
use crate::providers::{ProviderRouter, TaskKind};
use crate::schemas::{CriticalInfoCheck, Severity};

/// Dimension weights; sum to 1.0.
const W_CONTENT: f64 = 0.50;
const W_SOURCES: f64 = 0.20;
const W_BALANCE: f64 = 0.15;
const W_TEMPORAL: f64 = 0.10;
const W_CRITICAL: f64 = 0.05;

/// Citations within this many years count as recent.
const RECENT_WINDOW_YEARS: i32 = 5;

/// Per-gap deductions from the weighted base score.
fn deduction(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 0.15,
        Severity::High => 0.08,
        Severity::Medium => 0.04,
        Severity::Low => 0.02,
    }
}

pub struct GapAnalyzer {
    router: Arc<ProviderRouter>,
    revision_threshold: f64,
}

impl GapAnalyzer {
    pub fn new(router: Arc<ProviderRouter>, revision_threshold: f64) -> Self {
        Self {
            router,
            revision_threshold,
        }
    }

    pub async fn analyze(&self, chapter: &Chapter) -> Result<GapReport, StageError> {
        // The only non-deterministic dimension runs concurrently with
        // nothing to wait on it; the deterministic four are immediate.
        let critical_future = self.check_critical_info(chapter);

        let content = content_completeness(chapter);
        let sources = source_coverage(chapter);
        let balance = section_balance(chapter);
        let temporal = temporal_coverage(chapter);
        let critical_info = critical_future.await?;
        let critical = critical_info_score(&critical_info);

        let mut dimension_scores = BTreeMap::new();
        dimension_scores.insert("content_completeness".to_string(), content);
        dimension_scores.insert("source_coverage".to_string(), sources);
        dimension_scores.insert("section_balance".to_string(), balance);
        dimension_scores.insert("temporal_coverage".to_string(), temporal);
        dimension_scores.insert("critical_information".to_string(), critical);

        let weighted = W_CONTENT * content
            + W_SOURCES * sources
            + W_BALANCE * balance
            + W_TEMPORAL * temporal
            + W_CRITICAL * critical;

        let mut gaps = Vec::new();
        push_dimension_gap(&mut gaps, GapDimension::ContentCompleteness, content);
        push_dimension_gap(&mut gaps, GapDimension::SourceCoverage, sources);
        push_dimension_gap(&mut gaps, GapDimension::SectionBalance, balance);
        push_dimension_gap(&mut gaps, GapDimension::TemporalCoverage, temporal);
        for missing in &critical_info.missing {
            gaps.push(Gap {
                dimension: GapDimension::CriticalInformation,
                severity: Severity::Critical,
                description: format!("missing essential safety content: {missing}"),
            });
        }

        let total_deduction: f64 = gaps.iter().map(|g| deduction(g.severity)).sum();
        let completeness = (weighted - total_deduction).clamp(0.0, 1.0);

        let critical_count = gaps
            .iter()
            .filter(|g| g.severity == Severity::Critical)
            .count();
        let high_count = gaps.iter().filter(|g| g.severity == Severity::High).count();
        let requires_revision =
            completeness < self.revision_threshold || critical_count > 0 || high_count > 2;

        let recommendations = gaps
            .iter()
            .map(|g| format!("Address {:?}: {}", g.dimension, g.description))
            .collect();

        Ok(GapReport {
            completeness,
            dimension_scores,
            gaps,
            recommendations,
            requires_revision,
            critical_info: Some(critical_info),
        })
    }

    async fn check_critical_info(&self, chapter: &Chapter) -> Result<CriticalInfoCheck, StageError> {
        let headings: Vec<&str> = chapter.sections.iter().map(|s| s.title.as_str()).collect();
        let prompt = format!(
            "Chapter topic: {}\n\nSection headings:\n{}\n\nList the essential \
             safety content (contraindications, complication warnings, \
             critical decision points) this chapter covers, and anything \
             essential that is missing.",
            chapter.topic,
            headings.join("\n")
        );
        let result = self
            .router
            .generate_with_schema::<CriticalInfoCheck>(&prompt, TaskKind::QualityAssessment, 0.1)
            .await?;
        Ok(result.data)
    }
}

fn push_dimension_gap(gaps: &mut Vec<Gap>, dimension: GapDimension, score: f64) {
    let severity = if score < 0.3 {
        Severity::Critical
    } else if score < 0.5 {
        Severity::High
    } else if score < 0.7 {
        Severity::Medium
    } else if score < 0.85 {
        Severity::Low
    } else {
        return;
    };
    gaps.push(Gap {
        dimension,
        severity,
        description: format!("{dimension:?} scored {score:.2}"),
    });
}

/// Share of stage-2 category terms that the generated content addresses.
fn content_completeness(chapter: &Chapter) -> f64 {
    let Some(context) = chapter.research_context() else {
        return 0.0;
    };
    let terms: Vec<&String> = context.content_categories.values().flatten().collect();
    if terms.is_empty() {
        return 1.0;
    }
    let body: String = chapter
        .sections
        .iter()
        .map(|s| s.content.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    let covered = terms
        .iter()
        .filter(|term| body.contains(&term.to_lowercase()))
        .count();
    covered as f64 / terms.len() as f64
}

/// Fraction of high-value research sources actually cited by sections.
fn source_coverage(chapter: &Chapter) -> f64 {
    let research = chapter.research_sources();
    if research.is_empty() {
        return 1.0;
    }
    let cited: std::collections::HashSet<&str> = chapter
        .sections
        .iter()
        .flat_map(|s| s.source_ids.iter().map(|id| id.as_str()))
        .collect();
    let used = research
        .iter()
        .filter(|s| cited.contains(s.stable_id.as_str()))
        .count();
    used as f64 / research.len() as f64
}

/// 1 − coefficient of variation of section word counts, floored at zero.
fn section_balance(chapter: &Chapter) -> f64 {
    let counts: Vec<f64> = chapter
        .sections
        .iter()
        .map(|s| s.word_count as f64)
        .collect();
    if counts.len() < 2 {
        return 1.0;
    }
    let mean = counts.iter().sum::<f64>() / counts.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
    let cv = variance.sqrt() / mean;
    (1.0 - cv).max(0.0)
}

/// Share of bibliography citations from the recent sliding window.
fn temporal_coverage(chapter: &Chapter) -> f64 {
    let Some(StagePayload::CitationBuild(bibliography)) = chapter.payload(StageId::CitationBuild)
    else {
        return 0.0;
    };
    let years: Vec<i32> = bibliography
        .entries
        .iter()
        .filter_map(|e| e.source.year)
        .collect();
    if years.is_empty() {
        return 0.0;
    }
    let current_year = chrono::Utc::now().year();
    let recent = years
        .iter()
        .filter(|y| current_year - **y <= RECENT_WINDOW_YEARS)
        .count();
    recent as f64 / years.len() as f64
}

fn critical_info_score(check: &CriticalInfoCheck) -> f64 {
    let total = check.present.len() + check.missing.len();
    if total == 0 {
        return 1.0;
    }
    check.present.len() as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::{BreakerConfig, ScribeConfig};
    use crate::model::{
        Bibliography, BibliographyEntry, Section, SourceOrigin, SourceRef,
    };
    use crate::providers::Provider;
    use crate::providers::cost::CostLedger;
    use crate::providers::mock::{MockProvider, Scripted};
    use crate::schemas::{ConfidenceAssessment, ResearchContext};
    use crate::store::MemoryKeyValueStore;
    use chrono::Utc;

    fn analyzer(mock: Arc<MockProvider>) -> GapAnalyzer {
        let config = ScribeConfig::default_with_providers();
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryKeyValueStore::new()),
            BreakerConfig::default(),
        ));
        let router = Arc::new(ProviderRouter::new(
            vec![mock as Arc<dyn Provider>],
            &config,
            breaker,
            Arc::new(CostLedger::new()),
        ));
        GapAnalyzer::new(router, 0.75)
    }

    fn chapter_with_content() -> Chapter {
        let mut chapter = Chapter::new("user-1", "Glioblastoma surgical management");
        let mut categories = BTreeMap::new();
        categories.insert(
            "management".to_string(),
            vec!["resection".to_string(), "temozolomide".to_string()],
        );
        chapter.stage_payloads.insert(
            StageId::Context,
            StagePayload::Context(ResearchContext {
                research_gaps: vec![],
                key_references: vec![],
                content_categories: categories,
                confidence_assessment: ConfidenceAssessment {
                    overall_confidence: 0.8,
                },
                temporal_coverage: None,
                synonyms: vec![],
                vector_queries: vec![],
                external_queries: vec![],
                keyword_queries: vec![],
            }),
        );
        let source = SourceRef {
            origin: SourceOrigin::InternalDoc,
            stable_id: "doc-1".to_string(),
            title: "Internal doc".to_string(),
            authors: vec![],
            year: Some(Utc::now().year() - 1),
            abstract_text: None,
            relevance_score: 0.9,
            ai_relevance_score: None,
            embedding: None,
        };
        chapter.stage_payloads.insert(
            StageId::ResearchInternal,
            StagePayload::ResearchInternal(vec![source.clone()]),
        );
        chapter.stage_payloads.insert(
            StageId::CitationBuild,
            StagePayload::CitationBuild(Bibliography {
                entries: vec![BibliographyEntry {
                    number: 1,
                    source,
                    cited_by: vec![0, 1],
                }],
            }),
        );
        for i in 0..2 {
            let content = format!(
                "Maximal safe resection followed by temozolomide is standard; \
                 discussion block {i} continues with balanced length. {}",
                vec!["filler"; 100].join(" ")
            );
            chapter.sections.push(Section {
                index: i,
                title: format!("Section {i}"),
                word_count: Section::word_count_of(&content),
                content,
                source_ids: vec!["doc-1".to_string()],
                image_ids: vec![],
                generation_cost_usd: 0.0,
                generated_at: Utc::now(),
            });
        }
        chapter
    }

    #[tokio::test]
    async fn well_formed_chapter_needs_no_revision() {
        let mock = Arc::new(MockProvider::full("structura"));
        let analyzer = analyzer(mock);
        let report = analyzer.analyze(&chapter_with_content()).await.unwrap();
        assert!(report.completeness >= 0.75, "score was {}", report.completeness);
        assert!(!report.requires_revision);
        assert_eq!(report.dimension_scores.len(), 5);
    }

    #[tokio::test]
    async fn missing_critical_info_forces_revision() {
        let mock = Arc::new(MockProvider::full("structura"));
        mock.push_schema(Scripted::Json(serde_json::json!({
            "present": ["complication warnings"],
            "missing": ["contraindications"]
        })));
        let analyzer = analyzer(mock);
        let report = analyzer.analyze(&chapter_with_content()).await.unwrap();
        // One critical gap is enough, whatever the weighted score.
        assert!(report.requires_revision);
        assert!(
            report
                .gaps
                .iter()
                .any(|g| g.dimension == GapDimension::CriticalInformation
                    && g.severity == Severity::Critical)
        );
    }

    #[tokio::test]
    async fn uncited_sources_lower_source_coverage() {
        let mock = Arc::new(MockProvider::full("structura"));
        let analyzer = analyzer(mock);
        let mut chapter = chapter_with_content();
        for section in &mut chapter.sections {
            section.source_ids.clear();
        }
        let report = analyzer.analyze(&chapter).await.unwrap();
        assert_eq!(report.dimension_scores["source_coverage"], 0.0);
        assert!(report.requires_revision);
    }

    #[test]
    fn section_balance_penalizes_skew() {
        let mut chapter = Chapter::new("u", "t");
        for (i, words) in [100usize, 100, 100].iter().enumerate() {
            let content = vec!["w"; *words].join(" ");
            chapter.sections.push(Section {
                index: i,
                title: String::new(),
                word_count: Section::word_count_of(&content),
                content,
                source_ids: vec![],
                image_ids: vec![],
                generation_cost_usd: 0.0,
                generated_at: Utc::now(),
            });
        }
        let balanced = section_balance(&chapter);
        assert!((balanced - 1.0).abs() < 1e-9);

        chapter.sections[0].word_count = 1000;
        assert!(section_balance(&chapter) < balanced);
    }

    #[test]
    fn deductions_match_severity_weights() {
        assert_eq!(deduction(Severity::Critical), 0.15);
        assert_eq!(deduction(Severity::High), 0.08);
        assert_eq!(deduction(Severity::Medium), 0.04);
        assert_eq!(deduction(Severity::Low), 0.02);
    }
}
