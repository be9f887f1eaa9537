//! Deterministic quality scalars. No LLM involvement: every score is a
//! pure function of the persisted sections, outline, and bibliography.

use chrono::Datelike;

use crate::model::{Bibliography, QualityScores, Section};
use crate::schemas::SynthesisPlan;

/// Citations per 1000 words at which the evidence score saturates.
const EVIDENCE_SATURATION: f64 = 10.0;
/// Currency decay per year of mean citation age.
const CURRENCY_DECAY: f64 = 0.05;

/// Compute the four QA scalars:
/// depth    = min(1, mean_section_words / target_words)
/// coverage = addressed_sections / planned_sections
/// evidence = min(1, citations_per_1000_words / 10)
/// currency = max(0, 1 − 0.05·mean_citation_age_years)
pub fn compute_quality_scores(
    sections: &[Section],
    plan: &SynthesisPlan,
    bibliography: &Bibliography,
) -> QualityScores {
    let current_year = chrono::Utc::now().year();
    QualityScores {
        depth: depth_score(sections, plan),
        coverage: coverage_score(sections, plan),
        evidence: evidence_score(sections, bibliography),
        currency: currency_score(bibliography, current_year),
    }
}

fn depth_score(sections: &[Section], plan: &SynthesisPlan) -> f64 {
    if sections.is_empty() {
        return 0.0;
    }
    if plan.sections.is_empty() {
        return 0.0;
    }
    let mean_words =
        sections.iter().map(|s| s.word_count).sum::<usize>() as f64 / sections.len() as f64;
    let target_words = plan
        .sections
        .iter()
        .map(|s| s.estimated_words as f64)
        .sum::<f64>()
        / plan.sections.len() as f64;
    if target_words <= 0.0 {
        return 0.0;
    }
    (mean_words / target_words).min(1.0)
}

fn coverage_score(sections: &[Section], plan: &SynthesisPlan) -> f64 {
    if plan.sections.is_empty() {
        return 0.0;
    }
    let addressed = sections.iter().filter(|s| !s.content.trim().is_empty()).count();
    (addressed as f64 / plan.sections.len() as f64).min(1.0)
}

fn evidence_score(sections: &[Section], bibliography: &Bibliography) -> f64 {
    let total_words: usize = sections.iter().map(|s| s.word_count).sum();
    if total_words == 0 {
        return 0.0;
    }
    // Each back-reference counts as one citation occurrence.
    let citations: usize = bibliography.entries.iter().map(|e| e.cited_by.len()).sum();
    let per_1000 = citations as f64 / (total_words as f64 / 1000.0);
    (per_1000 / EVIDENCE_SATURATION).min(1.0)
}

fn currency_score(bibliography: &Bibliography, current_year: i32) -> f64 {
    let years: Vec<i32> = bibliography
        .entries
        .iter()
        .filter_map(|e| e.source.year)
        .collect();
    if years.is_empty() {
        return 0.0;
    }
    let mean_age = years
        .iter()
        .map(|y| (current_year - y).max(0) as f64)
        .sum::<f64>()
        / years.len() as f64;
    (1.0 - CURRENCY_DECAY * mean_age).max(0.0)
}
