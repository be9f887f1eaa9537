//! The fourteen stage bodies.
//!
//! Each body is a function from (chapter, context) to a typed stage
//! payload plus cost metadata; all persistence and event emission happens
//! in the runner. LLM-backed stages go through the router; the
//! deterministic stages (image integration, citation build, QA scoring,
//! formatting) touch no provider at all.

use futures::StreamExt;
use regex::Regex;

use crate::errors::StageError;
use crate::model::{
    Bibliography, BibliographyEntry, Chapter, ChapterStatus, ChapterVersion, FinalizeRecord,
    FormattingReport, ImagePlacement, ImagePlan, StageId, StagePayload,
};
use crate::providers::TaskKind;
use crate::quality::{FactChecker, compute_quality_scores};
use crate::schemas::{
    ChapterAnalysis, PlannedSection, ResearchContext, ReviewNotes, SynthesisPlan,
};

use super::context::{StageContext, StageOutput};
use super::sections;

/// Concurrent fact-check calls in flight.
const FACT_CHECK_CONCURRENCY: usize = 4;

/// Dispatch one stage body.
pub async fn execute_stage(
    stage: StageId,
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    match stage {
        StageId::InputValid => input_valid(chapter, ctx).await,
        StageId::Context => research_context(chapter, ctx).await,
        StageId::ResearchInternal => research_internal(chapter, ctx).await,
        StageId::ResearchExternal => research_external(chapter, ctx).await,
        StageId::SynthesisPlan => synthesis_plan(chapter, ctx).await,
        StageId::SectionGeneration => sections::generate_sections(chapter, ctx).await,
        StageId::ImageIntegration => image_integration(chapter, ctx),
        StageId::CitationBuild => citation_build(chapter),
        StageId::QaScoring => qa_scoring(chapter),
        StageId::FactCheck => fact_check(chapter, ctx).await,
        StageId::Formatting => formatting(chapter),
        StageId::Review => review(chapter, ctx).await,
        StageId::GapAnalysis => gap_analysis(chapter, ctx).await,
        StageId::Finalize => finalize(chapter, ctx),
    }
}

fn missing_payload(stage: StageId, needed: StageId) -> StageError {
    StageError::Integrity(format!(
        "stage {stage} requires the {needed} payload, which is absent"
    ))
}

// ── Stage 1: input_valid ─────────────────────────────────────────────

async fn input_valid(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let topic = chapter.topic.trim().to_string();
    if topic.chars().count() < 3 {
        return Err(StageError::InvalidInput {
            reason: "topic must be at least 3 characters".to_string(),
        });
    }

    let prompt = format!(
        "Topic: {topic}\n\nAnalyze this medical topic for reference-chapter \
         generation. Identify the primary concepts, classify the chapter \
         type, list 3-20 retrieval keywords, rate the complexity, and \
         estimate how many sections a complete chapter needs."
    );
    let result = ctx
        .deps
        .router
        .generate_with_schema::<ChapterAnalysis>(&prompt, TaskKind::MetadataExtraction, 0.2)
        .await?;

    chapter.title = topic;
    chapter.tags = result.data.keywords.clone();
    Ok(StageOutput {
        payload: StagePayload::InputValid(result.data),
        cost_usd: result.cost_usd,
        provider: Some(result.provider),
    })
}

// ── Stage 2: context ─────────────────────────────────────────────────

async fn research_context(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let analysis = chapter
        .analysis()
        .ok_or_else(|| missing_payload(StageId::Context, StageId::InputValid))?;

    let prompt = format!(
        "Topic: {}\nChapter type: {}\nPrimary concepts: {}\n\nBuild the \
         research context for this chapter: synonyms, vector search \
         queries, external bibliographic queries, keyword queries, the \
         entity categories the content must cover, known research gaps, \
         key references, and your confidence in the coverage.",
        chapter.topic,
        analysis.chapter_type.as_str(),
        analysis.primary_concepts.join(", "),
    );
    let result = ctx
        .deps
        .router
        .generate_with_schema::<ResearchContext>(&prompt, TaskKind::ResearchPlanning, 0.3)
        .await?;

    Ok(StageOutput {
        payload: StagePayload::Context(result.data),
        cost_usd: result.cost_usd,
        provider: Some(result.provider),
    })
}

// ── Stages 3 & 4: research ───────────────────────────────────────────

fn queries_or_topic(queries: &[String], topic: &str) -> Vec<String> {
    if queries.is_empty() {
        vec![topic.to_string()]
    } else {
        queries.to_vec()
    }
}

async fn research_internal(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let context = chapter
        .research_context()
        .ok_or_else(|| missing_payload(StageId::ResearchInternal, StageId::Context))?;
    let queries = queries_or_topic(&context.vector_queries, &chapter.topic);
    let sources = ctx.deps.research.search_internal(&queries).await?;
    tracing::info!(chapter_id = %chapter.id, count = sources.len(), "internal research complete");
    Ok(StageOutput::deterministic(StagePayload::ResearchInternal(
        sources,
    )))
}

async fn research_external(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let context = chapter
        .research_context()
        .ok_or_else(|| missing_payload(StageId::ResearchExternal, StageId::Context))?;
    let queries = queries_or_topic(&context.external_queries, &chapter.topic);
    let internal: Vec<crate::model::SourceRef> =
        match chapter.payload(StageId::ResearchInternal) {
            Some(StagePayload::ResearchInternal(refs)) => refs.clone(),
            _ => Vec::new(),
        };
    let sources = ctx
        .deps
        .research
        .search_external(&queries, &chapter.topic, &internal)
        .await?;
    tracing::info!(chapter_id = %chapter.id, count = sources.len(), "external research complete");
    Ok(StageOutput::deterministic(StagePayload::ResearchExternal(
        sources,
    )))
}

// ── Stage 5: synthesis_plan ──────────────────────────────────────────

async fn synthesis_plan(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let analysis = chapter
        .analysis()
        .ok_or_else(|| missing_payload(StageId::SynthesisPlan, StageId::InputValid))?;
    let (min_sections, max_sections) = analysis.chapter_type.section_bounds();
    let target = (analysis.estimated_section_count as usize).clamp(min_sections, max_sections);

    let sources = chapter.research_sources();
    let source_list: String = sources
        .iter()
        .map(|s| format!("- [{}] {}", s.stable_id, s.title))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Topic: {}\nChapter type: {}\n\nAvailable sources:\n{source_list}\n\n\
         Produce an ordered outline; plan exactly {target} sections. For \
         each section give a title, an estimated word count, and the ids \
         of the sources it should draw on.",
        chapter.topic,
        analysis.chapter_type.as_str(),
    );
    let result = ctx
        .deps
        .router
        .generate_with_schema::<SynthesisPlan>(&prompt, TaskKind::ResearchPlanning, 0.4)
        .await?;
    let mut plan = result.data;

    // Enforce the chapter-type bounds: truncate overlong plans, pad short
    // ones with generic closing sections.
    plan.sections.truncate(max_sections);
    let mut filler = 0;
    while plan.sections.len() < min_sections {
        filler += 1;
        plan.sections.push(PlannedSection {
            title: format!("Additional considerations {filler}"),
            estimated_words: 600,
            source_ids: Vec::new(),
        });
    }

    // Entries the planner left sourceless get research sources assigned
    // round-robin, so every section has something to cite.
    if !sources.is_empty() {
        let mut cursor = 0;
        for entry in plan.sections.iter_mut().filter(|e| e.source_ids.is_empty()) {
            for _ in 0..2 {
                entry.source_ids.push(sources[cursor % sources.len()].stable_id.clone());
                cursor += 1;
            }
            entry.source_ids.dedup();
        }
    }

    Ok(StageOutput {
        payload: StagePayload::SynthesisPlan(plan),
        cost_usd: result.cost_usd,
        provider: Some(result.provider),
    })
}

// ── Stage 7: image_integration (deterministic) ───────────────────────

fn image_integration(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let internal_ids: std::collections::HashSet<String> =
        match chapter.payload(StageId::ResearchInternal) {
            Some(StagePayload::ResearchInternal(refs)) => {
                refs.iter().map(|r| r.stable_id.clone()).collect()
            }
            _ => Default::default(),
        };

    let mut placements: Vec<ImagePlacement> = Vec::new();
    let mut placed: std::collections::HashSet<String> = Default::default();
    for section in &chapter.sections {
        for source_id in &section.source_ids {
            if !internal_ids.contains(source_id) {
                continue;
            }
            let images = ctx.deps.with_store(|store| store.top_images(source_id, 1))?;
            for image in images {
                if placed.insert(image.id.clone()) {
                    placements.push(ImagePlacement {
                        section_index: section.index,
                        image_id: image.id,
                        document_id: source_id.clone(),
                        caption: image
                            .analysis
                            .map(|a| a.description)
                            .unwrap_or_else(|| "Figure".to_string()),
                    });
                }
            }
        }
    }

    for placement in &placements {
        if let Some(section) = chapter
            .sections
            .iter_mut()
            .find(|s| s.index == placement.section_index)
        {
            section.image_ids.push(placement.image_id.clone());
        }
    }

    Ok(StageOutput::deterministic(StagePayload::ImageIntegration(
        ImagePlan { placements },
    )))
}

// ── Stage 8: citation_build (deterministic) ──────────────────────────

fn citation_build(chapter: &mut Chapter) -> Result<StageOutput, StageError> {
    let sources_by_id: std::collections::HashMap<&str, &crate::model::SourceRef> = chapter
        .research_sources()
        .into_iter()
        .map(|s| (s.stable_id.as_str(), s))
        .collect();

    let mut entries: Vec<BibliographyEntry> = Vec::new();
    let mut numbers: std::collections::HashMap<String, usize> = Default::default();
    for section in &chapter.sections {
        for source_id in &section.source_ids {
            let Some(source) = sources_by_id.get(source_id.as_str()) else {
                continue;
            };
            let number = *numbers.entry(source_id.clone()).or_insert_with(|| {
                entries.push(BibliographyEntry {
                    number: entries.len() + 1,
                    source: (*source).clone(),
                    cited_by: Vec::new(),
                });
                entries.len()
            });
            let cited_by = &mut entries[number - 1].cited_by;
            if cited_by.last() != Some(&section.index) {
                cited_by.push(section.index);
            }
        }
    }

    Ok(StageOutput::deterministic(StagePayload::CitationBuild(
        Bibliography { entries },
    )))
}

// ── Stage 9: qa_scoring (deterministic) ──────────────────────────────

fn qa_scoring(chapter: &mut Chapter) -> Result<StageOutput, StageError> {
    let plan = chapter
        .outline()
        .ok_or_else(|| missing_payload(StageId::QaScoring, StageId::SynthesisPlan))?;
    let bibliography = match chapter.payload(StageId::CitationBuild) {
        Some(StagePayload::CitationBuild(b)) => b.clone(),
        _ => return Err(missing_payload(StageId::QaScoring, StageId::CitationBuild)),
    };
    let scores = compute_quality_scores(&chapter.sections, plan, &bibliography);
    chapter.quality = scores;
    Ok(StageOutput::deterministic(StagePayload::QaScoring(scores)))
}

// ── Stage 10: fact_check ─────────────────────────────────────────────

async fn fact_check(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let (section_checks, cost_usd) = {
        let sources = chapter.research_sources();
        let checks: Vec<Result<(crate::schemas::FactCheck, f64), StageError>> =
            futures::stream::iter(chapter.sections.iter().map(|section| {
                let checker = &ctx.deps.fact_checker;
                let sources = &sources;
                async move { checker.check_section(section, sources).await }
            }))
            .buffered(FACT_CHECK_CONCURRENCY)
            .collect()
            .await;

        let mut section_checks = Vec::with_capacity(checks.len());
        let mut cost_usd = 0.0;
        for check in checks {
            let (check, cost) = check?;
            section_checks.push(check);
            cost_usd += cost;
        }
        (section_checks, cost_usd)
    };

    let verdict = FactChecker::aggregate(section_checks);
    chapter.fact_check_passed = Some(verdict.passed);
    tracing::info!(
        chapter_id = %chapter.id,
        passed = verdict.passed,
        accuracy = verdict.overall_accuracy,
        "fact check aggregated"
    );
    Ok(StageOutput {
        payload: StagePayload::FactCheck(verdict),
        cost_usd,
        provider: None,
    })
}

// ── Stage 11: formatting (deterministic) ─────────────────────────────

/// Convert a title to a URL-safe anchor slug.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

fn formatting(chapter: &mut Chapter) -> Result<StageOutput, StageError> {
    let whitespace = Regex::new(r"\s+").expect("static regex");
    let mut report = FormattingReport::default();

    for section in &mut chapter.sections {
        let normalized = whitespace
            .replace_all(section.title.trim().trim_start_matches('#').trim(), " ")
            .to_string();
        if normalized != section.title {
            report.headings_normalized += 1;
            section.title = normalized;
        }
        report.anchors.push(slugify(&section.title, 80));

        // Markdown table rows must be pipe-terminated.
        if section.content.lines().any(|l| l.trim_start().starts_with('|')) {
            let fixed: Vec<String> = section
                .content
                .lines()
                .map(|line| {
                    let trimmed = line.trim_end();
                    if trimmed.trim_start().starts_with('|') && !trimmed.ends_with('|') {
                        report.tables_normalized += 1;
                        format!("{trimmed} |")
                    } else {
                        line.to_string()
                    }
                })
                .collect();
            section.content = fixed.join("\n");
        }
    }

    Ok(StageOutput::deterministic(StagePayload::Formatting(report)))
}

// ── Stage 12: review (recorded, never applied) ───────────────────────

async fn review(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let headings: Vec<String> = chapter
        .sections
        .iter()
        .map(|s| format!("{}. {}", s.index + 1, s.title))
        .collect();
    let prompt = format!(
        "Topic: {}\n\nChapter outline as generated:\n{}\n\nSuggest \
         improvements: structural issues, missing emphasis, ordering \
         problems. Suggestions are advisory and will not be applied \
         automatically.",
        chapter.topic,
        headings.join("\n"),
    );
    let result = ctx
        .deps
        .router
        .generate_with_schema::<ReviewNotes>(&prompt, TaskKind::Review, 0.4)
        .await?;
    Ok(StageOutput {
        payload: StagePayload::Review(result.data),
        cost_usd: result.cost_usd,
        provider: Some(result.provider),
    })
}

// ── Stage 13: gap_analysis ───────────────────────────────────────────

async fn gap_analysis(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let report = ctx.deps.gap_analyzer.analyze(chapter).await?;
    chapter.completeness = Some(report.completeness);
    chapter.requires_revision = report.requires_revision;
    ctx.deps
        .with_store(|store| store.insert_gap_analysis(chapter.id, &report))?;
    Ok(StageOutput::deterministic(StagePayload::GapAnalysis(report)))
}

// ── Stage 14: finalize ───────────────────────────────────────────────

fn finalize(chapter: &mut Chapter, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    if ctx.deps.config.pipeline.block_on_fact_check_failure
        && chapter.fact_check_passed == Some(false)
    {
        return Err(StageError::Integrity(
            "fact check failed and completion is configured to block".to_string(),
        ));
    }

    chapter.version += 1;
    chapter.status = ChapterStatus::Completed;

    let snapshot = ChapterVersion {
        chapter_id: chapter.id,
        version: chapter.version,
        title: chapter.title.clone(),
        sections: chapter.sections.clone(),
        summary: chapter.summary.clone(),
        is_current: true,
        created_by: chapter.owner_id.clone(),
        created_at: chrono::Utc::now(),
    };
    {
        let mut store = ctx.deps.store.lock().expect("chapter store lock poisoned");
        store.create_version(&snapshot).map_err(StageError::Store)?;
    }

    Ok(StageOutput::deterministic(StagePayload::Finalize(
        FinalizeRecord {
            version: chapter.version,
            completed_at: chrono::Utc::now(),
            total_cost_usd: chapter.total_cost_usd,
        },
    )))
}
