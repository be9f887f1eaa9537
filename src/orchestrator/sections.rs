//! Section generation: batched parallel execution of section bodies.
//!
//! The outline is partitioned into batches; each batch's bodies run
//! concurrently under one cancellation token with per-task deadlines.
//! `section_ready` events fire in completion order, but sections are
//! persisted in outline order, and each persisted section gets its own
//! checkpoint step so a resumed run never regenerates it. When any body
//! in a batch fails, its successful siblings are persisted and
//! checkpointed before the stage reports failure.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::{ProviderError, StageError};
use crate::model::{Chapter, Section, SectionGenSummary, SourceRef, StagePayload};
use crate::progress::ProgressEvent;
use crate::providers::TaskKind;
use crate::schemas::PlannedSection;

use super::context::{StageContext, StageOutput};

fn section_step(index: usize) -> String {
    format!("section:{index}")
}

pub async fn generate_sections(
    chapter: &mut Chapter,
    ctx: &StageContext<'_>,
) -> Result<StageOutput, StageError> {
    let plan = chapter
        .outline()
        .ok_or_else(|| {
            StageError::Integrity(
                "section generation requires the synthesis_plan payload".to_string(),
            )
        })?
        .clone();
    let total = plan.sections.len();

    let sources: BTreeMap<String, SourceRef> = chapter
        .research_sources()
        .into_iter()
        .map(|s| (s.stable_id.clone(), s.clone()))
        .collect();

    // Resume support: sections checkpointed by a previous attempt are
    // reused as-is from the persisted chapter.
    let mut done: BTreeMap<usize, Section> =
        chapter.sections.drain(..).map(|s| (s.index, s)).collect();
    let mut pending: Vec<(usize, PlannedSection)> = Vec::new();
    for (index, entry) in plan.sections.iter().enumerate() {
        let checkpointed = ctx.checkpoint.is_step_complete(&section_step(index)).await?;
        if !(checkpointed && done.contains_key(&index)) {
            done.remove(&index);
            pending.push((index, entry.clone()));
        }
    }

    let batch_size = if ctx.deps.config.pipeline.parallel_section_generation {
        ctx.deps.config.pipeline.section_generation_batch_size.max(1)
    } else {
        1
    };
    let deadline = Duration::from_secs(ctx.deps.config.pipeline.stage_deadline_secs);

    let mut generated = 0usize;
    let mut cost_usd = 0.0f64;
    let mut failure: Option<StageError> = None;

    'batches: for batch in pending.chunks(batch_size) {
        if ctx.cancel.is_cancelled() {
            failure = Some(StageError::Cancelled);
            break;
        }

        let bodies = batch.iter().map(|(index, entry)| {
            generate_one(chapter, ctx, *index, entry, &sources, total, deadline)
        });
        let results: Vec<(usize, Result<Section, StageError>)> = join_all(bodies).await;

        // Persist this batch's successes in outline order before
        // surfacing any failure, so resumption skips them.
        let mut new_sections = Vec::new();
        for (index, result) in results {
            match result {
                Ok(section) => new_sections.push((index, section)),
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }
        for (index, section) in new_sections {
            generated += 1;
            cost_usd += section.generation_cost_usd;
            done.insert(index, section);
        }

        chapter.sections = done.values().cloned().collect();
        ctx.deps.with_store(|store| store.save_chapter(chapter))?;
        for (index, section) in &done {
            if !ctx.checkpoint.is_step_complete(&section_step(*index)).await? {
                let mut metadata = BTreeMap::new();
                metadata.insert(
                    "cost_usd".to_string(),
                    serde_json::json!(section.generation_cost_usd),
                );
                ctx.checkpoint
                    .mark_step_complete(&section_step(*index), Some(metadata))
                    .await?;
            }
        }

        if failure.is_some() {
            break 'batches;
        }
    }

    // Leave `done` materialized on the chapter whatever happened.
    chapter.sections = done.into_values().collect();

    if let Some(err) = failure {
        return Err(err);
    }

    let total_words = chapter.sections.iter().map(|s| s.word_count).sum();
    Ok(StageOutput {
        payload: StagePayload::SectionGeneration(SectionGenSummary {
            sections_generated: generated,
            total_words,
            total_cost_usd: cost_usd,
        }),
        cost_usd,
        provider: None,
    })
}

/// One section body: prompt from the outline entry + its selected
/// sources, a routed content-generation call, and a `section_ready`
/// event on completion.
async fn generate_one(
    chapter: &Chapter,
    ctx: &StageContext<'_>,
    index: usize,
    entry: &PlannedSection,
    sources: &BTreeMap<String, SourceRef>,
    total: usize,
    deadline: Duration,
) -> (usize, Result<Section, StageError>) {
    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => Err(StageError::Cancelled),
        result = tokio::time::timeout(
            deadline,
            call_provider(chapter, ctx, entry, sources),
        ) => match result {
            Ok(inner) => inner,
            Err(_) => Err(StageError::Provider(ProviderError::Transient {
                message: format!("section {index} exceeded its deadline"),
            })),
        },
    };

    let result = result.map(|(content, cost_usd)| {
        let section = Section {
            index,
            title: entry.title.clone(),
            word_count: Section::word_count_of(&content),
            content,
            source_ids: entry.source_ids.clone(),
            image_ids: Vec::new(),
            generation_cost_usd: cost_usd,
            generated_at: chrono::Utc::now(),
        };
        ctx.deps.progress.publish(ProgressEvent::section_ready(
            chapter.id,
            index,
            &section.title,
            &section.content,
            total,
        ));
        section
    });
    (index, result)
}

async fn call_provider(
    chapter: &Chapter,
    ctx: &StageContext<'_>,
    entry: &PlannedSection,
    sources: &BTreeMap<String, SourceRef>,
) -> Result<(String, f64), StageError> {
    let mut source_block = String::new();
    for source_id in &entry.source_ids {
        if let Some(source) = sources.get(source_id) {
            source_block.push_str(&format!("- [{}] {}", source.stable_id, source.title));
            if let Some(year) = source.year {
                source_block.push_str(&format!(" ({year})"));
            }
            source_block.push('\n');
        }
    }

    let prompt = format!(
        "Chapter topic: {}\nSection title: {}\nTarget length: about {} words\n\n\
         Sources to draw on:\n{source_block}\n\
         Write this section of the reference chapter. Cite the listed \
         sources by id in square brackets where they support a statement.",
        chapter.topic, entry.title, entry.estimated_words,
    );
    let max_tokens = (entry.estimated_words * 2).clamp(512, 4096);
    let result = ctx
        .deps
        .router
        .generate_text(
            &prompt,
            TaskKind::ContentGeneration,
            Some("You are writing one section of a rigorous, citation-backed surgical reference chapter."),
            max_tokens,
            0.7,
        )
        .await?;
    Ok((result.text, result.cost_usd))
}
