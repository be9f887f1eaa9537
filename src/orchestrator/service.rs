//! The orchestrator's public API: start, inspect, cancel, and section
//! regeneration. The REST layer and the CLI call straight into this.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{StageError, StoreError};
use crate::model::{Chapter, ChapterStatus, ChapterVersion, Section, SourceRef};
use crate::progress::{ProgressEvent, ProgressHub};
use crate::providers::TaskKind;

use super::context::StageDeps;
use super::runner::ChapterRunner;

/// Options accepted at submission time.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GenerationOptions {
    /// Extra tags attached to the chapter on creation.
    #[serde(default)]
    pub tags: Vec<String>,
}

pub struct GenerationService {
    deps: Arc<StageDeps>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl GenerationService {
    pub fn new(deps: Arc<StageDeps>) -> Arc<Self> {
        Arc::new(Self {
            deps,
            running: Arc::new(DashMap::new()),
        })
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.deps.progress
    }

    /// Create a chapter and start its run in the background. Returns the
    /// chapter id before generation completes.
    pub fn start_generation(
        &self,
        user_id: &str,
        topic: &str,
        options: GenerationOptions,
    ) -> Result<Uuid, StageError> {
        let mut chapter = Chapter::new(user_id, topic);
        chapter.tags = options.tags;
        let chapter_id = chapter.id;
        self.deps
            .with_store(|store| store.create_chapter(&chapter))?;

        let cancel = CancellationToken::new();
        self.running.insert(chapter_id, cancel.clone());

        let deps = self.deps.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let runner = ChapterRunner::new(deps);
            if let Err(err) = runner.run(chapter_id, cancel).await {
                tracing::warn!(chapter_id = %chapter_id, error = %err, "chapter run ended in failure");
            }
            running.remove(&chapter_id);
        });

        Ok(chapter_id)
    }

    pub fn get_chapter(&self, chapter_id: Uuid) -> Result<Chapter, StageError> {
        self.deps
            .with_store(|store| store.get_chapter(chapter_id))?
            .ok_or(StageError::Store(StoreError::NotFound {
                entity: "chapter",
                id: chapter_id.to_string(),
            }))
    }

    pub fn get_versions(&self, chapter_id: Uuid) -> Result<Vec<ChapterVersion>, StageError> {
        self.deps
            .with_store(|store| store.list_versions(chapter_id))
    }

    /// Cooperative cancel. Closing a progress subscription does NOT reach
    /// here; this is the only cancellation path.
    pub fn cancel(&self, chapter_id: Uuid) -> Result<(), StageError> {
        match self.running.get(&chapter_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(StageError::InvalidInput {
                reason: format!("chapter {chapter_id} has no active run"),
            }),
        }
    }

    pub fn is_running(&self, chapter_id: Uuid) -> bool {
        self.running.contains_key(&chapter_id)
    }

    /// Regenerate a single section of a completed chapter, reusing the
    /// persisted research and outline payloads (stages 3–5) and bumping
    /// the version with a fresh snapshot.
    pub async fn regenerate_section(
        &self,
        chapter_id: Uuid,
        section_number: usize,
        added_sources: Vec<SourceRef>,
        instructions: Option<String>,
    ) -> Result<u32, StageError> {
        let mut chapter = self.get_chapter(chapter_id)?;
        if chapter.status != ChapterStatus::Completed {
            return Err(StageError::InvalidInput {
                reason: "only completed chapters can be regenerated".to_string(),
            });
        }
        let plan = chapter
            .outline()
            .ok_or_else(|| StageError::Integrity("chapter has no synthesis plan".to_string()))?;
        let entry = plan
            .sections
            .get(section_number)
            .ok_or_else(|| StageError::InvalidInput {
                reason: format!("section {section_number} is out of range"),
            })?
            .clone();

        let mut sources: BTreeMap<String, SourceRef> = chapter
            .research_sources()
            .into_iter()
            .map(|s| (s.stable_id.clone(), s.clone()))
            .collect();
        for source in added_sources {
            sources.insert(source.stable_id.clone(), source);
        }

        let mut source_block = String::new();
        let mut source_ids: Vec<String> = entry.source_ids.clone();
        for source in sources.values() {
            if !source_ids.contains(&source.stable_id) && source.ai_relevance_score.is_some() {
                source_ids.push(source.stable_id.clone());
            }
        }
        for source_id in &source_ids {
            if let Some(source) = sources.get(source_id) {
                source_block.push_str(&format!("- [{}] {}\n", source.stable_id, source.title));
            }
        }

        let mut prompt = format!(
            "Chapter topic: {}\nSection title: {}\nTarget length: about {} words\n\n\
             Sources to draw on:\n{source_block}\n\
             Rewrite this section of the reference chapter. Cite the listed \
             sources by id in square brackets where they support a statement.",
            chapter.topic, entry.title, entry.estimated_words,
        );
        if let Some(instructions) = instructions {
            prompt.push_str(&format!("\n\nAdditional instructions: {instructions}"));
        }

        let result = self
            .deps
            .router
            .generate_text(
                &prompt,
                TaskKind::ContentGeneration,
                Some("You are revising one section of a rigorous, citation-backed surgical reference chapter."),
                (entry.estimated_words * 2).clamp(512, 4096),
                0.7,
            )
            .await?;

        let section = Section {
            index: section_number,
            title: entry.title.clone(),
            word_count: Section::word_count_of(&result.text),
            content: result.text,
            source_ids,
            image_ids: Vec::new(),
            generation_cost_usd: result.cost_usd,
            generated_at: chrono::Utc::now(),
        };
        match chapter
            .sections
            .iter_mut()
            .find(|s| s.index == section_number)
        {
            Some(existing) => *existing = section.clone(),
            None => {
                chapter.sections.push(section.clone());
                chapter.sections.sort_by_key(|s| s.index);
            }
        }

        chapter.total_cost_usd += section.generation_cost_usd;
        chapter.version += 1;
        self.deps.with_store(|store| store.save_chapter(&chapter))?;
        {
            let mut store = self.deps.store.lock().expect("chapter store lock poisoned");
            store
                .create_version(&ChapterVersion {
                    chapter_id: chapter.id,
                    version: chapter.version,
                    title: chapter.title.clone(),
                    sections: chapter.sections.clone(),
                    summary: chapter.summary.clone(),
                    is_current: true,
                    created_by: chapter.owner_id.clone(),
                    created_at: chrono::Utc::now(),
                })
                .map_err(StageError::Store)?;
        }

        let total = chapter
            .outline()
            .map(|p| p.sections.len())
            .unwrap_or(chapter.sections.len());
        self.deps.progress.publish(ProgressEvent::section_ready(
            chapter.id,
            section_number,
            &section.title,
            &section.content,
            total,
        ));

        Ok(chapter.version)
    }

    /// Read access for the WS layer and tests.
    pub fn subscribe(&self, chapter_id: Uuid) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.deps.progress.subscribe(chapter_id)
    }

    /// Ownership check used by the thin HTTP surface.
    pub fn owned_by(&self, chapter: &Chapter, user_id: &str) -> bool {
        chapter.owner_id == user_id
    }
}
