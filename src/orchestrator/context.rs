//! Stage execution context: the handles every stage body receives.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::config::ScribeConfig;
use crate::dlq::DeadLetterQueue;
use crate::errors::{StageError, StoreError};
use crate::model::StagePayload;
use crate::progress::ProgressHub;
use crate::providers::ProviderRouter;
use crate::quality::{FactChecker, GapAnalyzer};
use crate::research::ResearchLayer;
use crate::store::{ChapterStore, KeyValueStore};

/// Long-lived dependencies shared by every chapter run. Injected once at
/// process boundary; nothing here is a global.
pub struct StageDeps {
    pub config: ScribeConfig,
    pub router: Arc<ProviderRouter>,
    pub research: Arc<ResearchLayer>,
    pub store: Arc<Mutex<ChapterStore>>,
    pub kv: Arc<dyn KeyValueStore>,
    pub dlq: Arc<DeadLetterQueue>,
    pub progress: Arc<ProgressHub>,
    pub fact_checker: FactChecker,
    pub gap_analyzer: GapAnalyzer,
}

impl StageDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScribeConfig,
        router: Arc<ProviderRouter>,
        research: Arc<ResearchLayer>,
        store: Arc<Mutex<ChapterStore>>,
        kv: Arc<dyn KeyValueStore>,
        dlq: Arc<DeadLetterQueue>,
        progress: Arc<ProgressHub>,
    ) -> Self {
        let fact_checker = FactChecker::new(router.clone());
        let gap_analyzer =
            GapAnalyzer::new(router.clone(), config.pipeline.gap_revision_threshold);
        Self {
            config,
            router,
            research,
            store,
            kv,
            dlq,
            progress,
            fact_checker,
            gap_analyzer,
        }
    }

    /// Run a closure against the relational store under its lock.
    pub fn with_store<T>(
        &self,
        f: impl FnOnce(&ChapterStore) -> Result<T, StoreError>,
    ) -> Result<T, StageError> {
        let store = self.store.lock().expect("chapter store lock poisoned");
        f(&store).map_err(StageError::Store)
    }
}

/// Per-run context handed to stage bodies.
pub struct StageContext<'a> {
    pub deps: &'a StageDeps,
    pub cancel: &'a CancellationToken,
    pub checkpoint: &'a Checkpoint,
}

/// What one completed stage hands back to the runner.
pub struct StageOutput {
    pub payload: StagePayload,
    pub cost_usd: f64,
    /// Provider that served the stage's dominant call, for checkpoint
    /// metadata; deterministic stages have none.
    pub provider: Option<String>,
}

impl StageOutput {
    pub fn deterministic(payload: StagePayload) -> Self {
        Self {
            payload,
            cost_usd: 0.0,
            provider: None,
        }
    }
}
