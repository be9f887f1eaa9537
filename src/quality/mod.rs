//! Quality subsystems: deterministic QA scoring, the fact checker, and the
//! five-dimension gap analyzer.

pub mod factcheck;
pub mod gap;
pub mod scoring;

pub use factcheck::FactChecker;
pub use gap::GapAnalyzer;
pub use scoring::compute_quality_scores;
