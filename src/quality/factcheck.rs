//! Fact checking: extract claims from each section and verify them against
//! the chapter's research sources through a schema-constrained call.

use std::sync::Arc;

use crate::errors::StageError;
use crate::model::{FactCheckVerdict, Section, SourceRef};
use crate::providers::{ProviderRouter, TaskKind};
use crate::schemas::{FactCheck, Severity};

/// Chapter passes outright at or above this accuracy.
const PASS_ACCURACY: f64 = 0.90;
/// Lower accuracy bar that still passes when no critical claim failed.
const SOFT_PASS_ACCURACY: f64 = 0.80;
/// More critical issues than this always fails.
const MAX_CRITICAL_ISSUES: usize = 2;

pub struct FactChecker {
    router: Arc<ProviderRouter>,
}

impl FactChecker {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }

    /// Claim extraction + verification for one section. Returns the check
    /// and the call's cost for stage accounting.
    pub async fn check_section(
        &self,
        section: &Section,
        sources: &[&SourceRef],
    ) -> Result<(FactCheck, f64), StageError> {
        let prompt = section_prompt(section, sources);
        let result = self
            .router
            .generate_with_schema::<FactCheck>(&prompt, TaskKind::FactChecking, 0.1)
            .await?;
        Ok((result.data, result.cost_usd))
    }

    /// Aggregate per-section checks into the chapter verdict.
    ///
    /// Pass iff (accuracy ≥ 0.90 OR (accuracy ≥ 0.80 AND no critical
    /// unverified claim)) AND total critical issues ≤ 2. A failed verdict
    /// is fail-soft unless configuration says otherwise; the caller
    /// records it and continues.
    pub fn aggregate(section_checks: Vec<FactCheck>) -> FactCheckVerdict {
        let total_claims: usize = section_checks.iter().map(|c| c.claims.len()).sum();
        let verified: usize = section_checks
            .iter()
            .flat_map(|c| &c.claims)
            .filter(|claim| claim.verified)
            .count();
        // A chapter with no extractable claims has nothing contradicted.
        let overall_accuracy = if total_claims == 0 {
            1.0
        } else {
            verified as f64 / total_claims as f64
        };

        let critical_unverified = section_checks
            .iter()
            .flat_map(|c| &c.claims)
            .any(|claim| !claim.verified && claim.severity_if_wrong == Severity::Critical);
        let critical_issue_count: usize =
            section_checks.iter().map(|c| c.critical_issues.len()).sum();

        let accuracy_ok = overall_accuracy >= PASS_ACCURACY
            || (overall_accuracy >= SOFT_PASS_ACCURACY && !critical_unverified);
        let passed = accuracy_ok && critical_issue_count <= MAX_CRITICAL_ISSUES;

        FactCheckVerdict {
            passed,
            overall_accuracy,
            critical_issue_count,
            sections: section_checks,
        }
    }
}

fn section_prompt(section: &Section, sources: &[&SourceRef]) -> String {
    let mut prompt = format!(
        "Extract the factual claims from the following section and verify \
         each against the listed sources.\n\nSection: {}\n\n{}\n\nSources:\n",
        section.title, section.content
    );
    for source in sources {
        prompt.push_str(&format!("- [{}] {}", source.stable_id, source.title));
        if let Some(year) = source.year {
            prompt.push_str(&format!(" ({year})"));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "\nFor each claim report whether it is verified, your confidence, \
         the supporting source id if any, its category, and how severe an \
         error would be if the claim were wrong.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{ClaimCategory, ClaimRecord};

    fn claim(verified: bool, severity: Severity) -> ClaimRecord {
        ClaimRecord {
            claim: "claim text".to_string(),
            verified,
            confidence: 0.9,
            source_id: None,
            category: ClaimCategory::Treatment,
            severity_if_wrong: severity,
            notes: None,
        }
    }

    fn check(claims: Vec<ClaimRecord>, critical_issues: Vec<String>) -> FactCheck {
        let unverified_count = claims.iter().filter(|c| !c.verified).count() as u32;
        FactCheck {
            overall_accuracy: 0.0, // per-section figure unused by aggregate
            claims,
            unverified_count,
            critical_issues,
            recommendations: vec![],
        }
    }

    #[test]
    fn high_accuracy_passes() {
        let checks = vec![check(
            vec![
                claim(true, Severity::High),
                claim(true, Severity::Medium),
                claim(true, Severity::Low),
                claim(true, Severity::Low),
                claim(true, Severity::Low),
                claim(true, Severity::Low),
                claim(true, Severity::Low),
                claim(true, Severity::Low),
                claim(true, Severity::Low),
                claim(false, Severity::Low),
            ],
            vec![],
        )];
        let verdict = FactChecker::aggregate(checks);
        assert!((verdict.overall_accuracy - 0.9).abs() < 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn moderate_accuracy_passes_only_without_critical_failures() {
        let base = vec![
            claim(true, Severity::Low),
            claim(true, Severity::Low),
            claim(true, Severity::Low),
            claim(true, Severity::Low),
            claim(false, Severity::Medium),
        ];
        // 0.8 accuracy, no critical unverified: pass.
        let verdict = FactChecker::aggregate(vec![check(base.clone(), vec![])]);
        assert!((verdict.overall_accuracy - 0.8).abs() < 1e-9);
        assert!(verdict.passed);

        // Same accuracy but the failure is critical: fail.
        let mut with_critical = base;
        with_critical[4] = claim(false, Severity::Critical);
        let verdict = FactChecker::aggregate(vec![check(with_critical, vec![])]);
        assert!(!verdict.passed);
    }

    #[test]
    fn too_many_critical_issues_fails_regardless_of_accuracy() {
        let checks = vec![check(
            vec![claim(true, Severity::Low)],
            vec![
                "missing contraindication".to_string(),
                "dosing conflict".to_string(),
                "laterality error".to_string(),
            ],
        )];
        let verdict = FactChecker::aggregate(checks);
        assert_eq!(verdict.overall_accuracy, 1.0);
        assert_eq!(verdict.critical_issue_count, 3);
        assert!(!verdict.passed);
    }

    #[test]
    fn no_claims_counts_as_fully_accurate() {
        let verdict = FactChecker::aggregate(vec![check(vec![], vec![])]);
        assert_eq!(verdict.overall_accuracy, 1.0);
        assert!(verdict.passed);
    }

    #[test]
    fn aggregation_spans_sections() {
        let checks = vec![
            check(vec![claim(true, Severity::Low), claim(true, Severity::Low)], vec![]),
            check(vec![claim(false, Severity::Low), claim(true, Severity::Low)], vec![]),
        ];
        let verdict = FactChecker::aggregate(checks);
        assert!((verdict.overall_accuracy - 0.75).abs() < 1e-9);
        assert_eq!(verdict.sections.len(), 2);
    }
}
