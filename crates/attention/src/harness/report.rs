//! Case outcomes and the markdown summaries written after a run.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use super::cases::Suite;
use super::tolerance::Metric;
use crate::core::{AttentionError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Passed,
    Failed { reasons: Vec<String> },
    Skipped { reason: String },
}

impl CaseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CaseOutcome::Passed => "pass",
            CaseOutcome::Failed { .. } => "FAIL",
            CaseOutcome::Skipped { .. } => "skip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub label: String,
    pub outcome: CaseOutcome,
    pub metrics: Vec<Metric>,
    /// Informational findings that do not fail the case.
    pub notes: Vec<String>,
}

impl CaseReport {
    pub fn skipped(label: String, reason: String) -> Self {
        Self {
            label,
            outcome: CaseOutcome::Skipped { reason },
            metrics: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Derive the outcome from the metrics plus any extra failure reasons.
    pub fn judged(label: String, metrics: Vec<Metric>, mut reasons: Vec<String>) -> Self {
        reasons.extend(metrics.iter().filter_map(Metric::failure));
        let outcome = if reasons.is_empty() {
            CaseOutcome::Passed
        } else {
            CaseOutcome::Failed { reasons }
        };
        Self {
            label,
            outcome,
            metrics,
            notes: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Failed { .. })
    }

    fn details(&self) -> String {
        match &self.outcome {
            CaseOutcome::Passed => self
                .metrics
                .iter()
                .map(|m| format!("{} {:.2e}/{:.2e}", m.name, m.kernel.max_abs, m.allowance))
                .collect::<Vec<_>>()
                .join(", "),
            CaseOutcome::Failed { reasons } => reasons.join("; "),
            CaseOutcome::Skipped { reason } => reason.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub suite: Suite,
    pub kernel: String,
    pub cases: Vec<CaseReport>,
    pub elapsed: Duration,
}

impl SuiteReport {
    fn count(&self, pred: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| pred(&c.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Skipped { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} on {}: {} passed, {} failed, {} skipped in {:.1}s",
            self.suite,
            self.kernel,
            self.passed(),
            self.failed(),
            self.skipped(),
            self.elapsed.as_secs_f64()
        )
    }

    /// Summary line followed by a table of every case.
    pub fn to_markdown(&self) -> String {
        let mut markdown = format!(
            "## {}\n\n{}\n\n| case | status | error / allowance |\n| --- | --- | --- |\n",
            self.suite,
            self.summary()
        );
        for case in &self.cases {
            markdown.push_str(&case.table_row());
        }
        markdown
    }
}

impl CaseReport {
    fn table_row(&self) -> String {
        format!(
            "| {} | {} | {} |\n",
            escape_cell(&self.label),
            self.outcome.label(),
            escape_cell(&self.details())
        )
    }
}

/// Error messages may quote `|x - y|`; keep them inside their cell.
fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

const RESULTS_HEADER: &str = "# Flash Attention Correctness\n\n";

fn markers(suite: Suite) -> (String, String) {
    let name = suite.name().to_uppercase();
    (format!("<!-- {name}_START -->"), format!("<!-- {name}_END -->"))
}

/// Swap the `suite` block of a results document for `content`, appending the
/// block when the document has none.
fn replace_section(mut body: String, suite: Suite, content: &str) -> Result<String> {
    let (start_marker, end_marker) = markers(suite);
    let block = format!("{start_marker}\n{content}\n{end_marker}\n");

    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start), Some(end)) if start < end => {
            let mut stop = end + end_marker.len();
            if body[stop..].starts_with('\n') {
                stop += 1;
            }
            body.replace_range(start..stop, &block);
        }
        (None, None) => {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
        (start, end) => {
            return Err(AttentionError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "malformed {suite} section: start marker at {start:?}, end marker at {end:?}"
                ),
            )));
        }
    }
    Ok(body)
}

/// Replace (or append) the section of `suite` in the results file at `path`,
/// creating the file and its directory when missing.
pub fn update_results(path: &Path, suite: Suite, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        RESULTS_HEADER.to_string()
    };
    fs::write(path, replace_section(body, suite, content)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::tolerance::{DiffStats, ErrorBudget};

    fn metric(kernel: f32, baseline: f32) -> Metric {
        let stats = |max_abs| DiffStats {
            max_abs,
            mean_abs: max_abs / 2.0,
        };
        Metric::judge("out", stats(kernel), stats(baseline), ErrorBudget::DENSE)
    }

    #[test]
    fn outcome_follows_metrics() {
        let report = CaseReport::judged("a".into(), vec![metric(1e-3, 1e-3)], Vec::new());
        assert_eq!(report.outcome, CaseOutcome::Passed);
        let report = CaseReport::judged("b".into(), vec![metric(1.0, 1e-3)], Vec::new());
        assert!(report.is_failure());
        let report = CaseReport::judged("c".into(), Vec::new(), vec!["kernel error".into()]);
        assert!(report.is_failure());
    }

    #[test]
    fn table_cells_escape_pipes() {
        let report = CaseReport::judged(
            "a".into(),
            Vec::new(),
            vec!["|out - ref| too large\nsee log".into()],
        );
        assert_eq!(
            report.table_row(),
            "| a | FAIL | \\|out - ref\\| too large see log |\n"
        );
    }

    #[test]
    fn sections_are_appended_then_replaced() -> Result<()> {
        let body = replace_section(RESULTS_HEADER.to_string(), Suite::Dense, "one")?;
        let body = replace_section(body, Suite::Flex, "two")?;
        let body = replace_section(body, Suite::Dense, "three")?;
        assert_eq!(
            body,
            "# Flash Attention Correctness\n\n\
             <!-- DENSE_START -->\nthree\n<!-- DENSE_END -->\n\
             <!-- FLEX_START -->\ntwo\n<!-- FLEX_END -->\n"
        );
        Ok(())
    }

    #[test]
    fn inverted_or_dangling_markers_are_errors() {
        let inverted = "<!-- VARLEN_END -->\nstale\n<!-- VARLEN_START -->\n".to_string();
        let err = replace_section(inverted, Suite::Varlen, "new").unwrap_err();
        assert!(err.to_string().contains("malformed varlen section"));

        let dangling = "# results\n<!-- FP8_START -->\n".to_string();
        assert!(replace_section(dangling, Suite::Fp8, "new").is_err());
    }

    #[test]
    fn suite_counts_outcomes() {
        let report = SuiteReport {
            suite: Suite::Dense,
            kernel: "cpu-flash".into(),
            cases: vec![
                CaseReport::judged("a".into(), vec![metric(1e-3, 1e-3)], Vec::new()),
                CaseReport::skipped("b".into(), "too large".into()),
                CaseReport::judged("c".into(), vec![metric(1.0, 1e-3)], Vec::new()),
            ],
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!((report.passed(), report.failed(), report.skipped()), (1, 1, 1));
        assert!(!report.is_success());
        let markdown = report.to_markdown();
        assert!(markdown.starts_with("## dense"));
        assert!(markdown.contains("| b | skip | too large |"));
    }
}
