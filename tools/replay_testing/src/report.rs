use crate::analyze::{AssertionOutcome, AssertionResult};
use std::path::PathBuf;

/// Everything that happened to one parameter set of one fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamReport {
    pub fixture_key: String,
    pub param_name: String,
    pub filtered_fixture: PathBuf,
    pub output: Option<PathBuf>,
    /// Set when RUNNING failed. Results are still present if the run left a recording.
    pub run_failure: Option<String>,
    pub results: Vec<AssertionResult>,
    pub duration_ms: u64,
}

impl ParamReport {
    pub fn passed(&self) -> bool {
        self.run_failure.is_none() && self.results.iter().all(AssertionResult::passed)
    }

    pub fn failure_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, AssertionOutcome::Failed(_)))
            .count()
    }

    pub fn error_count(&self) -> usize {
        let errors = self
            .results
            .iter()
            .filter(|r| matches!(r.outcome, AssertionOutcome::Error(_)))
            .count();
        errors + usize::from(self.run_failure.is_some())
    }

    pub fn case_count(&self) -> usize {
        self.results.len() + usize::from(self.run_failure.is_some())
    }
}

/// A fixture that never reached RUNNING because resolving or filtering it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureFailure {
    pub fixture_key: String,
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub test_name: String,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub params: Vec<ParamReport>,
    pub fixture_failures: Vec<FixtureFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Pass,
    Fail,
    Error,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

/// One `(test, fixture, param, assertion)` line of the final summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub test_name: String,
    pub fixture_key: String,
    pub param_name: String,
    pub assertion: String,
    pub status: RowStatus,
    pub detail: String,
}

impl TestReport {
    pub fn new(test_name: &str, run_id: &str, run_dir: PathBuf) -> Self {
        Self {
            test_name: test_name.to_string(),
            run_id: run_id.to_string(),
            run_dir,
            params: Vec::new(),
            fixture_failures: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.fixture_failures.is_empty()
            && !self.params.is_empty()
            && self.params.iter().all(ParamReport::passed)
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(!self.passed())
    }

    pub fn rows(&self) -> Vec<SummaryRow> {
        let mut rows = Vec::new();
        for failure in &self.fixture_failures {
            rows.push(SummaryRow {
                test_name: self.test_name.clone(),
                fixture_key: failure.fixture_key.clone(),
                param_name: "-".to_string(),
                assertion: "fixtures".to_string(),
                status: RowStatus::Error,
                detail: failure.reason.clone(),
            });
        }
        for param in &self.params {
            if let Some(reason) = &param.run_failure {
                rows.push(SummaryRow {
                    test_name: self.test_name.clone(),
                    fixture_key: param.fixture_key.clone(),
                    param_name: param.param_name.clone(),
                    assertion: "run".to_string(),
                    status: RowStatus::Error,
                    detail: reason.clone(),
                });
            }
            for result in &param.results {
                let (status, detail) = match &result.outcome {
                    AssertionOutcome::Passed => (RowStatus::Pass, String::new()),
                    AssertionOutcome::Failed(message) => (RowStatus::Fail, message.clone()),
                    AssertionOutcome::Error(message) => (RowStatus::Error, message.clone()),
                };
                rows.push(SummaryRow {
                    test_name: self.test_name.clone(),
                    fixture_key: param.fixture_key.clone(),
                    param_name: param.param_name.clone(),
                    assertion: result.assertion.clone(),
                    status,
                    detail,
                });
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(assertion: &str, outcome: AssertionOutcome) -> AssertionResult {
        AssertionResult {
            fixture_key: "cmd_vel_only".to_string(),
            param_name: "slow".to_string(),
            assertion: assertion.to_string(),
            outcome,
            duration_ms: 1,
        }
    }

    fn param(name: &str, run_failure: Option<&str>, results: Vec<AssertionResult>) -> ParamReport {
        ParamReport {
            fixture_key: "cmd_vel_only".to_string(),
            param_name: name.to_string(),
            filtered_fixture: PathBuf::from("/run/cmd_vel_only/filtered.mcap"),
            output: None,
            run_failure: run_failure.map(str::to_string),
            results,
            duration_ms: 10,
        }
    }

    #[test]
    fn rows_cover_every_assertion_and_run_failure() {
        let mut report = TestReport::new("basic_replay", "r1", PathBuf::from("/run"));
        report.params.push(param(
            "slow",
            None,
            vec![
                result("a", AssertionOutcome::Passed),
                result("b", AssertionOutcome::Failed("too few".to_string())),
            ],
        ));
        report.params.push(param("fast", Some("player exited with 1"), Vec::new()));

        let rows = report.rows();
        assert_eq!(
            rows.iter()
                .map(|r| (r.param_name.as_str(), r.assertion.as_str(), r.status))
                .collect::<Vec<_>>(),
            vec![
                ("slow", "a", RowStatus::Pass),
                ("slow", "b", RowStatus::Fail),
                ("fast", "run", RowStatus::Error),
            ]
        );
        assert!(!report.passed());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.params[1].error_count(), 1);
        assert_eq!(report.params[0].failure_count(), 1);
    }

    #[test]
    fn timed_out_param_with_a_recording_reports_both_the_run_and_its_assertions() {
        let mut report = TestReport::new("basic_replay", "r1", PathBuf::from("/run"));
        report.params.push(param(
            "slow",
            Some("timed out after 2s"),
            vec![result("test_cmd_vel", AssertionOutcome::Passed)],
        ));

        let rows = report.rows();
        assert_eq!(
            rows.iter()
                .map(|r| (r.assertion.as_str(), r.status))
                .collect::<Vec<_>>(),
            vec![("run", RowStatus::Error), ("test_cmd_vel", RowStatus::Pass)]
        );
        assert_eq!(report.params[0].case_count(), 2);
        assert_eq!(report.params[0].error_count(), 1);
        assert!(!report.passed());
    }

    #[test]
    fn empty_report_does_not_pass() {
        let report = TestReport::new("t", "r", PathBuf::from("/run"));
        assert!(!report.passed());
    }
}
