/// Test Evaluator - Language-Agnostic Judging and Summarizing
///
/// **Core Responsibility:**
/// Turn one command outcome into a `TestOutcome`, and a list of outcomes into
/// a `Verdict`.
///
/// **Critical Properties:**
/// - Knows nothing about Docker, pools or queues
/// - Pure functions: same input, same output
///
/// **Normalization Rules (Applied to All Languages):**
/// - Trim leading and trailing whitespace (covers \n vs \r\n at the ends)
/// - Internal whitespace and case must match exactly
///
/// **Percentages:**
/// Relative to the tests actually executed, not the suite size. With
/// fail-fast the executed prefix can be shorter than the suite.

use crate::runner::CommandOutcome;
use crucible_common::types::{TestCase, TestOutcome, Verdict, VerdictStatus};

fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Judge a single run of test case `index`.
///
/// Any non-zero exit (runtime error, timeout, runner failure) fails the test
/// regardless of what was printed.
pub fn evaluate_test(index: usize, test_case: &TestCase, run: &CommandOutcome) -> TestOutcome {
    let error = if run.succeeded() {
        None
    } else if run.error.trim().is_empty() {
        Some(format!("Runtime Error (exit code {})", run.exit_code))
    } else {
        Some(run.error.trim().to_string())
    };

    let passed =
        error.is_none() && normalize_output(&run.output) == normalize_output(&test_case.output);

    TestOutcome {
        index,
        passed,
        input: test_case.input.clone(),
        expected: test_case.output.clone(),
        actual: normalize_output(&run.output).to_string(),
        error,
        compilation_error: false,
    }
}

fn format_percentage(passed: usize, executed: usize) -> String {
    if executed == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", passed as f64 / executed as f64 * 100.0)
}

/// Summarize executed outcomes into a verdict.
pub fn summarize(outcomes: &[TestOutcome]) -> Verdict {
    if let [only] = outcomes {
        if only.compilation_error {
            return Verdict {
                status: VerdictStatus::CompilationError,
                passed: 0,
                failed: 1,
                total_tests_executed: 0,
                percentage: "0.00".to_string(),
                details: outcomes.to_vec(),
            };
        }
    }

    let executed = outcomes.len();
    let passed = outcomes.iter().filter(|o| o.passed).count();
    let status = if executed > 0 && passed == executed {
        VerdictStatus::Accepted
    } else {
        VerdictStatus::Rejected
    };

    Verdict {
        status,
        passed,
        failed: executed - passed,
        total_tests_executed: executed,
        percentage: format_percentage(passed, executed),
        details: outcomes.to_vec(),
    }
}
