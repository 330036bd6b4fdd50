use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the engine can judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Javascript,
        Language::Python,
        Language::Cpp,
        Language::Java,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported language: {0}. Supported: javascript, python, cpp, java")]
pub struct UnsupportedLanguage(pub String);

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| UnsupportedLanguage(s.to_string()))
    }
}

/// Problem identifiers arrive either as numbers or as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProblemId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProblemId::Number(n) => write!(f, "{}", n),
            ProblemId::Text(s) => f.write_str(s),
        }
    }
}

/// One hidden test case. `output` is the exact expected stdout after trimming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Job payload as consumed from the queue.
///
/// `language` stays a raw string here: it is validated by the consumer so that
/// an unknown language resolves the job with an error instead of failing to
/// deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub code: String,
    pub language: String,
    pub problem_id: ProblemId,
    pub test_cases: Vec<TestCase>,
}

/// Result of running one test case (or of a failed compilation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub index: usize,
    pub passed: bool,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compilation_error: bool,
}

impl TestOutcome {
    pub const COMPILATION_ERROR_PREFIX: &'static str = "Compilation Error:\n";

    /// The single outcome reported when the compile step fails.
    pub fn compilation_failure(diagnostics: &str) -> Self {
        TestOutcome {
            index: 0,
            passed: false,
            input: String::new(),
            expected: String::new(),
            actual: String::new(),
            error: Some(format!("{}{}", Self::COMPILATION_ERROR_PREFIX, diagnostics)),
            compilation_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Accepted,
    Rejected,
    CompilationError,
    Error,
}

/// Summarized accept/reject outcome for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: VerdictStatus,
    pub passed: usize,
    pub failed: usize,
    pub total_tests_executed: usize,
    pub percentage: String,
    pub details: Vec<TestOutcome>,
}

/// Terminal value a job is resolved with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    #[serde(rename_all = "camelCase")]
    Completed {
        success: bool,
        test_results: Vec<TestOutcome>,
        summary: Verdict,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        success: bool,
        status: VerdictStatus,
        error: String,
        passed: usize,
        total_tests: usize,
    },
}

impl JobResult {
    pub fn completed(test_results: Vec<TestOutcome>, summary: Verdict) -> Self {
        JobResult::Completed {
            success: true,
            test_results,
            summary,
        }
    }

    pub fn failure(error: impl Into<String>, total_tests: usize) -> Self {
        JobResult::Failed {
            success: false,
            status: VerdictStatus::Error,
            error: error.into(),
            passed: 0,
            total_tests,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Completed { .. })
    }
}
