//! Domain types shared by both harness variants.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`thread_count`].
pub const THREAD_COUNT_ENV: &str = "BSH_THREAD_COUNT";

/// Upper bound for the derived thread count.
const MAX_THREAD_COUNT: u32 = 16;

// ─── TestCase ────────────────────────────────────────────────────────

/// Scenario descriptor reference.
///
/// Passed through to the scenario interpreter untouched; the harness only
/// checks that a path exists before launching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioRef {
    /// Script or config file understood by the interpreter.
    Path(PathBuf),
    /// Scenario known to the interpreter by name.
    Named(String),
}

impl fmt::Display for ScenarioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// One parametrized test execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    name: String,
    scenario: ScenarioRef,
}

impl TestCase {
    pub fn new(name: impl Into<String>, scenario: ScenarioRef) -> Self {
        Self {
            name: name.into(),
            scenario,
        }
    }

    /// Test case whose scenario is a descriptor file.
    pub fn with_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, ScenarioRef::Path(path.into()))
    }

    /// Test case whose scenario is resolved by the interpreter from its name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), ScenarioRef::Named(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scenario(&self) -> &ScenarioRef {
        &self.scenario
    }
}

/// Built-in test cases, resolved against a scenario source root.
///
/// `partition-reboots` restarts partitions under load with throttling on.
pub fn builtin_test_cases(scenario_root: &Path) -> Vec<TestCase> {
    vec![TestCase::with_path(
        "partition-reboots",
        scenario_root.join("loadtest/local-v2/partition-reboots.txt"),
    )]
}

/// Find a built-in test case by name.
pub fn find_test_case(scenario_root: &Path, name: &str) -> Option<TestCase> {
    builtin_test_cases(scenario_root)
        .into_iter()
        .find(|case| case.name() == name)
}

// ─── TestResult ──────────────────────────────────────────────────────

/// Outcome of a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Immutable outcome record produced by a scenario runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    status: TestStatus,
    diagnostics: String,
    artifact_paths: Vec<PathBuf>,
}

impl TestResult {
    pub fn pass(diagnostics: impl Into<String>, artifact_paths: Vec<PathBuf>) -> Self {
        Self {
            status: TestStatus::Pass,
            diagnostics: diagnostics.into(),
            artifact_paths,
        }
    }

    pub fn fail(diagnostics: impl Into<String>, artifact_paths: Vec<PathBuf>) -> Self {
        Self {
            status: TestStatus::Fail,
            diagnostics: diagnostics.into(),
            artifact_paths,
        }
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn is_pass(&self) -> bool {
        self.status == TestStatus::Pass
    }

    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    pub fn artifact_paths(&self) -> &[PathBuf] {
        &self.artifact_paths
    }
}

// ─── Endpoints ───────────────────────────────────────────────────────

/// Live addresses of a ready service, handed to the scenario runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Host the service listens on.
    pub host: String,
    /// Client (data-plane) port.
    pub service_port: u16,
    /// Monitoring port.
    pub monitoring_port: u16,
    /// Service log stream for this invocation.
    pub log_path: PathBuf,
}

impl Endpoints {
    /// `host:service_port`
    pub fn service_addr(&self) -> String {
        format!("{}:{}", self.host, self.service_port)
    }

    /// `host:monitoring_port`
    pub fn monitoring_addr(&self) -> String {
        format!("{}:{}", self.host, self.monitoring_port)
    }
}

// ─── log_tail ────────────────────────────────────────────────────────

/// Lines of service or scenario output quoted in failure diagnostics.
pub const LOG_TAIL_LINES: usize = 50;

/// Last `max_lines` lines of `text`.
pub fn log_tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

// ─── thread_count ────────────────────────────────────────────────────

/// Server and scenario concurrency for this host.
///
/// `BSH_THREAD_COUNT` wins when it parses to a positive integer; otherwise
/// available parallelism clamped to `1..=16`.
pub fn thread_count() -> u32 {
    if let Ok(raw) = std::env::var(THREAD_COUNT_ENV) {
        match raw.trim().parse::<u32>() {
            Ok(n) if n > 0 => return n,
            _ => tracing::warn!(
                env_key = THREAD_COUNT_ENV,
                value = raw.as_str(),
                "invalid thread count in env var, ignoring"
            ),
        }
    }

    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(MAX_THREAD_COUNT))
        .unwrap_or(1)
        .clamp(1, MAX_THREAD_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn named_test_case_uses_name_as_scenario() {
        let case = TestCase::named("partition-reboots");
        assert_eq!(case.name(), "partition-reboots");
        assert_eq!(
            case.scenario(),
            &ScenarioRef::Named("partition-reboots".to_owned())
        );
    }

    #[test]
    fn builtin_catalogue_contains_partition_reboots() {
        let case = find_test_case(Path::new("/src/blockstore/tests"), "partition-reboots")
            .expect("partition-reboots should be built in");
        match case.scenario() {
            ScenarioRef::Path(p) => {
                assert!(p.ends_with("loadtest/local-v2/partition-reboots.txt"));
                assert!(p.starts_with("/src/blockstore/tests"));
            }
            other => panic!("expected path scenario, got {other:?}"),
        }
        assert!(find_test_case(Path::new("/"), "no-such-case").is_none());
    }

    #[test]
    fn result_constructors_set_status() {
        let ok = TestResult::pass("", vec![]);
        assert!(ok.is_pass());
        assert_eq!(ok.status(), TestStatus::Pass);

        let failed = TestResult::fail("boom", vec![PathBuf::from("/tmp/nbs.log")]);
        assert!(!failed.is_pass());
        assert_eq!(failed.diagnostics(), "boom");
        assert_eq!(failed.artifact_paths().len(), 1);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TestStatus::Fail).unwrap();
        assert_eq!(json, "\"fail\"");
    }

    #[test]
    fn endpoints_format_addresses() {
        let ep = Endpoints {
            host: "127.0.0.1".to_owned(),
            service_port: 9766,
            monitoring_port: 8766,
            log_path: PathBuf::from("/tmp/run/nbs.log"),
        };
        assert_eq!(ep.service_addr(), "127.0.0.1:9766");
        assert_eq!(ep.monitoring_addr(), "127.0.0.1:8766");
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let text = "one\ntwo\nthree\n";
        assert_eq!(log_tail(text, 2), "two\nthree");
        assert_eq!(log_tail(text, 10), "one\ntwo\nthree");
        assert_eq!(log_tail("", 3), "");
    }

    #[test]
    #[serial]
    fn thread_count_honours_env() {
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var(THREAD_COUNT_ENV, "3") };
        assert_eq!(thread_count(), 3);
        unsafe { std::env::remove_var(THREAD_COUNT_ENV) };
    }

    #[test]
    #[serial]
    fn thread_count_ignores_invalid_env() {
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var(THREAD_COUNT_ENV, "zero") };
        let n = thread_count();
        assert!((1..=MAX_THREAD_COUNT).contains(&n));
        unsafe { std::env::remove_var(THREAD_COUNT_ENV) };
    }
}
