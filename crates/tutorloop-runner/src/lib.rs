//! tutorloop-runner: Sandboxed execution of submitted Python programs.
//!
//! Each request gets a private scratch directory, a syntax check, and one
//! resource-limited child process per test case.

pub mod compiler;
pub mod sandbox;
pub mod test_runner;

use std::process::Stdio;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use tutorloop_core::config::SandboxLimits;
use tutorloop_core::results::ExecutionReport;
use tutorloop_core::traits::{CodeExecutor, ExecutionRequest};

/// Local executor that runs programs with the host's Python interpreter.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    limits: SandboxLimits,
}

impl LocalRunner {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Whether the configured interpreter can be started at all.
    pub async fn available(&self) -> bool {
        let probe = Command::new(&self.limits.python)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        matches!(
            tokio::time::timeout(self.limits.case_timeout(), probe).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

#[async_trait]
impl CodeExecutor for LocalRunner {
    #[instrument(skip_all, fields(cases = request.cases.len()))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport> {
        let sandbox = sandbox::Sandbox::new(self.limits.clone())?;
        sandbox.write_program(&request.code)?;

        match compiler::check_syntax(&sandbox).await {
            Ok(None) => {}
            Ok(Some(message)) => {
                tracing::debug!(%message, "program failed syntax check");
                return Ok(ExecutionReport::syntax_error(message));
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "syntax check could not run");
                return Ok(ExecutionReport::fault(&request.cases, &format!("{e:#}")));
            }
        }

        let start = Instant::now();
        let outcomes = test_runner::run_cases(&sandbox, &request.cases).await;
        let report = ExecutionReport::completed(outcomes, start.elapsed().as_millis() as u64);

        tracing::debug!(
            pass_rate = report.pass_rate(),
            duration_ms = report.duration_ms,
            "program executed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorloop_core::model::TestCase;
    use tutorloop_core::results::{CaseStatus, TIMEOUT_MARKER};

    fn case(input: &str, output: &str, hidden: bool) -> TestCase {
        TestCase {
            input: input.into(),
            output: output.into(),
            hidden,
        }
    }

    fn request(code: &str, cases: Vec<TestCase>) -> ExecutionRequest {
        ExecutionRequest {
            code: code.into(),
            cases,
        }
    }

    /// A runner with the given limits, or `None` (test skipped) when no
    /// interpreter is installed.
    async fn runner(limits: SandboxLimits) -> Option<LocalRunner> {
        let runner = LocalRunner::new(limits);
        if runner.available().await {
            Some(runner)
        } else {
            eprintln!("python3 not available, skipping");
            None
        }
    }

    const DOUBLE: &str = "n = int(input())\nprint(n * 2)\n";

    #[tokio::test]
    async fn correct_program_passes_all_cases() {
        let Some(runner) = runner(SandboxLimits::default()).await else {
            return;
        };
        let report = runner
            .execute(&request(
                DOUBLE,
                vec![case("2", "4", false), case("5", "10", true)],
            ))
            .await
            .unwrap();

        assert!(report.compiled());
        assert_eq!(report.pass_rate(), 1.0);
        assert_eq!(report.hidden_pass_rate_opt(), Some(1.0));
        assert!(report.outcomes[1].hidden);
        assert_eq!(report.outcomes[0].stdout, "4");
    }

    #[tokio::test]
    async fn wrong_output_and_crash_are_distinguished() {
        let Some(runner) = runner(SandboxLimits::default()).await else {
            return;
        };
        let code = "n = int(input())\nif n < 0:\n    raise ValueError('negative')\nprint(n + 1)\n";
        let report = runner
            .execute(&request(
                code,
                vec![case("2", "4", false), case("-1", "0", true)],
            ))
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].status, CaseStatus::WrongAnswer);
        assert_eq!(report.outcomes[1].status, CaseStatus::Crashed);
        assert!(report.outcomes[1].stderr.contains("ValueError"));
        assert_eq!(report.pass_rate(), 0.0);
    }

    #[tokio::test]
    async fn syntax_error_runs_no_cases() {
        let Some(runner) = runner(SandboxLimits::default()).await else {
            return;
        };
        let report = runner
            .execute(&request("def broken(:\n    pass\n", vec![case("", "x", false)]))
            .await
            .unwrap();

        assert!(!report.compiled());
        assert!(report.outcomes.is_empty());
        assert!(report.syntax_message().unwrap().contains("line 1"));
        assert_eq!(report.pass_rate(), 0.0);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let limits = SandboxLimits {
            case_timeout_ms: 500,
            ..SandboxLimits::default()
        };
        let Some(runner) = runner(limits).await else {
            return;
        };
        let report = runner
            .execute(&request("while True:\n    pass\n", vec![case("", "1", false)]))
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].status, CaseStatus::Timeout);
        assert_eq!(report.outcomes[0].stdout, TIMEOUT_MARKER);
        assert!(report.timed_out());
    }

    #[tokio::test]
    async fn suite_cap_skips_remaining_cases() {
        let limits = SandboxLimits {
            case_timeout_ms: 2_000,
            suite_timeout_ms: 500,
            ..SandboxLimits::default()
        };
        let Some(runner) = runner(limits).await else {
            return;
        };
        let code = "import time\ntime.sleep(0.3)\nprint('done')\n";
        let cases = vec![
            case("", "done", false),
            case("", "done", false),
            case("", "done", true),
        ];
        let report = runner.execute(&request(code, cases)).await.unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcomes[2].status, CaseStatus::Skipped);
        assert!(report.pass_rate() < 1.0);
    }

    #[tokio::test]
    async fn memory_ceiling_is_enforced() {
        let Some(runner) = runner(SandboxLimits::default()).await else {
            return;
        };
        let code = "data = bytearray(1024 * 1024 * 1024)\nprint(len(data))\n";
        let report = runner
            .execute(&request(code, vec![case("", "1073741824", false)]))
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].status, CaseStatus::MemoryExceeded);
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        let Some(runner) = runner(SandboxLimits::default()).await else {
            return;
        };
        // cargo exports CARGO_* to the test process; none may leak through.
        let code = "import os\nleaked = [k for k in os.environ if k.startswith('CARGO')]\nprint('clean' if not leaked else leaked)\n";
        let report = runner
            .execute(&request(code, vec![case("", "clean", false)]))
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].status, CaseStatus::Passed);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn writes_outside_scratch_stay_private() {
        let Some(runner) = runner(SandboxLimits::default()).await else {
            return;
        };
        let name = format!(
            "tutorloop-escape-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        let code = format!(
            r#"
for path in ('/tmp/{name}', '/var/tmp/{name}', '../{name}'):
    try:
        with open(path, 'w') as f:
            f.write('x')
    except OSError:
        pass
with open('scratch.txt', 'w') as f:
    f.write('ok')
print(open('scratch.txt').read())
fields = open('/proc/self/uid_map').read().split()
print(fields[2] if len(fields) > 2 else 'unmapped')
"#
        );
        let report = runner
            .execute(&request(&code, vec![case("", "ok", false)]))
            .await
            .unwrap();

        let host_paths = [
            std::path::Path::new("/tmp").join(&name),
            std::path::Path::new("/var/tmp").join(&name),
            std::env::temp_dir().join(&name),
        ];
        let escaped: Vec<_> = host_paths.iter().filter(|p| p.exists()).collect();
        for path in &escaped {
            let _ = std::fs::remove_file(path);
        }

        let stdout = &report.outcomes[0].stdout;
        if !stdout.ends_with("\n1") {
            eprintln!("unprivileged user namespaces unavailable, skipping");
            return;
        }
        assert_eq!(stdout.lines().next(), Some("ok"), "scratch must stay writable");
        assert!(escaped.is_empty(), "wrote outside scratch: {escaped:?}");
    }

    #[tokio::test]
    async fn stdout_is_capped() {
        let limits = SandboxLimits {
            max_stdout_bytes: 1_000,
            ..SandboxLimits::default()
        };
        let Some(runner) = runner(limits).await else {
            return;
        };
        let report = runner
            .execute(&request("print('x' * 200000)\n", vec![case("", "x", false)]))
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].status, CaseStatus::WrongAnswer);
        assert!(report.outcomes[0].stdout.len() <= 1_000);
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_fault_not_an_error() {
        let runner = LocalRunner::new(SandboxLimits {
            python: "definitely-not-python-3".into(),
            ..SandboxLimits::default()
        });
        assert!(!runner.available().await);

        let report = runner
            .execute(&request(DOUBLE, vec![case("1", "2", false)]))
            .await
            .unwrap();
        assert!(report.crashed());
        assert_eq!(report.pass_rate(), 0.0);
    }
}
