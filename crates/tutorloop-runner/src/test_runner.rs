//! Runs a sandboxed program against its test cases, one process per case.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use tutorloop_core::model::{truncate_chars, TestCase};
use tutorloop_core::results::{CaseOutcome, CaseStatus, TIMEOUT_MARKER};

use crate::sandbox::{kill_group, Sandbox, PROGRAM_FILE};

/// Run every case in order under the per-case and suite time limits.
///
/// Cases that have not started when the suite cap expires are
/// [`CaseStatus::Skipped`].
pub async fn run_cases(sandbox: &Sandbox, cases: &[TestCase]) -> Vec<CaseOutcome> {
    let deadline = Instant::now() + sandbox.limits().suite_timeout();
    let mut outcomes = Vec::with_capacity(cases.len());

    for (index, case) in cases.iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(index, "suite time cap reached, skipping case");
            outcomes.push(blank(index, case, CaseStatus::Skipped, String::new()));
            continue;
        }
        let budget = remaining.min(sandbox.case_timeout());
        outcomes.push(run_case(sandbox, index, case, budget).await);
    }

    outcomes
}

async fn run_case(
    sandbox: &Sandbox,
    index: usize,
    case: &TestCase,
    budget: Duration,
) -> CaseOutcome {
    let limits = sandbox.limits();
    let start = Instant::now();

    let mut child = match sandbox.python(&[PROGRAM_FILE]).spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(index, error = %e, "failed to start program");
            return blank(
                index,
                case,
                CaseStatus::Crashed,
                format!("failed to start python: {e}"),
            );
        }
    };
    let pid = child.id();

    if let Some(mut stdin) = child.stdin.take() {
        let input = case.input.clone().into_bytes();
        // Programs that never read stdin close the pipe early.
        tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
        });
    }
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        tokio::join!(
            child.wait(),
            read_capped(stdout, limits.max_stdout_bytes),
            read_capped(stderr, limits.max_stdout_bytes),
        )
    };

    let finished = tokio::time::timeout(budget, run).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (status, stdout, stderr) = match finished {
        Ok(done) => done,
        Err(_) => {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            let _ = child.kill().await;
            return CaseOutcome {
                index,
                hidden: case.hidden,
                status: CaseStatus::Timeout,
                stdout: TIMEOUT_MARKER.to_string(),
                stderr: String::new(),
                duration_ms,
            };
        }
    };

    let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
    let stderr = truncate_chars(&String::from_utf8_lossy(&stderr), limits.max_stderr_chars);

    let status = match status {
        Ok(exit) => classify(exit, &stdout, &stderr, &case.output),
        Err(e) => {
            tracing::warn!(index, error = %e, "failed to wait for program");
            CaseStatus::Crashed
        }
    };

    CaseOutcome {
        index,
        hidden: case.hidden,
        status,
        stdout,
        stderr,
        duration_ms,
    }
}

/// Decide a finished case's status.
pub fn classify(exit: ExitStatus, stdout: &str, stderr: &str, expected: &str) -> CaseStatus {
    if !exit.success() {
        return if stderr.contains("MemoryError") {
            CaseStatus::MemoryExceeded
        } else {
            CaseStatus::Crashed
        };
    }
    if stdout.trim() == expected.trim() {
        CaseStatus::Passed
    } else {
        CaseStatus::WrongAnswer
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes. The rest is drained so
/// a chatty program cannot stall on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    kept
}

fn blank(index: usize, case: &TestCase, status: CaseStatus, stderr: String) -> CaseOutcome {
    CaseOutcome {
        index,
        hidden: case.hidden,
        status,
        stdout: String::new(),
        stderr,
        duration_ms: 0,
    }
}
