//! Syntax check for sandboxed programs.

use anyhow::{Context, Result};

use tutorloop_core::model::truncate_chars;

use crate::sandbox::{Sandbox, PROGRAM_FILE};

/// Byte-compile the program without running it.
///
/// Returns `Ok(None)` when the program parses and `Ok(Some(message))` with a
/// short diagnostic when it does not. `Err` means the interpreter could not
/// be started or hung.
pub async fn check_syntax(sandbox: &Sandbox) -> Result<Option<String>> {
    let mut cmd = sandbox.python(&["-m", "py_compile", PROGRAM_FILE]);
    cmd.stdin(std::process::Stdio::null());

    let output = tokio::time::timeout(sandbox.case_timeout(), cmd.output())
        .await
        .context("syntax check timed out")?
        .context("failed to run python syntax check")?;

    if output.status.success() {
        return Ok(None);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(Some(truncate_chars(
        &summarize(&stderr),
        sandbox.limits().max_stderr_chars,
    )))
}

/// Reduce a py_compile traceback to `line N: ErrorKind: detail`.
fn summarize(stderr: &str) -> String {
    let last = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("SyntaxError");

    let line_no = stderr.lines().rev().find_map(|l| {
        let (_, rest) = l.split_once(", line ")?;
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        (!digits.is_empty()).then_some(digits)
    });

    match line_no {
        Some(n) => format!("line {n}: {last}"),
        None => last.to_string(),
    }
}
