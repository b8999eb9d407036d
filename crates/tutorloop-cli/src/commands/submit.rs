//! The `tutorloop submit` and `tutorloop batch` commands.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;

use tutorloop_core::engine::SubmitRequest;
use tutorloop_core::model::{truncate_chars, ErrorClass};
use tutorloop_core::results::{PipelineOutcome, SubmissionResult};

pub async fn execute(
    student: String,
    problem: String,
    code_path: PathBuf,
    deep: bool,
    json: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let repo = super::open_repository(&config)?;
    let student = super::find_student(repo.as_ref(), &student)?;
    let code = read_code(&code_path)?;
    let pipeline = super::build_pipeline(&config, repo).await?;

    let outcome = match pipeline
        .submit(SubmitRequest {
            student_id: student.id,
            problem_id: problem,
            code,
            deep_explain: deep,
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) if e.is_not_found() => {
            return Err(anyhow::Error::new(e)
                .context("unknown reference (`tutorloop seed` loads the problem banks)"));
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn read_code(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("failed to read code from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read code file: {}", path.display()))
    }
}

fn print_outcome(outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::Throttled { cooldown_secs } => {
            println!("Identical resubmission ignored. Try again in {cooldown_secs}s.");
        }
        PipelineOutcome::Evaluated(result) => print_result(result),
    }
}

fn print_result(result: &SubmissionResult) {
    println!(
        "Submission {}: {} ({:.0}% of all cases, {:.0}% of visible cases)",
        result.submission_id,
        result.status.as_str(),
        result.pass_rate * 100.0,
        result.visible_pass_rate * 100.0,
    );

    if !result.visible_results.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Input", "Expected", "Got", "Result"]);
        for case in &result.visible_results {
            table.add_row(vec![
                Cell::new(truncate_chars(&case.input, 40)),
                Cell::new(truncate_chars(&case.expected, 40)),
                Cell::new(truncate_chars(&case.got, 40)),
                Cell::new(case.status.as_str()),
            ]);
        }
        println!("{table}");
    }

    if result.error_class != ErrorClass::None {
        println!("Detected issue: {}", result.error_class);
    }
    if result.gaming_flagged {
        println!("Note: this solution looks tailored to the visible examples.");
    }
    println!("\nFeedback: {}", result.feedback.text);

    let cap = &result.capability;
    println!(
        "\nCapability [{}]: {:.3} -> {:.3} ({:+.3})",
        cap.concept,
        cap.old_score,
        cap.new_score,
        cap.delta()
    );
    for update in &result.secondary_updates {
        println!(
            "  [{}]: {:.3} -> {:.3} ({:+.3})",
            update.concept,
            update.old_score,
            update.new_score,
            update.delta()
        );
    }

    if let Some(reason) = result.escalation_reason {
        println!("\nEscalated: {reason}");
    }
    if let Some(deep) = &result.deep_explanation {
        println!("\n{}", deep.explanation);
        for (i, step) in deep.steps.iter().enumerate() {
            println!("  {}. {step}", i + 1);
        }
        println!("Another way to approach it: {}", deep.alternative_approach);
        if let Some(id) = &deep.practice_problem_id {
            println!("Practice problem added: {id}");
        }
    }

    match &result.next_problem {
        Some(next) => {
            println!(
                "\nNext problem: {} \"{}\" ({}, {})",
                next.id, next.title, next.concept, next.difficulty
            );
            if next.fallback_used {
                println!("  (no unseen problem matched your level; picked the closest one)");
            }
        }
        None => println!("\nNo unseen problems left for this concept."),
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    submissions: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    /// Student id or email.
    student: String,
    problem: String,
    /// Code file, relative to the manifest.
    code: PathBuf,
    #[serde(default)]
    deep: bool,
}

pub async fn execute_batch(
    manifest_path: PathBuf,
    json: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let content = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read manifest: {}", manifest_path.display()))?;
    let manifest: Manifest = toml::from_str(&content)
        .with_context(|| format!("failed to parse manifest: {}", manifest_path.display()))?;
    anyhow::ensure!(
        !manifest.submissions.is_empty(),
        "manifest lists no submissions"
    );
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let repo = super::open_repository(&config)?;
    let mut requests = Vec::with_capacity(manifest.submissions.len());
    for entry in manifest.submissions {
        let student = super::find_student(repo.as_ref(), &entry.student)?;
        let code = read_code(&base.join(&entry.code))?;
        requests.push((
            entry.student,
            SubmitRequest {
                student_id: student.id,
                problem_id: entry.problem,
                code,
                deep_explain: entry.deep,
            },
        ));
    }

    let pipeline = super::build_pipeline(&config, repo).await?;
    let total = requests.len();
    let start = Instant::now();
    eprintln!(
        "tutorloop v{}: evaluating {total} submissions ({} sandbox slots)",
        env!("CARGO_PKG_VERSION"),
        config.pipeline.concurrency.max_concurrent_sandboxes
    );

    let mut pending: FuturesUnordered<_> = requests
        .into_iter()
        .map(|(label, request)| {
            let pipeline = pipeline.clone();
            async move {
                let problem = request.problem_id.clone();
                (label, problem, pipeline.submit(request).await)
            }
        })
        .collect();

    let mut table = Table::new();
    table.set_header(vec!["Student", "Problem", "Outcome", "Pass rate", "Next"]);
    let mut failed = 0;

    while let Some((student, problem, result)) = pending.next().await {
        match result {
            Ok(outcome) => {
                if json {
                    println!("{}", serde_json::to_string(&outcome)?);
                }
                let (status, rate, next) = match &outcome {
                    PipelineOutcome::Evaluated(r) => (
                        r.status.as_str().to_string(),
                        format!("{:.0}%", r.pass_rate * 100.0),
                        r.next_problem
                            .as_ref()
                            .map(|n| n.id.clone())
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                    PipelineOutcome::Throttled { cooldown_secs } => (
                        format!("throttled ({cooldown_secs}s)"),
                        "-".to_string(),
                        "-".to_string(),
                    ),
                };
                table.add_row(vec![
                    Cell::new(&student),
                    Cell::new(&problem),
                    Cell::new(status),
                    Cell::new(rate),
                    Cell::new(next),
                ]);
            }
            Err(e) => {
                failed += 1;
                eprintln!("  ERROR: {student} :: {problem}: {e}");
                table.add_row(vec![
                    Cell::new(&student),
                    Cell::new(&problem),
                    Cell::new("error"),
                    Cell::new("-"),
                    Cell::new("-"),
                ]);
            }
        }
    }

    if !json {
        println!("{table}");
    }
    eprintln!(
        "\nComplete: {}/{total} evaluated, {failed} failed ({:.1}s)",
        total - failed,
        start.elapsed().as_secs_f64()
    );

    anyhow::ensure!(failed == 0, "{failed} submission(s) failed");
    Ok(())
}
