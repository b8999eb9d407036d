//! The `tutorloop profile` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use tutorloop_core::statistics::student_profile;

pub fn execute(
    student: String,
    recent: usize,
    json: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let repo = super::open_repository(&config)?;
    let student = super::find_student(repo.as_ref(), &student)?;

    let profile = student_profile(
        repo.as_ref(),
        &student.id,
        &config.pipeline.selection,
        recent,
    )?
    .with_context(|| format!("student '{}' disappeared", student.id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }

    println!("{} <{}>", profile.student.name, profile.student.email);
    println!(
        "{} submission(s), {} escalation(s), {} gaming flag(s)",
        profile.submission_count, profile.escalation_count, profile.gaming_flag_count
    );

    if profile.concepts.is_empty() {
        println!("\nNo capability scores yet.");
    } else {
        let mut table = Table::new();
        table.set_header(vec!["Concept", "Score", "Zone", "Updated"]);
        for c in &profile.concepts {
            table.add_row(vec![
                Cell::new(&c.concept),
                Cell::new(format!("{:.3}", c.score)),
                Cell::new(c.zone),
                Cell::new(c.updated_at.format("%Y-%m-%d %H:%M")),
            ]);
        }
        println!("\n{table}");
        if let (Some(weakest), Some(strongest), Some(mean)) =
            (&profile.weakest, &profile.strongest, profile.mean_score)
        {
            println!("Weakest: {weakest}  Strongest: {strongest}  Mean: {mean:.3}");
        }
    }

    if !profile.recent.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Submitted", "Problem", "Status", "Pass rate", "Issue", "Flags"]);
        for s in &profile.recent {
            let mut flags = Vec::new();
            if let Some(reason) = s.escalation_reason {
                flags.push(format!("escalated: {reason}"));
            }
            if s.gaming_flagged {
                flags.push("gaming".to_string());
            }
            table.add_row(vec![
                Cell::new(s.submitted_at.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(&s.problem_id),
                Cell::new(s.status.as_str()),
                Cell::new(format!("{:.0}%", s.pass_rate * 100.0)),
                Cell::new(s.error_class),
                Cell::new(flags.join(", ")),
            ]);
        }
        println!("\n{table}");
    }

    Ok(())
}
