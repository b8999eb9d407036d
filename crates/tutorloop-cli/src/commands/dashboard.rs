//! The `tutorloop dashboard` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use tutorloop_core::statistics::dashboard;

pub fn execute(json: bool, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let repo = super::open_repository(&config)?;
    let board = dashboard(repo.as_ref(), &config.pipeline.selection)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&board)?);
        return Ok(());
    }

    println!(
        "Students: {}  Submissions: {}  Problems: {} ({} generated)",
        board.total_students,
        board.total_submissions,
        board.total_problems,
        board.generated_problems
    );
    println!(
        "Escalation rate: {:.1}%  Gaming flag rate: {:.1}%  Unresolved escalations: {}",
        board.escalation_rate * 100.0,
        board.gaming_flag_rate * 100.0,
        board.unresolved_escalations
    );

    if board.concepts.is_empty() {
        println!("\nNo capability scores yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Concept", "Students", "Mean", "Min", "Max", "Zone 0", "Zone 1", "Zone 2", "Zone 3",
    ]);
    for c in &board.concepts {
        let mut row = vec![
            Cell::new(&c.concept),
            Cell::new(c.students),
            Cell::new(format!("{:.3}", c.mean)),
            Cell::new(format!("{:.3}", c.min)),
            Cell::new(format!("{:.3}", c.max)),
        ];
        row.extend(c.zones.iter().map(|n| Cell::new(n)));
        table.add_row(row);
    }
    println!("\n{table}");

    Ok(())
}
