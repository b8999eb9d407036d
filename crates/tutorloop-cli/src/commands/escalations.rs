//! The `tutorloop escalations` commands.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use tutorloop_core::repository::Repository;

pub fn list(all: bool, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let repo = super::open_repository(&config)?;
    let entries = repo.escalations(!all)?;

    if entries.is_empty() {
        println!("No escalations.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Id", "Logged", "Student", "Problem", "Reason", "Resolved"]);
    for e in &entries {
        table.add_row(vec![
            Cell::new(&e.id),
            Cell::new(e.logged_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&e.student_id),
            Cell::new(&e.problem_id),
            Cell::new(e.reason),
            Cell::new(if e.resolved { "yes" } else { "no" }),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn resolve(id: String, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let repo = super::open_repository(&config)?;

    anyhow::ensure!(repo.resolve_escalation(&id)?, "no escalation with id '{id}'");
    println!("Resolved escalation {id}");
    Ok(())
}
