//! The `tutorloop seed` command.

use std::path::PathBuf;

use anyhow::Result;

use tutorloop_core::parser;
use tutorloop_core::repository::Repository;

pub fn execute(bank: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let path = bank.unwrap_or_else(|| config.problem_bank.clone());
    let banks = parser::load_problems(&path, config.pipeline.min_hidden_ratio)?;
    let repo = super::open_repository(&config)?;

    let mut seeded = 0;
    for bank in &banks {
        for problem in &bank.problems {
            repo.insert_problem(problem)?;
        }
        tracing::info!(bank = %bank.id, problems = bank.problems.len(), "seeded problem bank");
        seeded += bank.problems.len();
    }

    println!(
        "Seeded {seeded} problem(s) from {} bank(s) into {}",
        banks.len(),
        config.database.display()
    );
    Ok(())
}
