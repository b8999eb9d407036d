//! The `tutorloop validate` command.

use std::path::PathBuf;

use anyhow::Result;

use tutorloop_core::parser;

pub fn execute(bank: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load(config_path.as_deref())?;
    let path = bank.unwrap_or_else(|| config.problem_bank.clone());
    let banks = parser::load_problems(&path, config.pipeline.min_hidden_ratio)?;

    if banks.is_empty() {
        anyhow::bail!("no problem banks found under {}", path.display());
    }

    let mut total_warnings = 0;

    for bank in &banks {
        println!("Problem bank: {} ({} problems)", bank.name, bank.problems.len());

        let warnings = parser::validate_problem_bank(bank, &config.pipeline);
        for w in &warnings {
            let prefix = w
                .problem_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All problem banks valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
