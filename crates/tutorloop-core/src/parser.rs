//! TOML problem bank parser.
//!
//! Loads curated problem banks from TOML files and directories, and
//! validates them.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::PipelineConfig;
use crate::model::{Difficulty, NewProblem, Problem, Provenance, TestCase};

/// A named collection of curated problems.
#[derive(Debug, Clone)]
pub struct ProblemBank {
    pub id: String,
    pub name: String,
    pub description: String,
    pub problems: Vec<Problem>,
}

/// Intermediate TOML structure for parsing problem bank files.
#[derive(Debug, Deserialize)]
struct TomlBankFile {
    bank: TomlBankHeader,
    #[serde(default)]
    problems: Vec<TomlProblem>,
}

#[derive(Debug, Deserialize)]
struct TomlBankHeader {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct TomlProblem {
    id: String,
    #[serde(default)]
    title: String,
    statement: String,
    primary_concept: String,
    #[serde(default)]
    concept_tags: Vec<String>,
    difficulty: String,
    #[serde(default)]
    difficulty_score: Option<f64>,
    #[serde(default)]
    expected_complexity: Option<String>,
    #[serde(default)]
    test_cases: Vec<TestCase>,
}

/// Parse a single TOML file into a [`ProblemBank`].
pub fn load_problem_bank(path: &Path, min_hidden_ratio: f64) -> Result<ProblemBank> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read problem bank file: {}", path.display()))?;

    parse_problem_bank_str(&content, path, min_hidden_ratio)
}

/// Parse a TOML string into a [`ProblemBank`] (useful for testing).
pub fn parse_problem_bank_str(
    content: &str,
    source_path: &Path,
    min_hidden_ratio: f64,
) -> Result<ProblemBank> {
    let parsed: TomlBankFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let problems = parsed
        .problems
        .into_iter()
        .map(|p| {
            let id = p.id.clone();
            let difficulty: Difficulty = p
                .difficulty
                .parse()
                .map_err(|e: String| anyhow::anyhow!("{}", e))
                .with_context(|| format!("problem '{id}'"))?;

            Problem::create(
                NewProblem {
                    id: p.id,
                    title: p.title,
                    statement: p.statement,
                    concept_tags: p.concept_tags,
                    primary_concept: p.primary_concept,
                    difficulty,
                    difficulty_score: p.difficulty_score,
                    test_cases: p.test_cases,
                    expected_complexity: p.expected_complexity,
                    provenance: Provenance::Curated,
                },
                min_hidden_ratio,
            )
            .with_context(|| format!("problem '{id}' in {}", source_path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ProblemBank {
        id: parsed.bank.id,
        name: parsed.bank.name,
        description: parsed.bank.description,
        problems,
    })
}

/// Recursively load all `.toml` problem bank files from a directory.
pub fn load_problem_directory(dir: &Path, min_hidden_ratio: f64) -> Result<Vec<ProblemBank>> {
    let mut banks = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();

        if path.is_dir() {
            banks.extend(load_problem_directory(&path, min_hidden_ratio)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match load_problem_bank(&path, min_hidden_ratio) {
                Ok(bank) => banks.push(bank),
                Err(e) => {
                    tracing::warn!("skipping {}: {:#}", path.display(), e);
                }
            }
        }
    }

    Ok(banks)
}

/// Load a bank file or every bank under a directory.
pub fn load_problems(path: &Path, min_hidden_ratio: f64) -> Result<Vec<ProblemBank>> {
    if path.is_dir() {
        load_problem_directory(path, min_hidden_ratio)
    } else {
        Ok(vec![load_problem_bank(path, min_hidden_ratio)?])
    }
}

/// A warning from problem bank validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The problem ID (if applicable).
    pub problem_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a problem bank for issues that would not stop it loading but
/// would hurt routing.
pub fn validate_problem_bank(
    bank: &ProblemBank,
    config: &PipelineConfig,
) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let flag = |id: &str, message: String| ValidationWarning {
        problem_id: Some(id.to_string()),
        message,
    };

    let mut seen_ids = HashSet::new();
    for problem in &bank.problems {
        if !seen_ids.insert(&problem.id) {
            warnings.push(flag(&problem.id, format!("duplicate problem ID: {}", problem.id)));
        }
    }

    for problem in &bank.problems {
        let chars = problem.statement.trim().chars().count();
        if chars < config.validation.min_statement_chars {
            warnings.push(flag(
                &problem.id,
                format!("statement is only {chars} characters"),
            ));
        }

        if !config
            .selection
            .prerequisites
            .contains_key(&problem.primary_concept)
        {
            warnings.push(flag(
                &problem.id,
                format!(
                    "concept '{}' has no prerequisite; remedial band serves '{}'",
                    problem.primary_concept, config.selection.root_concept
                ),
            ));
        }

        for (index, case) in problem.test_cases.iter().enumerate() {
            if case.output.trim().is_empty() {
                warnings.push(flag(
                    &problem.id,
                    format!("test case {index} has empty expected output"),
                ));
            }
        }

        let band = problem.difficulty.score_band();
        if !band.contains(&problem.difficulty_score) {
            warnings.push(flag(
                &problem.id,
                format!(
                    "difficulty score {:.2} outside {:.2}..={:.2} for {}",
                    problem.difficulty_score,
                    band.start(),
                    band.end(),
                    problem.difficulty
                ),
            ));
        }
    }

    let concepts: BTreeSet<&str> = bank
        .problems
        .iter()
        .map(|p| p.primary_concept.as_str())
        .collect();
    for concept in concepts {
        let has_easy = bank
            .problems
            .iter()
            .any(|p| p.primary_concept == concept && p.difficulty == Difficulty::Easy);
        if !has_easy {
            warnings.push(ValidationWarning {
                problem_id: None,
                message: format!("concept '{concept}' has no easy problem"),
            });
        }
    }

    warnings
}
