//! Subcommand implementations and the wiring they share.

pub mod dashboard;
pub mod escalations;
pub mod init;
pub mod profile;
pub mod register;
pub mod seed;
pub mod submit;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use tutorloop_core::engine::{Collaborators, Pipeline};
use tutorloop_core::model::Student;
use tutorloop_core::repository::Repository;
use tutorloop_providers::{create_collaborators, load_config_from, TutorloopConfig};
use tutorloop_runner::LocalRunner;
use tutorloop_store::SqliteRepository;

/// Load and sanity-check the configuration.
pub fn load(config_path: Option<&Path>) -> Result<TutorloopConfig> {
    let config = load_config_from(config_path)?;
    config.pipeline.validate().context("invalid [pipeline] configuration")?;
    Ok(config)
}

pub fn open_repository(config: &TutorloopConfig) -> Result<Arc<SqliteRepository>> {
    if let Some(parent) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(Arc::new(SqliteRepository::open(&config.database)?))
}

/// Look a student up by id, or by email when the key contains `@`.
pub fn find_student(repo: &dyn Repository, key: &str) -> Result<Student> {
    let found = if key.contains('@') {
        repo.student_by_email(&key.trim().to_lowercase())?
    } else {
        repo.student(key)?
    };
    found.with_context(|| format!("no student '{key}'; register one with `tutorloop register`"))
}

/// Wire the pipeline: SQLite store, local Python sandbox, Ollama collaborators.
pub async fn build_pipeline(
    config: &TutorloopConfig,
    repo: Arc<SqliteRepository>,
) -> Result<Pipeline> {
    let runner = LocalRunner::new(config.pipeline.sandbox.clone());
    if !runner.available().await {
        tracing::warn!(
            python = %config.pipeline.sandbox.python,
            "python interpreter not found; every submission will report a crash"
        );
    }
    let (feedback, deep) = create_collaborators(config)?;

    Ok(Pipeline::new(
        config.pipeline.clone(),
        Collaborators {
            repository: repo,
            executor: Arc::new(runner),
            feedback,
            deep,
        },
    ))
}
