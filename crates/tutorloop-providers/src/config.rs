//! Application configuration and collaborator factory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tutorloop_core::config::PipelineConfig;
use tutorloop_core::traits::{DeepExplainer, FastFeedback, LlmProvider};

use crate::collaborators::{LlmDeepExplainer, LlmFastFeedback};
use crate::ollama::{OllamaProvider, DEFAULT_BASE_URL};

/// Model and sampling settings for one collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Budget for one completion, after which the collaborator falls back.
    pub timeout_ms: u64,
}

impl ModelSettings {
    pub fn fast_feedback() -> Self {
        Self {
            model: "qwen2.5-coder:1.5b-instruct".to_string(),
            max_tokens: 200,
            temperature: 0.3,
            timeout_ms: 3_000,
        }
    }

    pub fn deep_explanation() -> Self {
        Self {
            model: "qwen2.5-coder:7b-instruct".to_string(),
            max_tokens: 1500,
            temperature: 0.4,
            timeout_ms: 30_000,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Top-level tutorloop configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TutorloopConfig {
    pub ollama: OllamaConfig,
    pub feedback: ModelSettings,
    pub deep: ModelSettings,
    /// SQLite database file.
    pub database: PathBuf,
    /// Problem bank file or directory.
    pub problem_bank: PathBuf,
    pub pipeline: PipelineConfig,
}

impl Default for TutorloopConfig {
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            feedback: ModelSettings::fast_feedback(),
            deep: ModelSettings::deep_explanation(),
            database: PathBuf::from("tutorloop.db"),
            problem_bank: PathBuf::from("problem-banks"),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// On-disk shape: every key optional, model tables merged over the
/// per-collaborator defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    ollama: Option<OllamaConfig>,
    feedback: ModelOverrides,
    deep: ModelOverrides,
    database: Option<String>,
    problem_bank: Option<String>,
    pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelOverrides {
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    timeout_ms: Option<u64>,
}

impl ModelOverrides {
    fn apply(self, base: ModelSettings) -> ModelSettings {
        ModelSettings {
            model: self.model.map(|m| resolve_env_vars(&m)).unwrap_or(base.model),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            temperature: self.temperature.unwrap_or(base.temperature),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
        }
    }
}

impl From<ConfigFile> for TutorloopConfig {
    fn from(file: ConfigFile) -> Self {
        let defaults = TutorloopConfig::default();
        Self {
            ollama: OllamaConfig {
                base_url: file
                    .ollama
                    .map(|o| resolve_env_vars(&o.base_url))
                    .unwrap_or(defaults.ollama.base_url),
            },
            feedback: file.feedback.apply(defaults.feedback),
            deep: file.deep.apply(defaults.deep),
            database: file
                .database
                .map(|d| PathBuf::from(resolve_env_vars(&d)))
                .unwrap_or(defaults.database),
            problem_bank: file
                .problem_bank
                .map(|p| PathBuf::from(resolve_env_vars(&p)))
                .unwrap_or(defaults.problem_bank),
            pipeline: file.pipeline.unwrap_or(defaults.pipeline),
        }
    }
}

/// Parse configuration text. `source` names the origin in error messages.
pub fn parse_config(content: &str, source: &Path) -> Result<TutorloopConfig> {
    let file: ConfigFile = toml::from_str(content)
        .with_context(|| format!("failed to parse config: {}", source.display()))?;
    Ok(file.into())
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
/// Unset variables expand to the empty string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!(
                "{}{}{}",
                &result[..start],
                value,
                &result[start + end + 1..]
            );
        } else {
            break;
        }
    }
    result
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `tutorloop.toml` in the current directory
/// 2. `~/.config/tutorloop/config.toml`
///
/// Environment variable overrides: `TUTORLOOP_OLLAMA_URL`, `TUTORLOOP_DATABASE`.
pub fn load_config() -> Result<TutorloopConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<TutorloopConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("tutorloop.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config");
            parse_config(&content, &path)?
        }
        None => TutorloopConfig::default(),
    };

    if let Ok(url) = std::env::var("TUTORLOOP_OLLAMA_URL") {
        config.ollama.base_url = url;
    }
    if let Ok(db) = std::env::var("TUTORLOOP_DATABASE") {
        config.database = PathBuf::from(db);
    }

    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("tutorloop"))
}

/// The LLM backend named by the configuration.
pub fn create_provider(config: &TutorloopConfig) -> Result<Arc<dyn LlmProvider>> {
    Ok(Arc::new(OllamaProvider::new(&config.ollama.base_url)?))
}

/// Both tutoring collaborators, sharing one backend.
pub fn create_collaborators(
    config: &TutorloopConfig,
) -> Result<(Arc<dyn FastFeedback>, Arc<dyn DeepExplainer>)> {
    let provider = create_provider(config)?;
    Ok((
        Arc::new(LlmFastFeedback::new(provider.clone(), config.feedback.clone())),
        Arc::new(LlmDeepExplainer::new(provider, config.deep.clone())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_vars_basic() {
        std::env::set_var("_TUTORLOOP_TEST_VAR", "hello");
        assert_eq!(resolve_env_vars("${_TUTORLOOP_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix_${_TUTORLOOP_TEST_VAR}_suffix"),
            "prefix_hello_suffix"
        );
        assert_eq!(resolve_env_vars("${_TUTORLOOP_SURELY_UNSET}x"), "x");
        assert_eq!(resolve_env_vars("${unterminated"), "${unterminated");
        std::env::remove_var("_TUTORLOOP_TEST_VAR");
    }

    #[test]
    fn default_config() {
        let config = TutorloopConfig::default();
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert_eq!(config.feedback.model, "qwen2.5-coder:1.5b-instruct");
        assert_eq!(config.deep.timeout_ms, 30_000);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn partial_tables_keep_collaborator_defaults() {
        let toml_str = r#"
database = "/var/lib/tutorloop/${_TUTORLOOP_CFG_DIR}.db"

[ollama]
base_url = "http://gpu-box:11434"

[deep]
model = "qwen2.5-coder:14b-instruct"

[pipeline.capability]
initial_score = 0.4
"#;
        std::env::set_var("_TUTORLOOP_CFG_DIR", "prod");
        let config = parse_config(toml_str, Path::new("tutorloop.toml")).unwrap();
        std::env::remove_var("_TUTORLOOP_CFG_DIR");

        assert_eq!(config.ollama.base_url, "http://gpu-box:11434");
        assert_eq!(config.database, PathBuf::from("/var/lib/tutorloop/prod.db"));
        assert_eq!(config.deep.model, "qwen2.5-coder:14b-instruct");
        assert_eq!(config.deep.max_tokens, 1500);
        assert_eq!(config.feedback, ModelSettings::fast_feedback());
        assert_eq!(config.pipeline.capability.initial_score, 0.4);
        assert_eq!(config.pipeline.sandbox.case_timeout_ms, 5_000);
    }

    #[test]
    fn load_explicit_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "problem_bank = \"banks/intro.toml\"\n").unwrap();

        let config = load_config_from(Some(&path)).unwrap();
        assert_eq!(config.problem_bank, PathBuf::from("banks/intro.toml"));

        assert!(load_config_from(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let err = parse_config("[ollama\nbase_url = 1", Path::new("bad.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
