//! tutorloop-providers: LLM backends and tutoring collaborators.
//!
//! Implements `LlmProvider` for Ollama and builds the fast-feedback and
//! deep-explanation collaborators on top of it.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod mock;
pub mod ollama;

pub use collaborators::{LlmDeepExplainer, LlmFastFeedback};
pub use config::{
    create_collaborators, create_provider, load_config, load_config_from, ModelSettings,
    TutorloopConfig,
};
pub use error::ProviderError;
