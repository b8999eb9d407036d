//! Pure decision components of the evaluation pipeline.
//!
//! Nothing in here performs I/O except [`validator`], which runs reference
//! solutions through a [`crate::traits::CodeExecutor`].

pub mod capability;
pub mod escalation;
pub mod features;
pub mod guard;
pub mod lexer;
pub mod selector;
pub mod validator;
