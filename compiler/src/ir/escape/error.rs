//! Escape analysis errors

use std::path::PathBuf;

/// Errors raised while analyzing or transforming a method, or while handling
/// the summary cache and configuration
#[derive(Debug, thiserror::Error)]
pub enum EscapeError {
    /// The method contains something the analysis cannot model. The caller
    /// abandons optimization of this method and keeps its unoptimized body.
    #[error("escape analysis failed in {method}: {context}")]
    CompilerFailure { method: String, context: String },

    #[error("invalid escape analysis configuration: {0}")]
    Config(String),

    #[error("cannot read or write summary cache {path}: {source}")]
    SummaryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed summary cache: {0}")]
    SummaryFormat(String),
}

impl EscapeError {
    pub fn failure(method: impl Into<String>, context: impl Into<String>) -> Self {
        EscapeError::CompilerFailure {
            method: method.into(),
            context: context.into(),
        }
    }

    pub fn is_compiler_failure(&self) -> bool {
        matches!(self, EscapeError::CompilerFailure { .. })
    }
}

impl From<postcard::Error> for EscapeError {
    fn from(e: postcard::Error) -> Self {
        EscapeError::SummaryFormat(e.to_string())
    }
}

impl From<toml::de::Error> for EscapeError {
    fn from(e: toml::de::Error) -> Self {
        EscapeError::Config(e.to_string())
    }
}

pub type EscapeResult<T> = Result<T, EscapeError>;
