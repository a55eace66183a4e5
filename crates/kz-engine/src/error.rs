//! Errors of the non-real-time engine surface.

use alloc::string::String;

/// Script compilation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Lex { line: u32, message: String },

    #[error("line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("line {line}: unknown identifier `{name}`")]
    UnknownIdentifier { line: u32, name: String },

    #[error("line {line}: unknown function `{name}`")]
    UnknownFunction { line: u32, name: String },

    #[error("line {line}: `{name}` takes {min}..={max} arguments, got {got}")]
    ArgumentCount { line: u32, name: String, min: u8, max: u8, got: usize },

    #[error("line {line}: too many variables")]
    TooManyVariables { line: u32 },

    #[error("line {line}: cannot assign to `{name}`")]
    NotAssignable { line: u32, name: String },
}

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("timed out waiting for the audio thread")]
    Timeout,

    #[error("no engine channel {0}")]
    InvalidChannel(u16),

    #[error("invalid engine configuration: {0}")]
    Config(&'static str),
}
