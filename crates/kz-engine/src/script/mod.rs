//! Instrument scripts: a small event-handler language compiled to
//! bytecode and run by a per-channel runtime with resumable callbacks.

pub mod builtins;
#[cfg(feature = "std")]
mod cache;
mod compiler;
mod lexer;
mod parser;
mod script_id;
mod vm;

#[cfg(feature = "std")]
pub use cache::ProgramCache;
pub use compiler::Program;
pub use parser::HandlerKind;
pub use script_id::ScriptId;
pub use vm::{CallbackInfo, Outcome, Resume, ScriptHost, ScriptRuntime};

use crate::error::ScriptError;

/// Tokenize, parse and compile a script.
pub fn compile_source(source: &str) -> Result<Program, ScriptError> {
    let tokens = lexer::tokenize(source)?;
    let handlers = parser::parse(tokens)?;
    compiler::compile(&handlers)
}
