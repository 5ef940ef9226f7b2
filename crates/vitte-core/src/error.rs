//! error.rs — the three-kind error taxonomy from `SPEC_FULL.md` §7.
//!
//! `vitte-core` never panics its way out of a user-triggered failure (lex
//! error, parse error, semantic compile error, runtime error); those all
//! become a `VitteError` variant. A library panic stays a panic — it means
//! an internal invariant broke, not that the user's script is bad.

use thiserror::Error;

/// One diagnosed problem in source text, with its 1-based line.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

/// Lexing, parsing, and semantic-compile errors are all surfaced the same
/// way: the compiler keeps parsing past the first one (`synchronize`) so a
/// single `vitte-core` call can report every diagnostic in a source file
/// at once, matching clox's "keep going, but don't run broken bytecode"
/// behavior (`hadError` gates execution; `panicMode` only gates *reporting*).
#[derive(Debug, Error)]
#[error("compile failed with {} diagnostic(s)", diagnostics.len())]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

/// One call frame's contribution to a runtime error's stack trace, printed
/// innermost-first, matching clox's `runtimeError` loop.
#[derive(Debug, Clone)]
pub struct FrameTrace {
    pub line: u32,
    pub function_name: String,
}

impl std::fmt::Display for FrameTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.function_name.is_empty() {
            write!(f, "[line {}] in script", self.line)
        } else {
            write!(f, "[line {}] in {}()", self.line, self.function_name)
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<FrameTrace>,
}

/// Top-level error `Vm::interpret` returns; the CLI matches on this to
/// choose an exit code (§6).
#[derive(Debug, Error)]
pub enum VitteError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
