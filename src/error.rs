//! Runtime errors and stack traces.

use thiserror::Error;

use crate::ast::Span;

/// The kinds of failure the evaluator can surface to a caller.
///
/// There is no catch mechanism in the language; every error unwinds to the
/// top with the stack trace it was raised with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// The source loader rejected imported or external-variable code.
    #[error("{0}")]
    Parse(String),
    /// The source loader accepted the text but its analysis failed.
    #[error("{0}")]
    StaticAnalysis(String),
    #[error("couldn't open import {path:?}: {reason}")]
    ImportFailure { path: String, reason: String },
    #[error("max stack frames exceeded")]
    StackOverflow,
    /// An explicit `error` expression was evaluated.
    #[error("{0}")]
    UserError(String),
    #[error("{0}")]
    TypeMismatch(String),
    #[error("field does not exist: {0}")]
    MissingField(String),
    #[error("duplicate field name: {0:?}")]
    DuplicateField(String),
    #[error("{0}")]
    NumericError(String),
    #[error("{0}")]
    BoundsError(String),
    #[error("attempt to use super when there is no super class")]
    SuperAtRoot,
    #[error("couldn't manifest function in JSON output")]
    ManifestFunction,
    #[error("{0}")]
    TopLevelShape(String),
    #[error("undefined external variable: {0}")]
    UndefinedExtVar(String),
}

/// One entry of a stack trace, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub span: Span,
    /// Best-effort name for the value being executed at this frame, e.g.
    /// `function <go>` or `object <anonymous>`.
    pub name: Option<String>,
}

/// An error together with the call stack at the point of raise.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trace {
            write!(f, "\n  {}", frame.span)?;
            if let Some(name) = &frame.name {
                write!(f, "\t{}", name)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
