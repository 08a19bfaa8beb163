//! Evaluation-engine seam for the kiln daemon.
//!
//! The daemon never interprets build sources itself: it parses them into
//! invocation lists and forwards each invocation to an external engine
//! through a command-execution callback, resolving variable references
//! through a companion lookup callback. This crate owns that seam: the
//! shared [`Backtrace`] diagnostics chain, the [`SourceProgram`] capability
//! implemented by both source dialects, and the factory that selects a
//! dialect from a file's extension or content.

mod backtrace;
mod dialect;
mod linescript;
mod listfile;
mod program;

pub use backtrace::{Backtrace, SourceContext, Traced};
pub use dialect::{LINE_SCRIPT_EXTENSION, SourceDialect, parse_file, parse_source};
pub use linescript::LineScript;
pub use listfile::ListProgram;
pub use program::{
    Argument, ArgumentKind, CommandExecutor, EvalError, ExecutionStatus, ExecutionSummary,
    Invocation, ParseError, SourceProgram, VariableResolver,
};
