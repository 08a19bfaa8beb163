//! The source-program capability and the engine callback contract.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::backtrace::{Backtrace, Backtrace as TracedChain, SourceContext};

/// Tracing target for evaluation operations.
pub(crate) const EVAL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::program");

/// How an invocation argument was delimited in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentKind {
    /// Bare token.
    Unquoted,
    /// Double-quoted string.
    Quoted,
    /// Bracket-delimited literal; never subject to variable expansion.
    Bracket,
}

/// One argument of a parsed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Argument {
    /// Argument text with delimiters removed and escapes applied.
    pub value: String,
    /// How the argument was delimited.
    pub kind: ArgumentKind,
    /// Line the argument starts on.
    pub line: i64,
}

impl Argument {
    /// Builds an argument from its parts.
    #[must_use]
    pub fn new(value: impl Into<String>, kind: ArgumentKind, line: i64) -> Self {
        Self {
            value: value.into(),
            kind,
            line,
        }
    }
}

/// One parsed command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    /// Command name as written.
    pub name: String,
    /// Line the invocation starts on.
    pub line: i64,
    /// Arguments in source order.
    pub arguments: Vec<Argument>,
}

impl Invocation {
    /// Command name folded to lowercase, the canonical lookup form.
    #[must_use]
    pub fn lowercase_name(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Outcome reported by the engine for one executed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Proceed to the next invocation.
    Continue,
    /// Stop executing the remaining invocations, successfully.
    Return,
    /// Abort execution with an error message.
    Error(String),
}

/// Command-execution callback supplied by the external engine.
pub type CommandExecutor<'a> = dyn Fn(&Invocation) -> ExecutionStatus + 'a;

/// Variable-resolution callback supplied by the external engine. Returns
/// `None` when the variable is not defined.
pub type VariableResolver<'a> = dyn Fn(&str) -> Option<String> + 'a;

/// Totals reported after executing a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    /// Invocations forwarded to the executor.
    pub executed: usize,
    /// Whether the engine requested an early return.
    pub returned_early: bool,
}

/// A parsed source program ready for execution against an engine.
///
/// Both dialects implement this capability; callers obtain an instance
/// through the dialect factory and never branch on the concrete type.
pub trait SourceProgram: Send + std::fmt::Debug {
    /// File the program was parsed from (possibly virtual).
    fn file_name(&self) -> &str;

    /// Parsed invocations in source order.
    fn invocations(&self) -> &[Invocation];

    /// Executes every invocation against the engine callbacks.
    ///
    /// Arguments other than bracket literals have their `${name}`
    /// references expanded through `resolver` before the invocation is
    /// forwarded to `executor`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Command`] when the executor reports an error
    /// status; the attached backtrace identifies the failing invocation.
    fn execute(
        &self,
        executor: &CommandExecutor<'_>,
        resolver: &VariableResolver<'_>,
        backtrace: &Backtrace,
    ) -> Result<ExecutionSummary, EvalError> {
        run_invocations(
            self.file_name(),
            self.invocations(),
            executor,
            resolver,
            backtrace,
        )
    }
}

/// Errors surfaced while parsing a source program.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Source could not be read from disk.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// Path that could not be read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// A quoted argument was never closed.
    #[error("{path}:{line}: unterminated quoted argument")]
    UnterminatedQuote {
        /// File being parsed.
        path: String,
        /// Line the quote opened on.
        line: i64,
    },
    /// A bracket argument was never closed.
    #[error("{path}:{line}: unterminated bracket argument")]
    UnterminatedBracket {
        /// File being parsed.
        path: String,
        /// Line the bracket opened on.
        line: i64,
    },
    /// An invocation was missing its argument list.
    #[error("{path}:{line}: expected '(' after command '{name}'")]
    MissingArguments {
        /// File being parsed.
        path: String,
        /// Line of the offending invocation.
        line: i64,
        /// Command name.
        name: String,
    },
    /// An argument list was never closed.
    #[error("{path}:{line}: unterminated argument list for '{name}'")]
    UnterminatedArguments {
        /// File being parsed.
        path: String,
        /// Line of the offending invocation.
        line: i64,
        /// Command name.
        name: String,
    },
    /// A character that cannot start a command was found.
    #[error("{path}:{line}: unexpected character '{found}'")]
    UnexpectedCharacter {
        /// File being parsed.
        path: String,
        /// Line of the offending character.
        line: i64,
        /// The character found.
        found: char,
    },
}

/// Errors surfaced while executing a source program.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The engine reported an error for an invocation.
    #[error("{name} at {path}:{line}: {message}")]
    Command {
        /// Failing command name.
        name: String,
        /// File the command lives in.
        path: String,
        /// Line of the failing command.
        line: i64,
        /// Engine-reported message.
        message: String,
        /// Call chain leading to the failure.
        backtrace: TracedChain,
    },
}

pub(crate) fn run_invocations(
    file_name: &str,
    invocations: &[Invocation],
    executor: &CommandExecutor<'_>,
    resolver: &VariableResolver<'_>,
    backtrace: &Backtrace,
) -> Result<ExecutionSummary, EvalError> {
    let mut executed = 0;
    for invocation in invocations {
        let expanded = expand_invocation(invocation, resolver);
        let frame = backtrace.push(SourceContext::new(
            expanded.name.clone(),
            file_name,
            expanded.line,
        ));
        debug!(
            target: EVAL_TARGET,
            command = %expanded.name,
            line = expanded.line,
            "executing invocation"
        );
        executed += 1;
        match executor(&expanded) {
            ExecutionStatus::Continue => {}
            ExecutionStatus::Return => {
                return Ok(ExecutionSummary {
                    executed,
                    returned_early: true,
                });
            }
            ExecutionStatus::Error(message) => {
                return Err(EvalError::Command {
                    name: expanded.name,
                    path: file_name.to_owned(),
                    line: expanded.line,
                    message,
                    backtrace: frame,
                });
            }
        }
    }
    Ok(ExecutionSummary {
        executed,
        returned_early: false,
    })
}

fn expand_invocation(invocation: &Invocation, resolver: &VariableResolver<'_>) -> Invocation {
    let arguments = invocation
        .arguments
        .iter()
        .map(|argument| match argument.kind {
            ArgumentKind::Bracket => argument.clone(),
            ArgumentKind::Unquoted | ArgumentKind::Quoted => Argument {
                value: expand_variables(&argument.value, resolver),
                kind: argument.kind,
                line: argument.line,
            },
        })
        .collect();
    Invocation {
        name: invocation.name.clone(),
        line: invocation.line,
        arguments,
    }
}

/// Replaces each `${name}` reference with the resolver's value, or the
/// empty string when the variable is absent. Expansion is a single pass:
/// substituted text is not re-scanned.
fn expand_variables(input: &str, resolver: &VariableResolver<'_>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        output.push_str(head);
        match tail[2..].find('}') {
            Some(end) => {
                let name = &tail[2..2 + end];
                if let Some(value) = resolver(name) {
                    output.push_str(&value);
                }
                rest = &tail[2 + end + 1..];
            }
            None => {
                output.push_str(tail);
                return output;
            }
        }
    }
    output.push_str(rest);
    output
}
