//! The alternate line-script dialect.
//!
//! A line script is a shebang-introduced source holding one invocation per
//! line: the first token names the command, the remaining tokens are its
//! arguments. Double quotes group words and accept backslash escapes;
//! `#` starts a comment when it begins a token.
//!
//! ```text
//! #!kiln lscript
//! set greeting "hello ${who}"
//! emit ${greeting}   # trailing comment
//! ```
//!
//! The dialect exists as a drop-in substitute evaluator: it implements the
//! same [`SourceProgram`] capability as the native list files and is chosen
//! by the dialect factory, never by callers directly.

use crate::program::{Argument, ArgumentKind, Invocation, ParseError, SourceProgram};

/// A parsed line script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineScript {
    file_name: String,
    invocations: Vec<Invocation>,
}

impl LineScript {
    /// Parses line-script source.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnterminatedQuote`] when a quoted token is
    /// never closed.
    pub fn parse(source: &str, file_name: &str) -> Result<Self, ParseError> {
        let mut invocations = Vec::new();
        for (index, raw_line) in source.lines().enumerate() {
            let line = i64::try_from(index).unwrap_or(i64::MAX).saturating_add(1);
            if index == 0 && raw_line.starts_with("#!") {
                continue;
            }
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut tokens = tokenize(trimmed, file_name, line)?;
            if tokens.is_empty() {
                continue;
            }
            let name = tokens.remove(0).value;
            invocations.push(Invocation {
                name,
                line,
                arguments: tokens,
            });
        }
        Ok(Self {
            file_name: file_name.to_owned(),
            invocations,
        })
    }
}

impl SourceProgram for LineScript {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }
}

fn tokenize(input: &str, path: &str, line: i64) -> Result<Vec<Argument>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&next) = chars.peek() {
        if next.is_whitespace() {
            chars.next();
            continue;
        }
        if next == '#' {
            break;
        }
        if next == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    None => {
                        return Err(ParseError::UnterminatedQuote {
                            path: path.to_owned(),
                            line,
                        });
                    }
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some(other) => value.push(other),
                        None => {
                            return Err(ParseError::UnterminatedQuote {
                                path: path.to_owned(),
                                line,
                            });
                        }
                    },
                    Some(other) => value.push(other),
                }
            }
            tokens.push(Argument::new(value, ArgumentKind::Quoted, line));
            continue;
        }
        let mut value = String::new();
        while let Some(&inner) = chars.peek() {
            if inner.is_whitespace() || inner == '"' {
                break;
            }
            value.push(inner);
            chars.next();
        }
        tokens.push(Argument::new(value, ArgumentKind::Unquoted, line));
    }
    Ok(tokens)
}
