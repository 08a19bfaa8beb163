//! The native list-file dialect.
//!
//! A list file is a sequence of command invocations:
//!
//! ```text
//! # comment
//! add_rule(name "quoted ${var}" [=[bracket literal]=])
//! ```
//!
//! Arguments are unquoted tokens, double-quoted strings with backslash
//! escapes, or bracket literals `[=*[ ... ]=*]` whose content is taken
//! verbatim and never variable-expanded.

use crate::program::{Argument, ArgumentKind, Invocation, ParseError, SourceProgram};

/// A parsed list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListProgram {
    file_name: String,
    invocations: Vec<Invocation>,
}

impl ListProgram {
    /// Parses list-file source.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] naming `file_name` and the offending line
    /// when the source is malformed.
    pub fn parse(source: &str, file_name: &str) -> Result<Self, ParseError> {
        let mut scanner = Scanner::new(source, file_name);
        let mut invocations = Vec::new();
        loop {
            scanner.skip_trivia();
            let Some(first) = scanner.peek() else {
                break;
            };
            if !first.is_ascii_alphabetic() && first != '_' {
                return Err(ParseError::UnexpectedCharacter {
                    path: file_name.to_owned(),
                    line: scanner.line,
                    found: first,
                });
            }
            invocations.push(scanner.invocation()?);
        }
        Ok(Self {
            file_name: file_name.to_owned(),
            invocations,
        })
    }
}

impl SourceProgram for ListProgram {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }
}

struct Scanner<'a> {
    chars: Vec<char>,
    pos: usize,
    line: i64,
    path: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(source: &str, path: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            path,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.peek()?;
        self.pos += 1;
        if next == '\n' {
            self.line += 1;
        }
        Some(next)
    }

    /// Skips whitespace and line comments.
    fn skip_trivia(&mut self) {
        while let Some(next) = self.peek() {
            if next.is_whitespace() {
                self.bump();
            } else if next == '#' {
                self.skip_line_comment();
            } else {
                break;
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(next) = self.peek() {
            if next == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn invocation(&mut self) -> Result<Invocation, ParseError> {
        let line = self.line;
        let name = self.identifier();

        self.skip_trivia();
        if self.peek() != Some('(') {
            return Err(ParseError::MissingArguments {
                path: self.path.to_owned(),
                line: self.line,
                name,
            });
        }
        self.bump();

        let mut arguments = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(ParseError::UnterminatedArguments {
                        path: self.path.to_owned(),
                        line,
                        name,
                    });
                }
                Some(')') => {
                    self.bump();
                    break;
                }
                Some('"') => arguments.push(self.quoted_argument()?),
                Some('[') if self.bracket_opening().is_some() => {
                    arguments.push(self.bracket_argument()?);
                }
                Some(_) => arguments.push(self.unquoted_argument()),
            }
        }

        Ok(Invocation {
            name,
            line,
            arguments,
        })
    }

    fn identifier(&mut self) -> String {
        let mut name = String::new();
        while let Some(next) = self.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                self.bump();
            } else {
                break;
            }
        }
        name
    }

    fn quoted_argument(&mut self) -> Result<Argument, ParseError> {
        let line = self.line;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(ParseError::UnterminatedQuote {
                        path: self.path.to_owned(),
                        line,
                    });
                }
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => {
                        return Err(ParseError::UnterminatedQuote {
                            path: self.path.to_owned(),
                            line,
                        });
                    }
                },
                Some(other) => value.push(other),
            }
        }
        Ok(Argument::new(value, ArgumentKind::Quoted, line))
    }

    /// Returns the `=` count when the scanner sits on a bracket opener.
    fn bracket_opening(&self) -> Option<usize> {
        let mut offset = self.pos + 1;
        let mut equals = 0;
        while self.chars.get(offset) == Some(&'=') {
            equals += 1;
            offset += 1;
        }
        (self.chars.get(offset) == Some(&'[')).then_some(equals)
    }

    fn bracket_argument(&mut self) -> Result<Argument, ParseError> {
        let line = self.line;
        let equals = self.bracket_opening().unwrap_or(0);
        for _ in 0..equals + 2 {
            self.bump();
        }

        let closer: Vec<char> = std::iter::once(']')
            .chain(std::iter::repeat_n('=', equals))
            .chain(std::iter::once(']'))
            .collect();

        let mut value = String::new();
        loop {
            if self.chars.len() < self.pos + closer.len() {
                return Err(ParseError::UnterminatedBracket {
                    path: self.path.to_owned(),
                    line,
                });
            }
            if self.chars[self.pos..self.pos + closer.len()] == closer[..] {
                for _ in 0..closer.len() {
                    self.bump();
                }
                break;
            }
            match self.bump() {
                Some(next) => value.push(next),
                None => {
                    return Err(ParseError::UnterminatedBracket {
                        path: self.path.to_owned(),
                        line,
                    });
                }
            }
        }
        Ok(Argument::new(value, ArgumentKind::Bracket, line))
    }

    fn unquoted_argument(&mut self) -> Argument {
        let line = self.line;
        let mut value = String::new();
        while let Some(next) = self.peek() {
            if next.is_whitespace() || matches!(next, '(' | ')' | '"' | '#') {
                break;
            }
            value.push(next);
            self.bump();
        }
        Argument::new(value, ArgumentKind::Unquoted, line)
    }
}
