//! Dialect selection for source programs.
//!
//! The factory picks a dialect from a file's extension or leading shebang
//! and returns the parsed program behind the [`SourceProgram`] capability.
//! Adding an evaluator means adding a variant here, not changing callers.

use std::fs;
use std::path::Path;

use crate::linescript::LineScript;
use crate::listfile::ListProgram;
use crate::program::{ParseError, SourceProgram};

/// File extension selecting the line-script dialect.
pub const LINE_SCRIPT_EXTENSION: &str = "lscript";

/// Known source dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDialect {
    /// Native list files.
    List,
    /// Line scripts, the alternate embedded dialect.
    Line,
}

impl SourceDialect {
    /// Detects the dialect of a source: a leading shebang or the
    /// line-script extension selects [`SourceDialect::Line`]; everything
    /// else is a list file.
    #[must_use]
    pub fn detect(file_name: &str, source: &str) -> Self {
        if source.starts_with("#!") {
            return Self::Line;
        }
        let is_line_script = Path::new(file_name)
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case(LINE_SCRIPT_EXTENSION));
        if is_line_script { Self::Line } else { Self::List }
    }
}

/// Parses source text, selecting the dialect by detection.
///
/// # Errors
///
/// Returns the dialect parser's [`ParseError`] for malformed source.
pub fn parse_source(
    source: &str,
    file_name: &str,
) -> Result<Box<dyn SourceProgram>, ParseError> {
    match SourceDialect::detect(file_name, source) {
        SourceDialect::List => Ok(Box::new(ListProgram::parse(source, file_name)?)),
        SourceDialect::Line => Ok(Box::new(LineScript::parse(source, file_name)?)),
    }
}

/// Reads and parses a source file, selecting the dialect by detection.
///
/// # Errors
///
/// Returns [`ParseError::Read`] when the file cannot be read, or the
/// dialect parser's error for malformed source.
pub fn parse_file(path: &Path) -> Result<Box<dyn SourceProgram>, ParseError> {
    let source = fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_source(&source, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::list_by_default("build.kiln", "emit(a)\n", SourceDialect::List)]
    #[case::shebang_wins("build.kiln", "#!kiln lscript\nemit a\n", SourceDialect::Line)]
    #[case::extension("tasks.lscript", "emit a\n", SourceDialect::Line)]
    #[case::extension_case("tasks.LSCRIPT", "emit a\n", SourceDialect::Line)]
    fn detects_dialects(
        #[case] file_name: &str,
        #[case] source: &str,
        #[case] expected: SourceDialect,
    ) {
        assert_eq!(SourceDialect::detect(file_name, source), expected);
    }

    #[test]
    fn parses_both_dialects_behind_one_capability() {
        let list = parse_source("emit(a)\n", "build.kiln").expect("parse list");
        let line = parse_source("#!kiln\nemit a\n", "tasks.lscript").expect("parse line");
        assert_eq!(list.invocations().len(), 1);
        assert_eq!(line.invocations().len(), 1);
        assert_eq!(
            list.invocations()[0].name,
            line.invocations()[0].name
        );
    }

    #[test]
    fn parse_file_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "emit(from_disk)").expect("write");
        let program = parse_file(file.path()).expect("parse file");
        assert_eq!(program.invocations()[0].arguments[0].value, "from_disk");
    }

    #[test]
    fn parse_file_reports_missing_files() {
        let error = parse_file(Path::new("/nonexistent/kiln/build.kiln")).expect_err("must fail");
        assert!(matches!(error, ParseError::Read { .. }));
    }
}
