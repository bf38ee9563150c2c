use miette::{Diagnostic, SourceOffset, SourceSpan};

pub mod compile;
pub mod frame;
pub mod syntax;
pub mod value;

pub use compile::CompileError;
pub use frame::FrameError;
pub use syntax::SyntaxError;
pub use value::ValueError;

use crate::lexer::error::LexerError;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum InnerError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Represents a high-level error with diagnostic information for the user.
#[derive(PartialEq, Debug, thiserror::Error)]
#[error("{cause}")]
pub struct Error {
    /// The underlying cause of the error.
    pub cause: InnerError,
    /// The source code related to the error.
    pub source_code: String,
    /// The location in the source code for diagnostics.
    pub location: SourceSpan,
}

impl Error {
    /// Builds a diagnostic spanning the 1-based `line` of `source_code`.
    ///
    /// Line 0 (no source position, e.g. framing errors) points at the start
    /// of the input.
    pub fn from_error(source_code: impl Into<String>, cause: InnerError, line: usize) -> Self {
        let source_code = source_code.into();
        let line_count = source_code.lines().count();

        let location = if line == 0 || line_count == 0 {
            SourceSpan::new(SourceOffset::from(0), 1)
        } else {
            let line = line.min(line_count);
            let width = source_code
                .lines()
                .nth(line - 1)
                .map(|l| l.len())
                .unwrap_or(0);
            SourceSpan::new(
                SourceOffset::from_location(&source_code, line, 1),
                std::cmp::max(width, 1),
            )
        };

        Self {
            cause,
            source_code,
            location,
        }
    }

    pub fn line(&self) -> usize {
        self.source_code[..self.location.offset().min(self.source_code.len())]
            .matches('\n')
            .count()
            + 1
    }
}

impl Diagnostic for Error {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let c = match &self.cause {
            InnerError::Lexer(LexerError::InvalidToken { .. }) => "LexerError::InvalidToken",
            InnerError::Syntax(err) => match err {
                SyntaxError::MissingClosingObjectBracket => "SyntaxError::MissingClosingObjectBracket",
                SyntaxError::MissingClosingArrayBracket => "SyntaxError::MissingClosingArrayBracket",
                SyntaxError::MissingClosingBracket => "SyntaxError::MissingClosingBracket",
                SyntaxError::InvalidClosingObjectBracket => "SyntaxError::InvalidClosingObjectBracket",
                SyntaxError::InvalidClosingArrayBracket => "SyntaxError::InvalidClosingArrayBracket",
                SyntaxError::InvalidClosingBracket => "SyntaxError::InvalidClosingBracket",
                SyntaxError::InvalidSkip => "SyntaxError::InvalidSkip",
                SyntaxError::ElseIfWithoutIf => "SyntaxError::ElseIfWithoutIf",
                SyntaxError::ElseWithoutIf => "SyntaxError::ElseWithoutIf",
                SyntaxError::MissingStatementBody(_) => "SyntaxError::MissingStatementBody",
                SyntaxError::DuplicateLabel(_) => "SyntaxError::DuplicateLabel",
                SyntaxError::UnresolvedLabels(_) => "SyntaxError::UnresolvedLabels",
                SyntaxError::InvalidAssignment => "SyntaxError::InvalidAssignment",
                SyntaxError::InvalidLeadingComma => "SyntaxError::InvalidLeadingComma",
                SyntaxError::InvalidKeyInArray => "SyntaxError::InvalidKeyInArray",
                SyntaxError::InvalidBuffer => "SyntaxError::InvalidBuffer",
                SyntaxError::InvalidUnicodeEscape => "SyntaxError::InvalidUnicodeEscape",
                SyntaxError::InvalidHexEscape => "SyntaxError::InvalidHexEscape",
                SyntaxError::UnexportableFunction => "SyntaxError::UnexportableFunction",
                SyntaxError::InvalidFunctionParameters => "SyntaxError::InvalidFunctionParameters",
            },
            InnerError::Compile(err) => match err {
                CompileError::ScriptTooBig => "CompileError::ScriptTooBig",
                CompileError::InvalidVariableId(_) => "CompileError::InvalidVariableId",
                CompileError::PointerIdTooLarge => "CompileError::PointerIdTooLarge",
                CompileError::Redeclared { .. } => "CompileError::Redeclared",
                CompileError::UndeclaredVariable(_) => "CompileError::UndeclaredVariable",
                CompileError::ReferenceOverride(_) => "CompileError::ReferenceOverride",
                CompileError::ValueReferenceOverride(_) => "CompileError::ValueReferenceOverride",
                CompileError::BorrowedReadonly(_) => "CompileError::BorrowedReadonly",
                CompileError::ConstReadonly(_) => "CompileError::ConstReadonly",
                CompileError::ExtractOutsideChildScope(_) => "CompileError::ExtractOutsideChildScope",
                CompileError::InvalidVariableBaseType(_) => "CompileError::InvalidVariableBaseType",
                CompileError::InvalidInternalVarAction(_) => "CompileError::InvalidInternalVarAction",
                CompileError::UnknownInternalVar(_) => "CompileError::UnknownInternalVar",
                CompileError::ExportUndeclared(_) => "CompileError::ExportUndeclared",
                CompileError::FunctionParamRedeclared(_) => "CompileError::FunctionParamRedeclared",
                CompileError::MissingPlugin(_) => "CompileError::MissingPlugin",
                CompileError::MissingPlugins(_) => "CompileError::MissingPlugins",
                CompileError::NameTooLong(_) => "CompileError::NameTooLong",
                CompileError::BigIntTooLarge => "CompileError::BigIntTooLarge",
                CompileError::Unsupported(_) => "CompileError::Unsupported",
                CompileError::Evaluation(_) => "CompileError::Evaluation",
                CompileError::IterationLimit(_) => "CompileError::IterationLimit",
            },
            InnerError::Value(err) => match err {
                ValueError::InvalidQuantity(_) => "ValueError::InvalidQuantity",
                ValueError::InvalidUnitSymbol(_) => "ValueError::InvalidUnitSymbol",
                ValueError::UnitExponentOutOfRange(_) => "ValueError::UnitExponentOutOfRange",
                ValueError::QuantityOutOfRange => "ValueError::QuantityOutOfRange",
                ValueError::UnsupportedNative(_) => "ValueError::UnsupportedNative",
                ValueError::InvalidTime(_) => "ValueError::InvalidTime",
            },
            InnerError::Frame(err) => match err {
                FrameError::MissingEncryptionKey => "FrameError::MissingEncryptionKey",
                FrameError::ResponseWithoutSid => "FrameError::ResponseWithoutSid",
                FrameError::TargetNameTooLong(_) => "FrameError::TargetNameTooLong",
                FrameError::Crypto(_) => "FrameError::Crypto",
                FrameError::NoCryptoProvider(_) => "FrameError::NoCryptoProvider",
                FrameError::RandomSource(_) => "FrameError::RandomSource",
                FrameError::InvalidReceiverKey(_) => "FrameError::InvalidReceiverKey",
                FrameError::MalformedBlock => "FrameError::MalformedBlock",
            },
        };

        Some(Box::new(c))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let msg = match &self.cause {
            InnerError::Lexer(_) => Some("Check for unexpected or misplaced tokens in your script.".to_string()),
            InnerError::Syntax(err) if err.is_bracket_error() => {
                Some("Make sure every opening bracket has a matching closing bracket.".to_string())
            }
            InnerError::Syntax(SyntaxError::UnresolvedLabels(_)) => {
                Some("Every jump target needs a matching `lbl` declaration.".to_string())
            }
            InnerError::Compile(CompileError::UndeclaredVariable(name)) => {
                Some(format!("Declare '{name}' with var, ref, val or const before using it."))
            }
            InnerError::Compile(CompileError::MissingPlugin(_) | CompileError::MissingPlugins(_)) => {
                Some("Add a `plugin NAME (...)` block for every required plugin.".to_string())
            }
            InnerError::Compile(CompileError::Unsupported(_)) => {
                Some("Install a compile-time evaluator to use insert and compile.".to_string())
            }
            InnerError::Frame(FrameError::MissingEncryptionKey) => {
                Some("Pass a symmetric key together with the encrypt option.".to_string())
            }
            _ => None,
        };

        msg.map(|m| Box::new(m) as Box<dyn std::fmt::Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        Some(Box::new(std::iter::once(
            miette::LabeledSpan::new_with_span(Some(format!("{}", self.cause)), self.location),
        )))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.source_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first_line("abc\ndef", 1, 0, 3)]
    #[case::second_line("abc\ndefgh", 2, 4, 5)]
    #[case::clamped("abc\ndef", 9, 4, 3)]
    #[case::no_line("abc", 0, 0, 1)]
    #[case::empty_line("abc\n\nx", 2, 4, 1)]
    fn test_from_error_location(
        #[case] source: &str,
        #[case] line: usize,
        #[case] offset: usize,
        #[case] len: usize,
    ) {
        let err = Error::from_error(
            source,
            InnerError::Syntax(SyntaxError::MissingClosingBracket),
            line,
        );
        assert_eq!(err.location.offset(), offset);
        assert_eq!(err.location.len(), len);
    }

    #[rstest]
    #[case(InnerError::Syntax(SyntaxError::InvalidSkip), "SyntaxError::InvalidSkip")]
    #[case(InnerError::Compile(CompileError::ScriptTooBig), "CompileError::ScriptTooBig")]
    #[case(InnerError::Frame(FrameError::ResponseWithoutSid), "FrameError::ResponseWithoutSid")]
    #[case(
        InnerError::Lexer(LexerError::InvalidToken { line: 1, near: "~".to_string() }),
        "LexerError::InvalidToken"
    )]
    fn test_diagnostic_code(#[case] cause: InnerError, #[case] expected: &str) {
        let err = Error::from_error("x", cause, 1);
        assert_eq!(err.code().map(|c| c.to_string()), Some(expected.to_string()));
    }

    #[test]
    fn test_display_uses_cause() {
        let err = Error::from_error(
            "1",
            InnerError::Compile(CompileError::InvalidVariableId(70000)),
            1,
        );
        assert_eq!(err.to_string(), "Invalid variable id: 70000 (too big)");
        assert_eq!(err.line(), 1);
    }
}
