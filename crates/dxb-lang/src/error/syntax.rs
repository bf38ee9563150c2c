use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyntaxError {
    #[error("Missing closing object bracket")]
    MissingClosingObjectBracket,
    #[error("Missing closing array bracket")]
    MissingClosingArrayBracket,
    #[error("Missing closing bracket")]
    MissingClosingBracket,
    #[error("Invalid closing object bracket")]
    InvalidClosingObjectBracket,
    #[error("Invalid closing array bracket")]
    InvalidClosingArrayBracket,
    #[error("Invalid closing bracket")]
    InvalidClosingBracket,
    #[error("Invalid 'skip' command")]
    InvalidSkip,
    #[error("Invalid else-if statement - no preceding if statement")]
    ElseIfWithoutIf,
    #[error("Invalid else statement - no preceding if statement")]
    ElseWithoutIf,
    #[error("Missing body of '{0}' statement")]
    MissingStatementBody(&'static str),
    #[error("Multiple use of label: {0}")]
    DuplicateLabel(SmolStr),
    #[error("Jump to non-existing lbl: {0}")]
    UnresolvedLabels(String),
    #[error("Invalid assignment")]
    InvalidAssignment,
    #[error("Invalid leading comma")]
    InvalidLeadingComma,
    #[error("Invalid key in <Array>")]
    InvalidKeyInArray,
    #[error("Invalid <Buffer> format (base 16)")]
    InvalidBuffer,
    #[error("Invalid Unicode escape sequence")]
    InvalidUnicodeEscape,
    #[error("Invalid hexadecimal escape sequence")]
    InvalidHexEscape,
    #[error("Cannot export a function without a name")]
    UnexportableFunction,
    #[error("Invalid function parameter list")]
    InvalidFunctionParameters,
}

impl SyntaxError {
    /// Whether the error is caused by an unbalanced delimiter.
    #[cold]
    pub fn is_bracket_error(&self) -> bool {
        matches!(
            self,
            SyntaxError::MissingClosingObjectBracket
                | SyntaxError::MissingClosingArrayBracket
                | SyntaxError::MissingClosingBracket
                | SyntaxError::InvalidClosingObjectBracket
                | SyntaxError::InvalidClosingArrayBracket
                | SyntaxError::InvalidClosingBracket
        )
    }
}
