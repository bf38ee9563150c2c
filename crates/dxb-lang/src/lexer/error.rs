use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexerError {
    #[error("Invalid token on line {line} near '{near}'")]
    InvalidToken { line: usize, near: String },
}
