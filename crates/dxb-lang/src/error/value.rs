use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("Invalid quantity value '{0}'")]
    InvalidQuantity(String),
    #[error("Invalid unit symbol '{0}'")]
    InvalidUnitSymbol(String),
    #[error("Unit exponent {0} is out of range")]
    UnitExponentOutOfRange(i32),
    #[error("Quantity is out of range")]
    QuantityOutOfRange,
    #[error("Failed to compile an unsupported native type: {0}")]
    UnsupportedNative(String),
    #[error("Invalid time value '{0}'")]
    InvalidTime(String),
}
