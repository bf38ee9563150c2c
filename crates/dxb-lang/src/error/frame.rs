use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Cannot encrypt without a symmetric encryption key")]
    MissingEncryptionKey,
    #[error("Cannot generate a new SID for a RESPONSE")]
    ResponseWithoutSid,
    #[error("Target name '{0}' is too long")]
    TargetNameTooLong(String),
    #[error("Crypto provider failed: {0}")]
    Crypto(String),
    #[error("No crypto provider installed for {0}")]
    NoCryptoProvider(&'static str),
    #[error("Random source failed: {0}")]
    RandomSource(String),
    #[error("Key for receiver '{0}' must be 512 bytes")]
    InvalidReceiverKey(String),
    #[error("Not a valid block header")]
    MalformedBlock,
}
