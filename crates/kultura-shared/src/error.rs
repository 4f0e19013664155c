use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Token is not of the form <valid_until>.<signature>")]
    BadFormat,

    #[error("Token expiry is not a unix timestamp")]
    BadExpiry,

    #[error("Token signature is not valid hex")]
    BadSignatureEncoding,

    #[error("Token has expired")]
    Expired,

    #[error("Token signature does not verify")]
    BadSignature,

    #[error("Invalid verifying key")]
    InvalidKey,
}
