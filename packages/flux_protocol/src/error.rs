/// Errors decoding or encoding gateway messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A connection request that cannot be sent as-is.
///
/// The display strings are shown inline to the user, so they read as
/// instructions rather than diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Serial port is required")]
    MissingPort,

    #[error("Baud rate must be greater than zero")]
    InvalidBaudRate,

    #[error("Data bits must be between 5 and 8 (got {0})")]
    InvalidDataBits(u8),

    #[error("Host and username are required")]
    MissingHostOrUsername,

    #[error("Password is required")]
    MissingPassword,

    #[error("Private key is required")]
    MissingPrivateKey,
}
