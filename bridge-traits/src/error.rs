use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure is transport-level and expected to clear up by itself.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Network(_) | BridgeError::Io(_) => true,
            BridgeError::Server { status, .. } => *status >= 500,
            BridgeError::NotAvailable(_) | BridgeError::OperationFailed(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
