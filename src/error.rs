//! Error types for the forwarding core.
//!
//! Errors fall in two classes. Session-fatal errors (placement, channel setup,
//! handshake violations) end the run because no partial recovery exists.
//! Everything else aborts only the message or request being processed: a client
//! call returns the error, a server logs it and keeps serving other clients.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;

/// Identifier namespace used in `UnknownIdentifier` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    File,
    Dimension,
    Variable,
    Client,
    Rank,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdKind::File => "file",
            IdKind::Dimension => "dimension",
            IdKind::Variable => "variable",
            IdKind::Client => "client",
            IdKind::Rank => "rank",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IofwdError {
    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),

    #[error("Allocation failure: requested {requested} bytes, {available} available")]
    AllocationFailure { requested: usize, available: usize },

    #[error("Unknown {kind} identifier: {id}")]
    UnknownIdentifier { kind: IdKind, id: String },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Wrong dimensionality: expected {expected}, got {actual}")]
    WrongDimensionality { expected: usize, actual: usize },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Channel setup failure: {0}")]
    ChannelSetupFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl IofwdError {
    pub fn unknown(kind: IdKind, id: impl fmt::Display) -> Self {
        IofwdError::UnknownIdentifier {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error ends the whole session rather than one request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IofwdError::InvalidPlacement(_)
                | IofwdError::ChannelSetupFailure(_)
                | IofwdError::ProtocolViolation(_)
                | IofwdError::Config(_)
        )
    }
}

pub type IofwdResult<T> = Result<T, IofwdError>;
