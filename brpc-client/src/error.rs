//! Client error types.

use thiserror::Error;

/// Why a [`Context`](crate::Context) finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Service discovery errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("rpc discovery: no available servers")]
    NoServers,

    #[error("rpc discovery: {0}")]
    Refresh(String),
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] brpc_protocol::ProtocolError),

    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("rpc client: unsupported network {0:?}")]
    UnsupportedNetwork(String),

    #[error("rpc client: wrong format {0:?}, expect protocol@addr")]
    InvalidAddress(String),

    #[error("connection is shut down")]
    Shutdown,

    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    #[error("rpc client: call failed: {0}")]
    Cancelled(ContextError),

    /// Error text returned by the server, verbatim.
    #[error("{0}")]
    Server(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl From<ContextError> for ClientError {
    fn from(err: ContextError) -> Self {
        ClientError::Cancelled(err)
    }
}

impl ClientError {
    /// Returns whether the call may succeed on another connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::ConnectTimeout(_) => true,
            ClientError::Shutdown => true,
            ClientError::ConnectionBroken(_) => true,
            _ => false,
        }
    }

    /// Returns whether the call ended because its context finished.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled(_))
    }
}
