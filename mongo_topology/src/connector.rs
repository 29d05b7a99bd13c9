use std::fmt::Debug;

use async_trait::async_trait;
use dyn_clone::DynClone;

use crate::{error_chain_fmt, hello::HelloCommand, server_address::ServerAddress};

/// The transport a monitor uses to run handshakes against a node.
///
/// Implementations own connection establishment, authentication and the wire encoding. They
/// return the raw reply document; decoding and classification happen in this crate.
#[async_trait]
pub trait Connector: Debug + DynClone + Send + Sync {
    async fn hello(
        &self,
        address: &ServerAddress,
        command: &HelloCommand,
    ) -> Result<serde_json::Value, ConnectorError>;
}
dyn_clone::clone_trait_object!(Connector);

#[derive(thiserror::Error, Clone)]
pub enum ConnectorError {
    #[error("Connection to {address} failed: {message}")]
    ConnectionFailed {
        address: ServerAddress,
        message: String,
    },
    #[error("Handshake with {address} timed out")]
    Timeout { address: ServerAddress },
    #[error("Connection to {address} was closed: {message}")]
    ConnectionClosed {
        address: ServerAddress,
        message: String,
    },
    #[error("Handshake reply from {address} could not be decoded: {message}")]
    MalformedReply {
        address: ServerAddress,
        message: String,
    },
    #[error("Handshake with {address} failed: {message}")]
    CommandFailed {
        address: ServerAddress,
        code: Option<i32>,
        message: String,
    },
}

impl ConnectorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectorError::Timeout { .. })
    }
}

impl Debug for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
