//! Failures the connection pool reports back after running an operation.
use crate::{
    error_chain_fmt, hello::TopologyVersion, server_selection::SelectionError,
};

const NOT_WRITABLE_PRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const NODE_IS_RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTDOWN_CODES: [i32; 2] = [11600, 91];

#[derive(thiserror::Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The connection failed or timed out.
    #[error("Network error: {message}")]
    Network {
        message: String,
        timeout: bool,
        /// The connection failed before its handshake completed.
        before_handshake: bool,
    },
    /// The server answered with an error document.
    #[error("Command failed: {message}")]
    Command {
        code: Option<i32>,
        message: String,
        topology_version: Option<TopologyVersion>,
    },
}

impl OperationError {
    pub fn network(message: impl Into<String>) -> Self {
        OperationError::Network {
            message: message.into(),
            timeout: false,
            before_handshake: false,
        }
    }

    pub fn command(code: i32, message: impl Into<String>) -> Self {
        OperationError::Command {
            code: Some(code),
            message: message.into(),
            topology_version: None,
        }
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, OperationError::Network { .. })
    }

    pub fn is_network_timeout(&self) -> bool {
        matches!(self, OperationError::Network { timeout: true, .. })
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        match self {
            OperationError::Command {
                topology_version, ..
            } => topology_version.as_ref(),
            OperationError::Network { .. } => None,
        }
    }

    /// "Node is recovering": the member is in a state where it can't serve reads or writes.
    pub fn is_recovering(&self) -> bool {
        match self {
            OperationError::Command { code, message, .. } => {
                code.map_or(false, |code| NODE_IS_RECOVERING_CODES.contains(&code))
                    || message.contains("not master or secondary")
                    || message.contains("node is recovering")
            }
            OperationError::Network { .. } => false,
        }
    }

    /// "Not writable primary": the member stepped down or was never primary.
    pub fn is_not_writable_primary(&self) -> bool {
        match self {
            OperationError::Command { code, message, .. } => {
                if code.map_or(false, |code| NOT_WRITABLE_PRIMARY_CODES.contains(&code)) {
                    return true;
                }
                !self.is_recovering() && message.contains("not master")
            }
            OperationError::Network { .. } => false,
        }
    }

    pub fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_not_writable_primary()
    }

    pub fn is_node_shutting_down(&self) -> bool {
        match self {
            OperationError::Command { code: Some(code), .. } => SHUTDOWN_CODES.contains(code),
            _ => false,
        }
    }
}

impl std::fmt::Debug for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Failure of [`Topology::execute`](crate::Topology::execute).
#[derive(thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl std::fmt::Debug for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
