use crate::{error_chain_fmt, server_address::InvalidAddressError};

#[derive(thiserror::Error)]
pub enum TopologyError {
    #[error("No hosts were supplied and a topology can't exist without at least one")]
    MissingHostsError,
    #[error("No connector was supplied, monitors have no way to reach the servers")]
    MissingConnectorError,
    #[error(transparent)]
    InvalidHost(#[from] InvalidAddressError),
    #[error("Invalid value for option `{option}`: {message}")]
    InvalidOption { option: String, message: String },
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
