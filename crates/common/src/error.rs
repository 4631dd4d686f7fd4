//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The other side of the channel bridge is gone
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
