//! Error types for crossdock.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("platform '{platform}' would be staged inside '{parent}'")]
    NestedPlatform { platform: String, parent: String },
}

pub type Result<T> = std::result::Result<T, Error>;
