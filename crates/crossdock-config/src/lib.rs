//! KDL configuration parsing for crossdock.
//!
//! This crate handles parsing of:
//! - Release definitions (crossdock.kdl)
//! - Variable interpolation for image tags

pub mod error;
pub mod release;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use release::{
    FailurePolicy, ImageConfig, ReleaseConfig, RepositoryConfig, ToolchainConfig, load_release,
    parse_release,
};
pub use variables::{GitInfo, MAX_TAG_LEN, TagVariables};
