//! Crate-level error type.

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::engine::EngineError;
use crate::expression::ExpressionError;
use crate::registry::RegistryError;
use crate::serialization::{ParseError, WriteError};
use thiserror::Error;

/// Any error produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
