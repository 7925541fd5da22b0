//! Manager error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("feature not enabled: {0}")]
    NotEnabled(String),

    #[error(transparent)]
    Command(#[from] rio_core::command::CommandError),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}
