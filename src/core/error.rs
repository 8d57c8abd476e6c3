use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Malformed transition: {0}")]
    MalformedTransition(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    #[error("Cyclic propagation: {0}")]
    CyclicPropagation(String),

    #[error("Enricher with unique tag '{0}' already attached")]
    DuplicateEnricher(String),

    #[error("Entity '{0}' is not managed")]
    EntityNotManaged(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Scenario error: {0}")]
    Scenario(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

impl<T> From<std::sync::PoisonError<T>> for StateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Scenario(err.to_string())
    }
}
