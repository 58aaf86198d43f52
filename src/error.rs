//! Defines the error type shared across the translation and execution pipeline.
//!
//! Translation *fallback* is not an error: an operator that cannot run on the
//! server is re-emitted as an in-process operator and the pipeline moves on.
//! Errors here are the cases where neither side can proceed, plus the
//! cardinality violations raised by the first/single reducers at
//! materialization time.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Sequence contains no matching element.")]
    NoElement,

    #[error("Sequence contains more than one matching element.")]
    MoreThanOneElement,

    #[error("Operation is not supported: {0}")]
    NotSupported(&'static str),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unbound variable: {0}")]
    UnboundVariable(String),

    #[error("Parameter index {0} out of range.")]
    ParameterOutOfRange(usize),

    #[error("Type error: {0}")]
    Type(String),

    // Raised by the command executor collaborator; carried through the
    // pipeline untouched so callers see the original cause, never a
    // wrapper added by plan invocation.
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}
