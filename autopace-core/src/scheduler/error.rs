use thiserror::Error;

use crate::store::StoreError;

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Failure raised by a host collaborator (document probe or action sink).
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("target detached from document: {0}")]
    Detached(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),
}
