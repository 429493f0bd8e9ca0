use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage consistency violation: {0}")]
    StorageConsistency(String),

    #[error("All cache entries in the {0} queue are used")]
    AllEntriesUsed(&'static str),

    #[error("Illegal budget change: {0}")]
    IllegalBudgetChange(String),

    #[error("Operation was interrupted: {0}")]
    Interrupted(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
