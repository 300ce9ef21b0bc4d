use arbor_rlp::error::RLPDecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    RlpDecode(#[from] RLPDecodeError),
    #[error("corrupted node store: {0}")]
    Corruption(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("block {0} is already covered by the archive")]
    BlockAlreadyArchived(u64),
    #[error("block {0} is not in the archive")]
    BlockOutOfRange(u64),
    #[error("multiple errors: {}", format_aggregate(.0))]
    Aggregate(Vec<StoreError>),
}

impl StoreError {
    /// Folds a list of errors into a single one, dropping none.
    /// Returns `Ok(())` when the list is empty.
    pub fn join(errors: Vec<StoreError>) -> Result<(), StoreError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors
                .into_iter()
                .next()
                .unwrap_or_else(|| StoreError::Corruption("empty error list".into()))),
            _ => Err(StoreError::Aggregate(errors)),
        }
    }
}

fn format_aggregate(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
