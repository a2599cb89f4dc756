use thiserror::Error;

/// Enum for the various failure modes of the store, gateway and query layers.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid configuration. {0}")]
    InvalidConfiguration(String),

    #[error("Cannot decode chunk. {0}")]
    ChunkDecode(String),

    #[error("Cannot seal an empty chunk.")]
    EmptyChunk,

    #[error("Out of order sample. {0} follows {1}.")]
    OutOfOrderSample(i64, i64),

    #[error("Out of order series. {0} follows {1}.")]
    OutOfOrderSeries(String, String),

    #[error("Cannot write a block with no series.")]
    EmptyBlock,

    #[error("Cannot serialize. {0}")]
    CannotSerialize(String),

    #[error("Cannot deserialize. {0}")]
    CannotDeserialize(String),

    #[error("Invalid block {0}. {1}")]
    InvalidBlock(String, String),

    #[error("Object {0} not found.")]
    ObjectNotFound(String),

    #[error("Object storage error. {0}")]
    ObjectStorage(String),

    #[error("Invalid series selector. {0}")]
    InvalidSeriesSelector(String),

    #[error("Invalid timestamp range. Start {0} is after end {1}.")]
    InvalidTimeRange(i64, i64),

    #[error("Endpoint {0} failed. {1}")]
    EndpointFailure(String, String),

    #[error("Endpoint {0} deadline of {1:?} exceeded.")]
    DeadlineExceeded(String, std::time::Duration),

    #[error("Query was cancelled.")]
    Cancelled,

    #[error("Series limit of {0} exceeded.")]
    SeriesLimitExceeded(usize),

    #[error("{0}")]
    General(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Cancellation and deadline expiry travel through the same channels as
    /// data errors but must stay distinguishable from them.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            VaultError::Cancelled | VaultError::DeadlineExceeded(_, _)
        )
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::General(err.to_string())
    }
}
