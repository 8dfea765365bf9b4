//! Error taxonomy for the submission pipeline

use crate::record::RecordStatus;

pub type VerifactuResult<T> = Result<T, VerifactuError>;

#[derive(thiserror::Error, Debug)]
pub enum VerifactuError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected by the tax authority: {message}")]
    BusinessRejection { code: Option<u32>, message: String },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Coarse grouping used by the scheduler to decide what happens to a record after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Transport,
    BusinessRejection,
    Integrity,
    Internal,
}

impl VerifactuError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            VerifactuError::Configuration(_) => ErrorCategory::Configuration,
            VerifactuError::Validation(_) => ErrorCategory::Validation,
            VerifactuError::Transport(_) => ErrorCategory::Transport,
            VerifactuError::BusinessRejection { .. } => ErrorCategory::BusinessRejection,
            VerifactuError::Integrity(_) => ErrorCategory::Integrity,
            VerifactuError::MalformedDocument(_)
            | VerifactuError::Storage(_)
            | VerifactuError::NotFound(_) => ErrorCategory::Internal,
        }
    }

    /// Only transport failures go back into the backoff queue.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }
}

impl From<anyhow::Error> for VerifactuError {
    fn from(value: anyhow::Error) -> Self {
        VerifactuError::Storage(format!("{value:#}"))
    }
}

impl From<sled::Error> for VerifactuError {
    fn from(value: sled::Error) -> Self {
        VerifactuError::Storage(value.to_string())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("issuer tax id is empty")]
    MissingIssuerTaxId,
    #[error("issuer name is empty")]
    MissingIssuerName,
    #[error("document number is empty")]
    MissingDocumentNumber,
    #[error("document requires a recipient")]
    MissingRecipient,
    #[error("recipient identification is incomplete: {0}")]
    IncompleteRecipient(String),
    #[error("tax breakdown has no lines")]
    EmptyTaxBreakdown,
    #[error("tax lines sharing rate {rate_bp} and qualification {qualification} use different regime keys")]
    InconsistentRegimeKey { rate_bp: u32, qualification: String },
    #[error("previous digest is not a 64 character hex string: {0}")]
    MalformedDigest(String),
    #[error("digest would reference itself as its predecessor")]
    SelfReferencingDigest,
    #[error("record has not been sealed with a digest")]
    MissingDigest,
    #[error("chain link names a previous digest but not the previous document")]
    IncompleteChainLink,
    #[error("on-request submissions need a remission reference")]
    MissingRemissionReference,
    #[error("corrective documents need a corrected reference")]
    MissingCorrectedReference,
    #[error("substitution corrections need the rectified base and quota")]
    MissingRectifiedAmounts,
    #[error("record {record} cannot be sent: {later} has a later issue date and was already accepted")]
    ChronologyViolation { record: String, later: String },
    #[error("record {record} cannot be sent: earlier record {earlier} in the same journal is {status:?}")]
    ChainContinuityViolation {
        record: String,
        earlier: String,
        status: RecordStatus,
    },
    #[error("document {0} is already registered")]
    DuplicateDocument(String),
    #[error("record in state {0:?} cannot be used for this operation")]
    InvalidState(RecordStatus),
}
