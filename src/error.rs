use crate::builder::Stage;
use ethers::types::H256;
use std::time::Duration;

/// Every way a build or submission can fail.
///
/// Network and service errors are surfaced as-is; nothing in the crate retries internally.
#[derive(Debug, thiserror::Error)]
pub enum UserOpError {
    /// The fee query (priority tip or latest block) failed.
    #[error("fee data unavailable: {0}")]
    FeeUnavailable(String),

    #[error("invalid call batch: {0}")]
    InvalidBatchShape(String),

    /// The paymaster service could not be reached.
    #[error("paymaster request failed: {0}")]
    PaymasterRejected(String),

    /// The paymaster answered, and the answer was no.
    #[error("paymaster declined sponsorship: {0}")]
    SponsorshipDenied(String),

    /// The bundler refused the operation (simulation or validation failure).
    #[error("bundler rejected user operation: {0}")]
    SubmissionRejected(String),

    #[error("bundler unreachable: {0}")]
    BundlerUnavailable(String),

    #[error(
        "no receipt for userOp {user_op_hash:?} after {waited:?}{}",
        .last_poll_error.as_deref().map(|e| format!(" (last poll error: {e})")).unwrap_or_default()
    )]
    ReceiptTimeout {
        user_op_hash: H256,
        waited: Duration,
        /// Set when the final polls failed rather than returning "pending".
        last_poll_error: Option<String>,
    },

    #[error("arithmetic overflow computing {0}")]
    ArithmeticOverflow(&'static str),

    #[error("user operation is already signed; cannot {0}")]
    OperationAlreadySigned(&'static str),

    #[error("cannot {action} while the operation is {stage}")]
    UnexpectedStage { action: &'static str, stage: Stage },

    #[error("chain query {query} failed: {message}")]
    Chain { query: &'static str, message: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("malformed {method} response: {reason}")]
    MalformedResponse { method: &'static str, reason: String },

    #[error("abi encoding failed: {0}")]
    Abi(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UserOpError>;

impl UserOpError {
    /// Stable name of the variant, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            UserOpError::FeeUnavailable(_) => "FeeUnavailable",
            UserOpError::InvalidBatchShape(_) => "InvalidBatchShape",
            UserOpError::PaymasterRejected(_) => "PaymasterRejected",
            UserOpError::SponsorshipDenied(_) => "SponsorshipDenied",
            UserOpError::SubmissionRejected(_) => "SubmissionRejected",
            UserOpError::BundlerUnavailable(_) => "BundlerUnavailable",
            UserOpError::ReceiptTimeout { .. } => "ReceiptTimeout",
            UserOpError::ArithmeticOverflow(_) => "ArithmeticOverflow",
            UserOpError::OperationAlreadySigned(_) => "OperationAlreadySigned",
            UserOpError::UnexpectedStage { .. } => "UnexpectedStage",
            UserOpError::Chain { .. } => "Chain",
            UserOpError::Signing(_) => "Signing",
            UserOpError::MalformedResponse { .. } => "MalformedResponse",
            UserOpError::Abi(_) => "Abi",
            UserOpError::Config(_) => "Config",
        }
    }

    pub(crate) fn chain(query: &'static str, err: impl std::fmt::Display) -> Self {
        UserOpError::Chain {
            query,
            message: err.to_string(),
        }
    }
}
