//! Error taxonomy for transaction construction and funding
//!
//! Every failure of a construction or funding attempt is reported as a
//! `SpendError`. Errors are plain values: by the time one reaches the
//! caller, any coins the attempt reserved have already been released.
//!
//! The two insufficient-funds variants are kept apart because the remedy
//! differs. `InsufficientFunds` means the wallet needs more coins;
//! `InsufficientFundsAfterFee` means the coins would cover the payments but
//! not at the requested fee rate.
//!
//! # Usage
//!
//! ```
//! use bitvault_spend::error::{ErrorCategory, SpendError};
//! use bitcoin::Amount;
//!
//! let err = SpendError::InsufficientFunds {
//!     available: Amount::from_sat(1_000),
//!     required: Amount::from_sat(5_000),
//! };
//! assert_eq!(err.category(), ErrorCategory::Funds);
//! ```

use bitcoin::{Amount, OutPoint};
use thiserror::Error;

use crate::fee_estimation::FeeRate;

/// Result type used throughout the engine
pub type SpendResult<T> = Result<T, SpendError>;

/// Reasons a construction or funding attempt can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpendError {
    /// The eligible coins do not cover the requested payments
    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: Amount, required: Amount },

    /// The coins cover the payments but not the fee at this rate
    #[error("Insufficient funds after fees: {available} available, {required} plus fees required at {fee_rate}")]
    InsufficientFundsAfterFee {
        available: Amount,
        required: Amount,
        fee_rate: FeeRate,
    },

    /// No fee estimate and no allowed fallback
    #[error("Fee estimation failed for a {confirm_target} block target and fallback fee is disabled")]
    FeeEstimationUnavailable { confirm_target: u32 },

    /// Fee and change decision did not settle
    #[error("Fee calculation did not converge after {rounds} rounds")]
    FeeCalculationDidNotConverge { rounds: usize },

    /// Fee subtraction pushed a recipient output below dust
    #[error("Output {index} would be {value} after fee subtraction, below the dust threshold of {threshold}")]
    RecipientBelowDustAfterFeeSubtraction {
        index: usize,
        value: Amount,
        threshold: Amount,
    },

    /// The funded transaction needs coins that are, or could not be, locked
    #[error("Locked unspents conflict with funding: {} coin(s) involved", outpoints.len())]
    LockedUnspentsConflict { outpoints: Vec<OutPoint> },

    /// A recipient or change address could not be used
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// The signer refused or failed
    #[error("Signing failed: {0}")]
    SignFailure(String),

    /// A payment output is too small to relay
    #[error("Output {index} amount {amount} is below the dust threshold of {threshold}")]
    AmountBelowDust {
        index: usize,
        amount: Amount,
        threshold: Amount,
    },

    /// The request itself is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A manually selected coin is unknown, reserved or locked
    #[error("Coin {0} is not available for spending")]
    CoinUnavailable(OutPoint),

    /// The engine cannot estimate the spend size of an input
    #[error("Missing solving data for input {0}")]
    MissingSolvingData(OutPoint),

    /// The transaction would not be relayed
    #[error("Transaction weight {weight} exceeds the standard limit of {max}")]
    TransactionTooLarge { weight: u64, max: u64 },

    /// The absolute fee exceeds the wallet's configured maximum
    #[error("Fee {fee} exceeds the configured maximum of {max}")]
    FeeExceedsMaximum { fee: Amount, max: Amount },

    /// A post-assembly check failed; the attempt is abandoned
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Error category for logging and user feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Not enough value available
    Funds,
    /// Fee rate or fee calculation problems
    Fee,
    /// Request or policy problems the caller can fix
    Request,
    /// Coin availability and locking
    Coins,
    /// Signer failures
    Signing,
    /// Engine bugs
    Internal,
}

impl ErrorCategory {
    /// Convert the error category to a string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Funds => "Funds",
            ErrorCategory::Fee => "Fee",
            ErrorCategory::Request => "Request",
            ErrorCategory::Coins => "Coins",
            ErrorCategory::Signing => "Signing",
            ErrorCategory::Internal => "Internal",
        }
    }
}

impl SpendError {
    /// Get the category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SpendError::InsufficientFunds { .. } | SpendError::InsufficientFundsAfterFee { .. } => {
                ErrorCategory::Funds
            }
            SpendError::FeeEstimationUnavailable { .. }
            | SpendError::FeeCalculationDidNotConverge { .. }
            | SpendError::FeeExceedsMaximum { .. } => ErrorCategory::Fee,
            SpendError::RecipientBelowDustAfterFeeSubtraction { .. }
            | SpendError::InvalidDestination(_)
            | SpendError::AmountBelowDust { .. }
            | SpendError::InvalidRequest(_)
            | SpendError::TransactionTooLarge { .. } => ErrorCategory::Request,
            SpendError::LockedUnspentsConflict { .. }
            | SpendError::CoinUnavailable(_)
            | SpendError::MissingSolvingData(_) => ErrorCategory::Coins,
            SpendError::SignFailure(_) => ErrorCategory::Signing,
            SpendError::InternalInvariant(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the caller should bring more coins rather than lower the fee
    pub fn needs_more_coins(&self) -> bool {
        matches!(self, SpendError::InsufficientFunds { .. })
    }

    /// Get a message suitable for displaying to users
    ///
    /// Internal errors are not described in detail.
    pub fn user_message(&self) -> String {
        match self {
            SpendError::InsufficientFunds { .. } => "Insufficient funds".to_string(),
            SpendError::InsufficientFundsAfterFee { .. } => {
                "The selected fee rate is too high for the available funds".to_string()
            }
            SpendError::FeeEstimationUnavailable { .. } => {
                "Fee estimation is unavailable; set a fee rate manually".to_string()
            }
            SpendError::SignFailure(_) => "The transaction could not be signed".to_string(),
            SpendError::InternalInvariant(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }
}
