use sled::transaction::TransactionError;

use crate::types::Amount;

pub type Result<T> = std::result::Result<T, ExpenseError>;

#[derive(thiserror::Error, Debug)]
pub enum ExpenseError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("No authenticated caller")]
    Unauthorized,
    #[error("Caller is not the designated approver of this request")]
    NotApprover,
    #[error("Caller may not access this {0}")]
    Forbidden(&'static str),
    #[error("Unsupported {0}")]
    Unsupported(String),
    #[error("Expense total {requested} exceeds committed budget {available}")]
    BudgetExceeded { requested: Amount, available: Amount },
    #[error("No approver could be derived for event type '{event}'")]
    DerivationFailed { event: String },
    #[error("A pending approval request already exists for this {0}")]
    DuplicatePending(&'static str),
    #[error("Approval request has already been decided")]
    AlreadyDecided,
    #[error("Expense has already been submitted")]
    AlreadySubmitted,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Record codec failure: {0}")]
    Codec(String),
}

impl ExpenseError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ExpenseError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for faults of the store itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, ExpenseError::Storage(_) | ExpenseError::Codec(_))
    }
}

impl From<TransactionError<ExpenseError>> for ExpenseError {
    fn from(value: TransactionError<ExpenseError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => ExpenseError::Storage(err),
        }
    }
}

impl From<minicbor::decode::Error> for ExpenseError {
    fn from(value: minicbor::decode::Error) -> Self {
        ExpenseError::Codec(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for ExpenseError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        ExpenseError::Codec(value.to_string())
    }
}
