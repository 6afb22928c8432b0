//! Domain error taxonomy for the leave core
//!
//! Every kind stays distinguishable so callers can react differently
//! (retry, block, warn) instead of collapsing into a generic failure.
use crate::types::DayAmount;

#[derive(thiserror::Error, Debug)]
pub enum LeaveError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("employee {employee_id} is not eligible under rule {rule_id}: {reason}")]
    EligibilityNotMet {
        employee_id: String,
        rule_id: String,
        reason: String,
    },
    #[error(
        "insufficient balance for {employee_id}/{leave_type}: available {available}, requested {requested}"
    )]
    InsufficientBalance {
        employee_id: String,
        leave_type: String,
        available: DayAmount,
        requested: DayAmount,
    },
    #[error("request {request_id} cannot move from {from} to {to}")]
    IllegalTransition {
        request_id: String,
        from: String,
        to: String,
    },
    #[error("{actor} may not act on {subject}: {reason}")]
    NotAuthorized {
        actor: String,
        subject: String,
        reason: String,
    },
    #[error("delegation window overlaps accepted delegation {existing_id}")]
    DelegationOverlap { existing_id: String },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<minicbor::decode::Error> for LeaveError {
    fn from(err: minicbor::decode::Error) -> Self {
        LeaveError::Codec(err.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for LeaveError {
    fn from(err: minicbor::encode::Error<E>) -> Self {
        LeaveError::Codec(err.to_string())
    }
}
