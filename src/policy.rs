//! Per-leave-type adjudication policy
//!
//! Whether a shortfall hard-blocks or converts to unpaid leave is never
//! assumed globally; each leave type carries an explicit flag.

use crate::error::LeaveError;
use sled::Db;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum InsufficientBalancePolicy {
    #[n(0)]
    Reject,
    #[n(1)]
    ConvertToUnpaid,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LeaveTypePolicy {
    #[n(0)]
    pub leave_type: String,
    /// When false, a manager approval alone finalizes unless the request
    /// exceeds its entitlement.
    #[n(1)]
    pub requires_hr_approval: bool,
    #[n(2)]
    pub insufficient_balance: InsufficientBalancePolicy,
    /// Retroactive deductions may push the balance below zero.
    #[n(3)]
    pub allow_negative_after_retro: bool,
    /// Hours a manager gets before auto-escalation to the HR queue.
    #[n(4)]
    pub default_grace_period_hours: u32,
}

impl LeaveTypePolicy {
    pub fn new(leave_type: &str) -> Self {
        Self {
            leave_type: leave_type.to_string(),
            requires_hr_approval: false,
            insufficient_balance: InsufficientBalancePolicy::Reject,
            allow_negative_after_retro: true,
            default_grace_period_hours: 48,
        }
    }
    pub fn set_requires_hr_approval(mut self, required: bool) -> Self {
        self.requires_hr_approval = required;
        self
    }
    pub fn set_insufficient_balance(mut self, policy: InsufficientBalancePolicy) -> Self {
        self.insufficient_balance = policy;
        self
    }
    pub fn set_allow_negative_after_retro(mut self, allowed: bool) -> Self {
        self.allow_negative_after_retro = allowed;
        self
    }
    pub fn set_grace_period_hours(mut self, hours: u32) -> Self {
        self.default_grace_period_hours = hours;
        self
    }
}

#[derive(Clone)]
pub struct PolicyStore {
    db: Arc<Db>,
}

impl PolicyStore {
    pub(crate) fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn key(leave_type: &str) -> String {
        format!("pol/{leave_type}")
    }

    pub fn upsert(&self, policy: LeaveTypePolicy) -> Result<(), LeaveError> {
        if policy.leave_type.is_empty() {
            return Err(LeaveError::Validation("policy leave type is empty".into()));
        }
        self.db
            .insert(Self::key(&policy.leave_type).into_bytes(), minicbor::to_vec(&policy)?)?;
        Ok(())
    }

    /// A missing policy is a configuration error, not a default.
    pub fn get(&self, leave_type: &str) -> Result<LeaveTypePolicy, LeaveError> {
        match self.db.get(Self::key(leave_type).into_bytes())? {
            Some(value) => Ok(minicbor::decode(&value)?),
            None => Err(LeaveError::NotFound {
                kind: "leave type policy",
                id: leave_type.to_string(),
            }),
        }
    }
}
