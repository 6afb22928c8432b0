//! Append-only leave ledger
//!
//! The balance for an (employee, leave type) pair is never stored as its
//! own field: it is always the sum over that pair's transactions.
//! Corrections are new transactions, never edits. Appends for the same
//! pair are serialized so two concurrent debits cannot both pass the
//! balance check against a stale read.

use crate::audit::{AuditDraft, AuditRecorder, AuditTarget};
use crate::error::LeaveError;
use crate::locks::KeyedLocks;
use crate::types::{DayAmount, Timestamp};
use crate::utils::{self, hrp};
use sled::{Batch, Db};
use std::fmt;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransactionKind {
    #[n(0)]
    Accrual,
    #[n(1)]
    Take,
    #[n(2)]
    Adjustment,
    #[n(3)]
    Encashment,
    #[n(4)]
    Retro,
    #[n(5)]
    ReserveRelease,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Accrual => "accrual",
            TransactionKind::Take => "take",
            TransactionKind::Adjustment => "adjustment",
            TransactionKind::Encashment => "encashment",
            TransactionKind::Retro => "retro",
            TransactionKind::ReserveRelease => "reserve_release",
        };
        f.write_str(name)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub employee_id: String,
    #[n(2)]
    pub leave_type: String,
    #[n(3)]
    pub kind: TransactionKind,
    #[n(4)]
    pub amount: DayAmount,
    #[n(5)]
    pub origin_request_id: Option<String>,
    /// Absent means the entry was system-generated (accrual run, sweep).
    #[n(6)]
    pub performed_by: Option<String>,
    #[n(7)]
    pub reason: String,
    #[n(8)]
    pub created_at: Timestamp,
    /// Position in the pair's ledger, starting at 1.
    #[n(9)]
    pub seq: u64,
}

/// What to do when an append would drive the pair's balance negative.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AppendGuard {
    RejectNegative,
    AllowNegative,
}

// Used for constructing transaction drafts before they hit the ledger
#[derive(Debug, Default)]
pub struct TransactionDraft {
    employee_id: Option<String>,
    leave_type: Option<String>,
    kind: Option<TransactionKind>,
    amount: DayAmount,
    origin_request_id: Option<String>,
    performed_by: Option<String>,
    reason: Option<String>,
}

impl TransactionDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_employee(mut self, employee_id: &str) -> Self {
        self.employee_id = Some(employee_id.to_string());
        self
    }
    pub fn set_leave_type(mut self, leave_type: &str) -> Self {
        self.leave_type = Some(leave_type.to_string());
        self
    }
    pub fn set_kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }
    pub fn set_amount(mut self, amount: DayAmount) -> Self {
        self.amount = amount;
        self
    }
    pub fn set_origin_request(mut self, request_id: &str) -> Self {
        self.origin_request_id = Some(request_id.to_string());
        self
    }
    pub fn set_performed_by(mut self, actor: &str) -> Self {
        self.performed_by = Some(actor.to_string());
        self
    }
    pub fn set_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    // Checks fields then mints the transaction. The ledger assigns seq.
    fn finalise(self, at: Timestamp) -> Result<LedgerTransaction, LeaveError> {
        let employee_id = self
            .employee_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| LeaveError::Validation("transaction employee is not set".into()))?;
        let leave_type = self
            .leave_type
            .filter(|lt| !lt.is_empty())
            .ok_or_else(|| LeaveError::Validation("transaction leave type is not set".into()))?;
        let kind = self
            .kind
            .ok_or_else(|| LeaveError::Validation("transaction kind is not set".into()))?;
        if self.amount.is_zero() {
            return Err(LeaveError::Validation(
                "transaction amount is set to zero".into(),
            ));
        }
        let reason = self
            .reason
            .filter(|r| !r.is_empty())
            .ok_or_else(|| LeaveError::Validation("transaction reason is not set".into()))?;

        Ok(LedgerTransaction {
            transaction_id: utils::mint_id(hrp::TRANSACTION)?,
            employee_id,
            leave_type,
            kind,
            amount: self.amount,
            origin_request_id: self.origin_request_id,
            performed_by: self.performed_by,
            reason,
            created_at: at,
            seq: 0,
        })
    }
}

/// Consistency check over one pair's ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationReport {
    pub employee_id: String,
    pub leave_type: String,
    pub transaction_count: u64,
    pub computed_balance: DayAmount,
    pub sequence_intact: bool,
}

#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<Db>,
    audit: AuditRecorder,
    locks: Arc<KeyedLocks>,
}

impl LedgerStore {
    pub(crate) fn new(db: Arc<Db>, locks: Arc<KeyedLocks>) -> Self {
        let audit = AuditRecorder::new(db.clone());
        Self { db, audit, locks }
    }

    fn pair_prefix(employee_id: &str, leave_type: &str) -> String {
        format!("txn/{employee_id}/{leave_type}/")
    }
    fn txn_key(employee_id: &str, leave_type: &str, seq: u64) -> String {
        format!("txn/{employee_id}/{leave_type}/{seq:020}")
    }
    fn pair_lock_key(employee_id: &str, leave_type: &str) -> String {
        format!("bal/{employee_id}/{leave_type}")
    }

    /// Append one transaction. The only mutator of ledger state.
    pub fn append(
        &self,
        draft: TransactionDraft,
        guard: AppendGuard,
        at: Timestamp,
    ) -> Result<LedgerTransaction, LeaveError> {
        self.append_linked(draft, guard, at, |_, _| Ok(()))
    }

    /// Append one transaction together with caller records that must land
    /// in the same atomic batch (request state, accrual markers, sync
    /// queue entries). The link closure runs under the pair lock.
    pub fn append_linked(
        &self,
        draft: TransactionDraft,
        guard: AppendGuard,
        at: Timestamp,
        link: impl FnOnce(&LedgerTransaction, &mut Batch) -> Result<(), LeaveError>,
    ) -> Result<LedgerTransaction, LeaveError> {
        let mut txn = draft.finalise(at)?;
        let lock_key = Self::pair_lock_key(&txn.employee_id, &txn.leave_type);

        self.locks.with(&lock_key, move || {
            let (last_seq, balance) = self.tail_state(&txn.employee_id, &txn.leave_type)?;
            let after = balance + txn.amount;
            if guard == AppendGuard::RejectNegative && after.is_negative() {
                return Err(LeaveError::InsufficientBalance {
                    employee_id: txn.employee_id.clone(),
                    leave_type: txn.leave_type.clone(),
                    available: balance,
                    requested: txn.amount.abs(),
                });
            }
            txn.seq = last_seq + 1;

            let mut batch = Batch::default();
            batch.insert(
                Self::txn_key(&txn.employee_id, &txn.leave_type, txn.seq).into_bytes(),
                minicbor::to_vec(&txn)?,
            );

            let changed_by = txn.performed_by.clone().unwrap_or_else(|| "system".into());
            let pair = format!("{}/{}", txn.employee_id, txn.leave_type);
            let audit = AuditDraft::new(AuditTarget::Balance, &pair, &changed_by, at)
                .set_before(minicbor::to_vec(&balance)?)
                .set_after(minicbor::to_vec(&after)?)
                .set_reason(&format!("{} {}: {}", txn.kind, txn.amount, txn.reason));
            self.audit.stage(&mut batch, audit)?;
            let txn_audit =
                AuditDraft::new(AuditTarget::Transaction, &txn.transaction_id, &changed_by, at)
                    .set_after(minicbor::to_vec(&txn)?)
                    .set_reason(&txn.reason);
            self.audit.stage(&mut batch, txn_audit)?;

            link(&txn, &mut batch)?;
            self.db.apply_batch(batch)?;

            tracing::debug!(
                transaction = %txn.transaction_id,
                pair = %pair,
                amount = %txn.amount,
                balance = %after,
                "ledger append"
            );
            Ok(txn)
        })
    }

    /// Last sequence number and full sum for a pair.
    fn tail_state(
        &self,
        employee_id: &str,
        leave_type: &str,
    ) -> Result<(u64, DayAmount), LeaveError> {
        let prefix = Self::pair_prefix(employee_id, leave_type);
        let mut last_seq = 0;
        let mut sum = DayAmount::ZERO;
        for kv in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = kv?;
            let txn: LedgerTransaction = minicbor::decode(&value)?;
            sum += txn.amount;
            last_seq = txn.seq;
        }
        Ok((last_seq, sum))
    }

    /// Balance as the sum of transactions created up to `as_of`.
    pub fn balance(
        &self,
        employee_id: &str,
        leave_type: &str,
        as_of: Timestamp,
    ) -> Result<DayAmount, LeaveError> {
        let mut sum = DayAmount::ZERO;
        for txn in self.transactions(employee_id, leave_type)? {
            if txn.created_at <= as_of {
                sum += txn.amount;
            }
        }
        Ok(sum)
    }

    /// Balance over the whole ledger for the pair.
    pub fn current_balance(
        &self,
        employee_id: &str,
        leave_type: &str,
    ) -> Result<DayAmount, LeaveError> {
        Ok(self.tail_state(employee_id, leave_type)?.1)
    }

    /// All transactions for a pair in append order.
    pub fn transactions(
        &self,
        employee_id: &str,
        leave_type: &str,
    ) -> Result<Vec<LedgerTransaction>, LeaveError> {
        let prefix = Self::pair_prefix(employee_id, leave_type);
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = kv?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }

    /// Transactions created inside the closed instant range.
    pub fn transactions_between(
        &self,
        employee_id: &str,
        leave_type: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<LedgerTransaction>, LeaveError> {
        Ok(self
            .transactions(employee_id, leave_type)?
            .into_iter()
            .filter(|txn| txn.created_at >= from && txn.created_at <= to)
            .collect())
    }

    /// Recompute a pair's balance from scratch and check that sequence
    /// numbers are contiguous from 1.
    pub fn verify(
        &self,
        employee_id: &str,
        leave_type: &str,
    ) -> Result<ReconciliationReport, LeaveError> {
        let transactions = self.transactions(employee_id, leave_type)?;
        let mut sequence_intact = true;
        let mut expected = 1;
        let mut computed = DayAmount::ZERO;
        for txn in &transactions {
            if txn.seq != expected {
                sequence_intact = false;
            }
            expected += 1;
            computed += txn.amount;
        }
        Ok(ReconciliationReport {
            employee_id: employee_id.to_string(),
            leave_type: leave_type.to_string(),
            transaction_count: transactions.len() as u64,
            computed_balance: computed,
            sequence_intact,
        })
    }
}
