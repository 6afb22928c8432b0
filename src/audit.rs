//! Immutable audit trail with per-target hash chaining
//!
//! Every mutation to balances, requests, transactions, delegations, and
//! integration logs writes an audit record in the same batch as the
//! mutation itself. Each record carries a
//! sha256 content hash and the hash of its antecedent, so tampering with
//! any stored record breaks the chain for that target.

use crate::error::LeaveError;
use crate::types::Timestamp;
use crate::utils::{self, hrp};
use sled::{Batch, Db};
use std::fmt;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuditTarget {
    #[n(0)]
    Balance,
    #[n(1)]
    Request,
    #[n(2)]
    Transaction,
    #[n(3)]
    Delegation,
    #[n(4)]
    IntegrationLog,
}

impl AuditTarget {
    fn key_part(&self) -> &'static str {
        match self {
            AuditTarget::Balance => "balance",
            AuditTarget::Request => "request",
            AuditTarget::Transaction => "transaction",
            AuditTarget::Delegation => "delegation",
            AuditTarget::IntegrationLog => "integration_log",
        }
    }
}

impl fmt::Display for AuditTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_part())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AuditRecord {
    #[n(0)]
    pub audit_id: String,
    #[n(1)]
    pub target: AuditTarget,
    #[n(2)]
    pub target_id: String,
    #[n(3)]
    pub changed_by: String,
    #[n(4)]
    pub before: Option<Vec<u8>>,
    #[n(5)]
    pub after: Option<Vec<u8>>,
    #[n(6)]
    pub reason: String,
    #[n(7)]
    pub seq: u64,
    #[n(8)]
    pub prev_hash: Option<String>,
    #[n(9)]
    pub content_hash: String,
    #[n(10)]
    pub created_at: Timestamp,
}

impl AuditRecord {
    /// Hash over the encoded record with `content_hash` blanked out.
    fn compute_hash(&self) -> Result<String, LeaveError> {
        let mut unsealed = self.clone();
        unsealed.content_hash = String::new();
        let cbor = minicbor::to_vec(&unsealed)?;
        Ok(sha256::digest(&cbor))
    }

    pub fn verify(&self) -> Result<bool, LeaveError> {
        Ok(self.compute_hash()? == self.content_hash)
    }
}

/// Builder for one audit entry; before/after hold CBOR snapshots of the
/// mutated entity.
pub struct AuditDraft {
    target: AuditTarget,
    target_id: String,
    changed_by: String,
    before: Option<Vec<u8>>,
    after: Option<Vec<u8>>,
    reason: String,
    at: Timestamp,
}

impl AuditDraft {
    pub fn new(target: AuditTarget, target_id: &str, changed_by: &str, at: Timestamp) -> Self {
        Self {
            target,
            target_id: target_id.to_string(),
            changed_by: changed_by.to_string(),
            before: None,
            after: None,
            reason: String::new(),
            at,
        }
    }
    pub fn set_before(mut self, snapshot: Vec<u8>) -> Self {
        self.before = Some(snapshot);
        self
    }
    pub fn set_after(mut self, snapshot: Vec<u8>) -> Self {
        self.after = Some(snapshot);
        self
    }
    pub fn set_reason(mut self, reason: &str) -> Self {
        self.reason = reason.to_string();
        self
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    db: Arc<Db>,
}

impl AuditRecorder {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn record_key(target: AuditTarget, target_id: &str, seq: u64) -> String {
        format!("adt/{}/{}/{:020}", target.key_part(), target_id, seq)
    }

    fn chain_prefix(target: AuditTarget, target_id: &str) -> String {
        format!("adt/{}/{}/", target.key_part(), target_id)
    }

    fn last_record(
        &self,
        target: AuditTarget,
        target_id: &str,
    ) -> Result<Option<AuditRecord>, LeaveError> {
        let prefix = Self::chain_prefix(target, target_id);
        match self.db.scan_prefix(prefix.as_bytes()).next_back() {
            Some(kv) => {
                let (_, value) = kv?;
                Ok(Some(minicbor::decode(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Seal the next record in the target's chain and stage it on the
    /// caller's batch, so it commits atomically with the mutation.
    pub fn stage(&self, batch: &mut Batch, draft: AuditDraft) -> Result<AuditRecord, LeaveError> {
        let last = self.last_record(draft.target, &draft.target_id)?;
        let seq = last.as_ref().map(|r| r.seq + 1).unwrap_or(1);
        let prev_hash = last.map(|r| r.content_hash);

        let mut record = AuditRecord {
            audit_id: utils::mint_id(hrp::AUDIT)?,
            target: draft.target,
            target_id: draft.target_id,
            changed_by: draft.changed_by,
            before: draft.before,
            after: draft.after,
            reason: draft.reason,
            seq,
            prev_hash,
            content_hash: String::new(),
            created_at: draft.at,
        };
        record.content_hash = record.compute_hash()?;

        let key = Self::record_key(record.target, &record.target_id, record.seq);
        batch.insert(key.into_bytes(), minicbor::to_vec(&record)?);
        Ok(record)
    }

    /// Standalone append for callers whose mutation has already committed.
    /// A failure here is logged and swallowed; the business mutation stands.
    pub fn record(&self, draft: AuditDraft) -> Option<AuditRecord> {
        let mut batch = Batch::default();
        let staged = match self.stage(&mut batch, draft) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "audit record could not be built; mutation stands unaudited");
                return None;
            }
        };
        match self.db.apply_batch(batch) {
            Ok(()) => Some(staged),
            Err(err) => {
                tracing::warn!(%err, audit_id = %staged.audit_id, "audit append failed after commit; mutation stands unaudited");
                None
            }
        }
    }

    /// Full history for one target, oldest first.
    pub fn history(
        &self,
        target: AuditTarget,
        target_id: &str,
    ) -> Result<Vec<AuditRecord>, LeaveError> {
        let prefix = Self::chain_prefix(target, target_id);
        let mut records = Vec::new();
        for kv in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = kv?;
            records.push(minicbor::decode(&value)?);
        }
        Ok(records)
    }

    /// Recompute every hash in a target's chain and check the antecedent
    /// links. Returns false on the first broken record.
    pub fn verify_chain(
        &self,
        target: AuditTarget,
        target_id: &str,
    ) -> Result<bool, LeaveError> {
        let mut prev: Option<String> = None;
        for record in self.history(target, target_id)? {
            if !record.verify()? || record.prev_hash != prev {
                return Ok(false);
            }
            prev = Some(record.content_hash.clone());
        }
        Ok(true)
    }
}
