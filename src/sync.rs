//! Integration log and the at-least-once delivery worker
//!
//! Finalized requests and balance changes are handed to payroll and time
//! management through durable log entries. Delivery retries with
//! exponential backoff up to a bounded attempt count; exhausted entries
//! stay failed for an operator.

use crate::audit::{AuditDraft, AuditRecorder, AuditTarget};
use crate::error::LeaveError;
use crate::locks::KeyedLocks;
use crate::request::RequestStore;
use crate::types::Timestamp;
use crate::utils::{self, hrp};
use sled::{Batch, Db};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ExternalSystem {
    #[n(0)]
    Payroll,
    #[n(1)]
    TimeManagement,
    #[n(2)]
    Other,
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExternalSystem::Payroll => "payroll",
            ExternalSystem::TimeManagement => "time_management",
            ExternalSystem::Other => "other",
        };
        write!(f, "{label}")
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncAction {
    #[n(0)]
    UpdateBalance,
    #[n(1)]
    BlockAttendance,
    #[n(2)]
    UnblockAttendance,
    #[n(3)]
    Encashment,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncAction::UpdateBalance => "update_balance",
            SyncAction::BlockAttendance => "block_attendance",
            SyncAction::UnblockAttendance => "unblock_attendance",
            SyncAction::Encashment => "encashment",
        };
        write!(f, "{label}")
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncStatus {
    #[n(0)]
    Pending,
    /// Dispatch issued, ack not yet recorded.
    #[n(1)]
    Sent,
    #[n(2)]
    Success,
    #[n(3)]
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Sent => "sent",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncEntity {
    #[n(0)]
    Request,
    #[n(1)]
    Balance,
}

impl fmt::Display for SyncEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEntity::Request => write!(f, "request"),
            SyncEntity::Balance => write!(f, "balance"),
        }
    }
}

/// One outbound delivery and its retry state. Entries are superseded,
/// never deleted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct IntegrationLog {
    #[n(0)]
    pub log_id: String,
    #[n(1)]
    pub entity: SyncEntity,
    #[n(2)]
    pub entity_id: String,
    #[n(3)]
    pub system: ExternalSystem,
    #[n(4)]
    pub action: SyncAction,
    #[n(5)]
    pub summary: String,
    #[n(6)]
    pub status: SyncStatus,
    #[n(7)]
    pub attempts: u32,
    #[n(8)]
    pub last_attempt_at: Option<Timestamp>,
    #[n(9)]
    pub last_error: Option<String>,
    /// Identifier the receiving system assigned on success.
    #[n(10)]
    pub external_id: Option<String>,
    #[n(11)]
    pub next_attempt_at: Option<Timestamp>,
    #[n(12)]
    pub superseded: bool,
    #[n(13)]
    pub created_at: Timestamp,
}

/// A Sent entry older than this never got its ack recorded (crash
/// between dispatch and the durable outcome) and is offered again.
const SENT_STALE_SECS: i64 = 300;

impl IntegrationLog {
    /// Dispatch was issued long enough ago without an ack that the
    /// attempt is presumed lost in flight.
    pub fn sent_stale(&self, now: Timestamp) -> bool {
        self.status == SyncStatus::Sent
            && self
                .last_attempt_at
                .is_some_and(|at| at.plus(chrono::Duration::seconds(SENT_STALE_SECS)) <= now)
    }
}

/// Receiving side's answer to one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryAck {
    Applied { external_id: String },
    /// A retried attempt the receiver had already applied. Success.
    AlreadyApplied,
    Rejected { reason: String },
}

/// Transport to one external system. Implementations must tolerate
/// duplicate deliveries of the same entry.
pub trait SyncTarget: Send + Sync {
    fn deliver(&self, entry: &IntegrationLog) -> anyhow::Result<DeliveryAck>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            multiplier: 2,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt after `attempts` failures.
    fn delay_after(&self, attempts: u32) -> chrono::Duration {
        let factor = self.multiplier.saturating_pow(attempts.saturating_sub(1));
        let secs = self.base_delay_secs.saturating_mul(u64::from(factor));
        chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Db>,
    audit: AuditRecorder,
}

impl SyncQueue {
    pub(crate) fn new(db: Arc<Db>) -> Self {
        let audit = AuditRecorder::new(db.clone());
        Self { db, audit }
    }

    fn key(log_id: &str) -> String {
        format!("log/{log_id}")
    }

    /// Build a pending entry due immediately. Not yet persisted; pass it
    /// to `stage` or `enqueue`.
    pub(crate) fn new_entry(
        entity: SyncEntity,
        entity_id: &str,
        system: ExternalSystem,
        action: SyncAction,
        summary: &str,
        now: Timestamp,
    ) -> Result<IntegrationLog, LeaveError> {
        Ok(IntegrationLog {
            log_id: utils::mint_id(hrp::SYNC_LOG)?,
            entity,
            entity_id: entity_id.to_string(),
            system,
            action,
            summary: summary.to_string(),
            status: SyncStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            external_id: None,
            next_attempt_at: Some(now),
            superseded: false,
            created_at: now,
        })
    }

    /// Stage a new entry plus its audit row on the caller's batch.
    pub(crate) fn stage(&self, batch: &mut Batch, entry: &IntegrationLog) -> Result<(), LeaveError> {
        batch.insert(Self::key(&entry.log_id).into_bytes(), minicbor::to_vec(entry)?);
        self.audit.stage(
            batch,
            AuditDraft::new(AuditTarget::IntegrationLog, &entry.log_id, "system", entry.created_at)
                .set_after(minicbor::to_vec(entry)?)
                .set_reason(&format!("enqueued {} for {}", entry.action, entry.system)),
        )?;
        Ok(())
    }

    /// Synchronous fire-and-forget handoff; delivery happens in the worker.
    pub fn enqueue(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        system: ExternalSystem,
        action: SyncAction,
        summary: &str,
        now: Timestamp,
    ) -> Result<IntegrationLog, LeaveError> {
        let entry = Self::new_entry(entity, entity_id, system, action, summary, now)?;
        let mut batch = Batch::default();
        self.stage(&mut batch, &entry)?;
        self.db.apply_batch(batch)?;
        tracing::debug!(log = %entry.log_id, system = %system, action = %action, "sync entry enqueued");
        Ok(entry)
    }

    pub(crate) fn put(&self, entry: &IntegrationLog) -> Result<(), LeaveError> {
        self.db
            .insert(Self::key(&entry.log_id).into_bytes(), minicbor::to_vec(entry)?)?;
        Ok(())
    }

    pub fn get(&self, log_id: &str) -> Result<IntegrationLog, LeaveError> {
        match self.db.get(Self::key(log_id).into_bytes())? {
            Some(value) => Ok(minicbor::decode(&value)?),
            None => Err(LeaveError::NotFound {
                kind: "integration log",
                id: log_id.to_string(),
            }),
        }
    }

    pub fn entries(&self) -> Result<Vec<IntegrationLog>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(b"log/") {
            let (_, value) = kv?;
            out.push(minicbor::decode(&value)?);
        }
        out.sort_by(|a: &IntegrationLog, b: &IntegrationLog| {
            (a.created_at, &a.log_id).cmp(&(b.created_at, &b.log_id))
        });
        Ok(out)
    }

    pub fn for_entity(
        &self,
        entity: SyncEntity,
        entity_id: &str,
    ) -> Result<Vec<IntegrationLog>, LeaveError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.entity == entity && e.entity_id == entity_id)
            .collect())
    }

    /// Entries ready for a delivery attempt, oldest first. Sent entries
    /// are in flight and skipped until they sit unacked past the stale
    /// window, after which they are offered for redelivery.
    pub fn due(&self, now: Timestamp) -> Result<Vec<IntegrationLog>, LeaveError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| {
                if e.superseded {
                    return false;
                }
                match e.status {
                    SyncStatus::Pending | SyncStatus::Failed => {
                        e.next_attempt_at.is_some_and(|at| at <= now)
                    }
                    SyncStatus::Sent => e.sent_stale(now),
                    SyncStatus::Success => false,
                }
            })
            .collect())
    }

    /// Withdraw undelivered entries for an entity, e.g. after an early
    /// return releases blocked days. Entries are flagged, never deleted.
    pub fn supersede(
        &self,
        entity: SyncEntity,
        entity_id: &str,
        now: Timestamp,
    ) -> Result<u32, LeaveError> {
        let mut count = 0;
        for entry in self.for_entity(entity, entity_id)? {
            if entry.status == SyncStatus::Success || entry.superseded {
                continue;
            }
            self.mark_superseded(&entry.log_id, now)?;
            count += 1;
        }
        if count > 0 {
            tracing::info!(entity = %entity, id = %entity_id, count, "sync entries superseded");
        }
        Ok(count)
    }

    pub fn mark_superseded(&self, log_id: &str, now: Timestamp) -> Result<IntegrationLog, LeaveError> {
        let mut entry = self.get(log_id)?;
        let before = minicbor::to_vec(&entry)?;
        entry.superseded = true;
        self.commit_with_audit(&entry, before, "system", "superseded", now)?;
        Ok(entry)
    }

    /// Re-arm an exhausted entry, or a dispatch whose ack was lost before
    /// it could be recorded, after operator intervention.
    pub fn retry_failed(&self, log_id: &str, now: Timestamp) -> Result<IntegrationLog, LeaveError> {
        let mut entry = self.get(log_id)?;
        if !matches!(entry.status, SyncStatus::Failed | SyncStatus::Sent) {
            return Err(LeaveError::Validation(format!(
                "integration log {log_id} is {} and cannot be re-armed",
                entry.status
            )));
        }
        if entry.superseded {
            return Err(LeaveError::Validation(format!(
                "integration log {log_id} is superseded"
            )));
        }
        let before = minicbor::to_vec(&entry)?;
        entry.status = SyncStatus::Pending;
        entry.attempts = 0;
        entry.next_attempt_at = Some(now);
        self.commit_with_audit(&entry, before, "operator", "re-armed", now)?;
        tracing::info!(log = %log_id, "integration log re-armed");
        Ok(entry)
    }

    /// Write the entry and its audit row in one batch.
    fn commit_with_audit(
        &self,
        entry: &IntegrationLog,
        before: Vec<u8>,
        changed_by: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<(), LeaveError> {
        let mut batch = Batch::default();
        batch.insert(Self::key(&entry.log_id).into_bytes(), minicbor::to_vec(entry)?);
        self.audit.stage(
            &mut batch,
            AuditDraft::new(AuditTarget::IntegrationLog, &entry.log_id, changed_by, now)
                .set_before(before)
                .set_after(minicbor::to_vec(entry)?)
                .set_reason(reason),
        )?;
        self.db.apply_batch(batch)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Delivered {
        log_id: String,
    },
    Failed {
        log_id: String,
        attempts: u32,
        exhausted: bool,
    },
}

/// Background delivery loop. One worker per process; `due` treats fresh
/// Sent entries as in flight, so concurrent workers would double-dispatch.
pub struct SyncWorker {
    queue: SyncQueue,
    requests: RequestStore,
    locks: Arc<KeyedLocks>,
    targets: HashMap<ExternalSystem, Arc<dyn SyncTarget>>,
    policy: RetryPolicy,
}

impl SyncWorker {
    pub(crate) fn new(queue: SyncQueue, requests: RequestStore, locks: Arc<KeyedLocks>) -> Self {
        Self {
            queue,
            requests,
            locks,
            targets: HashMap::new(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn register_target(mut self, system: ExternalSystem, target: Arc<dyn SyncTarget>) -> Self {
        self.targets.insert(system, target);
        self
    }

    pub fn set_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attempt the oldest due entry, if any.
    pub fn tick(&self, now: Timestamp) -> Result<Option<TickOutcome>, LeaveError> {
        match self.queue.due(now)?.into_iter().next() {
            Some(entry) => Ok(Some(self.attempt(entry, now)?)),
            None => Ok(None),
        }
    }

    /// Attempt everything due at `now`, each entry once.
    pub fn run_due(&self, now: Timestamp) -> Result<Vec<TickOutcome>, LeaveError> {
        let mut outcomes = Vec::new();
        for entry in self.queue.due(now)? {
            outcomes.push(self.attempt(entry, now)?);
        }
        Ok(outcomes)
    }

    fn attempt(&self, mut entry: IntegrationLog, now: Timestamp) -> Result<TickOutcome, LeaveError> {
        entry.status = SyncStatus::Sent;
        entry.attempts += 1;
        entry.last_attempt_at = Some(now);
        self.queue.put(&entry)?;

        let delivered = match self.targets.get(&entry.system) {
            Some(target) => target.deliver(&entry),
            None => Err(anyhow::anyhow!(
                "no sync target registered for {}",
                entry.system
            )),
        };

        match delivered {
            Ok(DeliveryAck::Applied { external_id }) => {
                entry.external_id = Some(external_id);
                self.succeed(entry)
            }
            Ok(DeliveryAck::AlreadyApplied) => self.succeed(entry),
            Ok(DeliveryAck::Rejected { reason }) => self.fail(entry, reason, now),
            Err(err) => self.fail(entry, err.to_string(), now),
        }
    }

    fn succeed(&self, mut entry: IntegrationLog) -> Result<TickOutcome, LeaveError> {
        entry.status = SyncStatus::Success;
        entry.last_error = None;
        entry.next_attempt_at = None;
        self.queue.put(&entry)?;
        self.mirror(&entry)?;
        tracing::info!(
            log = %entry.log_id,
            system = %entry.system,
            attempts = entry.attempts,
            "sync delivered"
        );
        Ok(TickOutcome::Delivered {
            log_id: entry.log_id,
        })
    }

    fn fail(
        &self,
        mut entry: IntegrationLog,
        error: String,
        now: Timestamp,
    ) -> Result<TickOutcome, LeaveError> {
        entry.status = SyncStatus::Failed;
        entry.last_error = Some(error);
        let exhausted = entry.attempts >= self.policy.max_attempts;
        entry.next_attempt_at = if exhausted {
            None
        } else {
            Some(now.plus(self.policy.delay_after(entry.attempts)))
        };
        self.queue.put(&entry)?;
        self.mirror(&entry)?;
        if exhausted {
            tracing::error!(
                log = %entry.log_id,
                system = %entry.system,
                attempts = entry.attempts,
                error = entry.last_error.as_deref().unwrap_or(""),
                "sync delivery exhausted, needs operator attention"
            );
        } else {
            tracing::warn!(
                log = %entry.log_id,
                system = %entry.system,
                attempts = entry.attempts,
                "sync delivery failed, will retry"
            );
        }
        Ok(TickOutcome::Failed {
            log_id: entry.log_id,
            attempts: entry.attempts,
            exhausted,
        })
    }

    /// Reflect delivery outcomes onto the originating request's sync
    /// status mirrors.
    fn mirror(&self, entry: &IntegrationLog) -> Result<(), LeaveError> {
        if entry.entity != SyncEntity::Request || entry.system == ExternalSystem::Other {
            return Ok(());
        }
        let lock_key = RequestStore::lock_key(&entry.entity_id);
        self.locks.with(&lock_key, || {
            let mut request = match self.requests.get(&entry.entity_id) {
                Ok(request) => request,
                Err(LeaveError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(err),
            };
            match entry.system {
                ExternalSystem::Payroll => request.payroll_sync = Some(entry.status),
                ExternalSystem::TimeManagement => request.time_sync = Some(entry.status),
                ExternalSystem::Other => {}
            }
            self.requests.save(&request)
        })
    }

    /// Poll in a background thread until the handle is dropped.
    pub fn run(self: Arc<Self>, poll: Duration) -> SyncWorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                if let Err(err) = self.run_due(Timestamp::now()) {
                    tracing::error!(error = %err, "sync worker pass failed");
                }
                thread::park_timeout(poll);
            }
        });
        SyncWorkerHandle {
            stop,
            thread: Some(thread),
        }
    }
}

pub struct SyncWorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SyncWorkerHandle {
    pub fn shutdown(self) {}
}

impl Drop for SyncWorkerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}
