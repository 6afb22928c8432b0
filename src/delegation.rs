//! Approval delegation windows and the approver resolution rule.

use crate::audit::{AuditDraft, AuditRecorder, AuditTarget};
use crate::error::LeaveError;
use crate::locks::KeyedLocks;
use crate::types::{CalendarDate, Timestamp};
use crate::utils::{self, hrp};
use sled::{Batch, Db};
use std::fmt;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum DelegationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Declined,
    #[n(3)]
    Revoked,
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DelegationStatus::Pending => "pending",
            DelegationStatus::Accepted => "accepted",
            DelegationStatus::Declined => "declined",
            DelegationStatus::Revoked => "revoked",
        };
        write!(f, "{label}")
    }
}

/// A manager handing approval authority to a delegate for a date window.
/// Takes effect only once the delegate accepts.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Delegation {
    #[n(0)]
    pub delegation_id: String,
    #[n(1)]
    pub manager_id: String,
    #[n(2)]
    pub delegate_id: String,
    #[n(3)]
    pub starts_on: CalendarDate,
    /// None means open-ended.
    #[n(4)]
    pub ends_on: Option<CalendarDate>,
    #[n(5)]
    pub status: DelegationStatus,
    #[n(6)]
    pub created_at: Timestamp,
    #[n(7)]
    pub decided_at: Option<Timestamp>,
    #[n(8)]
    pub revoked_at: Option<Timestamp>,
}

impl Delegation {
    pub fn covers(&self, on: CalendarDate) -> bool {
        self.starts_on <= on && self.ends_on.is_none_or(|ends| on <= ends)
    }

    fn window_overlaps(&self, starts_on: CalendarDate, ends_on: Option<CalendarDate>) -> bool {
        let self_ends_first = self.ends_on.is_some_and(|ends| ends < starts_on);
        let other_ends_first = ends_on.is_some_and(|ends| ends < self.starts_on);
        !(self_ends_first || other_ends_first)
    }
}

pub struct DelegationService {
    db: Arc<Db>,
    audit: AuditRecorder,
    locks: Arc<KeyedLocks>,
}

impl DelegationService {
    pub(crate) fn new(db: Arc<Db>, locks: Arc<KeyedLocks>) -> Self {
        let audit = AuditRecorder::new(db.clone());
        Self { db, audit, locks }
    }

    fn key(delegation_id: &str) -> String {
        format!("dlg/{delegation_id}")
    }
    fn manager_lock_key(manager_id: &str) -> String {
        format!("dlgmgr/{manager_id}")
    }

    pub fn get(&self, delegation_id: &str) -> Result<Delegation, LeaveError> {
        match self.db.get(Self::key(delegation_id).into_bytes())? {
            Some(value) => Ok(minicbor::decode(&value)?),
            None => Err(LeaveError::NotFound {
                kind: "delegation",
                id: delegation_id.to_string(),
            }),
        }
    }

    pub fn delegations_for(&self, manager_id: &str) -> Result<Vec<Delegation>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(b"dlg/") {
            let (_, value) = kv?;
            let delegation: Delegation = minicbor::decode(&value)?;
            if delegation.manager_id == manager_id {
                out.push(delegation);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Create a pending delegation. A window overlapping an already
    /// accepted delegation for the same manager is rejected outright.
    pub fn create(
        &self,
        manager_id: &str,
        delegate_id: &str,
        starts_on: CalendarDate,
        ends_on: Option<CalendarDate>,
        now: Timestamp,
    ) -> Result<Delegation, LeaveError> {
        if manager_id == delegate_id {
            return Err(LeaveError::Validation(
                "cannot delegate approvals to yourself".into(),
            ));
        }
        if ends_on.is_some_and(|ends| ends < starts_on) {
            return Err(LeaveError::Validation(
                "delegation window ends before it starts".into(),
            ));
        }
        let lock_key = Self::manager_lock_key(manager_id);
        let delegation = self.locks.with(&lock_key, move || {
            self.ensure_no_accepted_overlap(manager_id, starts_on, ends_on, None)?;
            let delegation = Delegation {
                delegation_id: utils::mint_id(hrp::DELEGATION)?,
                manager_id: manager_id.to_string(),
                delegate_id: delegate_id.to_string(),
                starts_on,
                ends_on,
                status: DelegationStatus::Pending,
                created_at: now,
                decided_at: None,
                revoked_at: None,
            };
            self.commit(
                &delegation,
                AuditDraft::new(
                    AuditTarget::Delegation,
                    &delegation.delegation_id,
                    manager_id,
                    now,
                )
                .set_after(minicbor::to_vec(&delegation)?)
                .set_reason(&format!("delegated to {delegate_id}")),
            )?;
            Ok::<_, LeaveError>(delegation)
        })?;

        tracing::info!(
            delegation = %delegation.delegation_id,
            manager = %manager_id,
            delegate = %delegate_id,
            "delegation created"
        );
        Ok(delegation)
    }

    /// Delegate takes the window on. Re-checks the single-active-window
    /// rule since another pending delegation may have been accepted since
    /// creation.
    pub fn accept(
        &self,
        delegation_id: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<Delegation, LeaveError> {
        self.decide(delegation_id, actor, DelegationStatus::Accepted, now)
    }

    pub fn decline(
        &self,
        delegation_id: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<Delegation, LeaveError> {
        self.decide(delegation_id, actor, DelegationStatus::Declined, now)
    }

    fn decide(
        &self,
        delegation_id: &str,
        actor: &str,
        verdict: DelegationStatus,
        now: Timestamp,
    ) -> Result<Delegation, LeaveError> {
        let delegation = self.get(delegation_id)?;
        if actor != delegation.delegate_id {
            return Err(LeaveError::NotAuthorized {
                actor: actor.to_string(),
                subject: delegation_id.to_string(),
                reason: "only the delegate may decide a delegation".into(),
            });
        }
        let lock_key = Self::manager_lock_key(&delegation.manager_id);
        let updated = self.locks.with(&lock_key, move || {
            let current = self.get(delegation_id)?;
            if current.status != DelegationStatus::Pending {
                return Err(LeaveError::Validation(format!(
                    "delegation {delegation_id} is {} and cannot be decided",
                    current.status
                )));
            }
            if verdict == DelegationStatus::Accepted {
                self.ensure_no_accepted_overlap(
                    &current.manager_id,
                    current.starts_on,
                    current.ends_on,
                    Some(delegation_id),
                )?;
            }
            let mut updated = current.clone();
            updated.status = verdict;
            updated.decided_at = Some(now);
            self.commit(
                &updated,
                AuditDraft::new(AuditTarget::Delegation, delegation_id, actor, now)
                    .set_before(minicbor::to_vec(&current)?)
                    .set_after(minicbor::to_vec(&updated)?)
                    .set_reason(&format!("delegation {}", updated.status)),
            )?;
            Ok(updated)
        })?;

        tracing::info!(delegation = %delegation_id, status = %updated.status, "delegation decided");
        Ok(updated)
    }

    /// Manager withdraws the delegation. Effective immediately, at any
    /// point before the delegate declines.
    pub fn revoke(
        &self,
        delegation_id: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<Delegation, LeaveError> {
        let delegation = self.get(delegation_id)?;
        if actor != delegation.manager_id {
            return Err(LeaveError::NotAuthorized {
                actor: actor.to_string(),
                subject: delegation_id.to_string(),
                reason: "only the delegating manager may revoke".into(),
            });
        }
        let lock_key = Self::manager_lock_key(&delegation.manager_id);
        let updated = self.locks.with(&lock_key, move || {
            let current = self.get(delegation_id)?;
            if !matches!(
                current.status,
                DelegationStatus::Pending | DelegationStatus::Accepted
            ) {
                return Err(LeaveError::Validation(format!(
                    "delegation {delegation_id} is {} and cannot be revoked",
                    current.status
                )));
            }
            let mut updated = current.clone();
            updated.status = DelegationStatus::Revoked;
            updated.revoked_at = Some(now);
            self.commit(
                &updated,
                AuditDraft::new(AuditTarget::Delegation, delegation_id, actor, now)
                    .set_before(minicbor::to_vec(&current)?)
                    .set_after(minicbor::to_vec(&updated)?)
                    .set_reason("delegation revoked"),
            )?;
            Ok::<_, LeaveError>(updated)
        })?;

        tracing::info!(delegation = %delegation_id, "delegation revoked");
        Ok(updated)
    }

    /// Who approves for `manager_id` on a given day: the delegate of an
    /// accepted covering window, otherwise the manager.
    pub fn resolve_approver(
        &self,
        manager_id: &str,
        on: CalendarDate,
    ) -> Result<String, LeaveError> {
        for delegation in self.delegations_for(manager_id)? {
            if delegation.status == DelegationStatus::Accepted && delegation.covers(on) {
                return Ok(delegation.delegate_id);
            }
        }
        Ok(manager_id.to_string())
    }

    fn ensure_no_accepted_overlap(
        &self,
        manager_id: &str,
        starts_on: CalendarDate,
        ends_on: Option<CalendarDate>,
        skip_id: Option<&str>,
    ) -> Result<(), LeaveError> {
        for existing in self.delegations_for(manager_id)? {
            if skip_id == Some(existing.delegation_id.as_str()) {
                continue;
            }
            if existing.status == DelegationStatus::Accepted
                && existing.window_overlaps(starts_on, ends_on)
            {
                return Err(LeaveError::DelegationOverlap {
                    existing_id: existing.delegation_id,
                });
            }
        }
        Ok(())
    }

    /// Write the delegation and its audit row in one batch, under the
    /// caller's manager lock so chain sequence numbers cannot collide.
    fn commit(&self, delegation: &Delegation, draft: AuditDraft) -> Result<(), LeaveError> {
        let mut batch = Batch::default();
        batch.insert(
            Self::key(&delegation.delegation_id).into_bytes(),
            minicbor::to_vec(delegation)?,
        );
        self.audit.stage(&mut batch, draft)?;
        self.db.apply_batch(batch)?;
        Ok(())
    }
}
