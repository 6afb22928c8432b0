//! Service layer API for leave adjudication
//!
//! `LeaveService` owns the stores and drives a request from submission
//! through approval to finalization, appending ledger transactions and
//! integration log entries as outcomes land.

use crate::accrual::AccrualEngine;
use crate::audit::{AuditDraft, AuditRecorder, AuditTarget};
use crate::calendar::WorkCalendar;
use crate::delegation::DelegationService;
use crate::directory::{EmployeeDirectory, EmploymentStatus};
use crate::entitlement::{EntitlementResolver, PrecedencePolicy};
use crate::error::LeaveError;
use crate::ledger::{
    AppendGuard, LedgerStore, LedgerTransaction, TransactionDraft, TransactionKind,
};
use crate::locks::KeyedLocks;
use crate::notify::{NoopNotifier, Notifier, NotifyEvent};
use crate::policy::{InsufficientBalancePolicy, PolicyStore};
use crate::request::{
    ApprovalAction, ApproverRole, LeaveRequest, RequestDraft, RequestStatus, RequestStore,
};
use crate::sync::{ExternalSystem, SyncAction, SyncEntity, SyncQueue, SyncStatus, SyncWorker};
use crate::types::{CalendarDate, DayAmount, Timestamp};
use crate::utils::{self, hrp};
use sled::{Batch, Db};
use std::sync::Arc;

pub struct LeaveService {
    db: Arc<Db>,
    locks: Arc<KeyedLocks>,
    directory: Arc<dyn EmployeeDirectory>,
    calendar: Arc<dyn WorkCalendar>,
    notifier: Arc<dyn Notifier>,
    ledger: LedgerStore,
    requests: RequestStore,
    policies: PolicyStore,
    entitlements: EntitlementResolver,
    delegations: DelegationService,
    accruals: AccrualEngine,
    queue: SyncQueue,
    audit: AuditRecorder,
}

impl LeaveService {
    pub fn new(
        db: Arc<Db>,
        directory: Arc<dyn EmployeeDirectory>,
        calendar: Arc<dyn WorkCalendar>,
    ) -> Self {
        let locks = Arc::new(KeyedLocks::new());
        let ledger = LedgerStore::new(db.clone(), locks.clone());
        let accruals = AccrualEngine::new(
            db.clone(),
            ledger.clone(),
            directory.clone(),
            locks.clone(),
        );
        Self {
            requests: RequestStore::new(db.clone()),
            policies: PolicyStore::new(db.clone()),
            entitlements: EntitlementResolver::new(db.clone(), directory.clone()),
            delegations: DelegationService::new(db.clone(), locks.clone()),
            queue: SyncQueue::new(db.clone()),
            audit: AuditRecorder::new(db.clone()),
            notifier: Arc::new(NoopNotifier),
            db,
            locks,
            directory,
            calendar,
            ledger,
            accruals,
        }
    }

    pub fn set_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn set_entitlement_precedence(mut self, precedence: PrecedencePolicy) -> Self {
        self.entitlements = self.entitlements.set_precedence(precedence);
        self
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }
    pub fn requests(&self) -> &RequestStore {
        &self.requests
    }
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }
    pub fn entitlements(&self) -> &EntitlementResolver {
        &self.entitlements
    }
    pub fn delegations(&self) -> &DelegationService {
        &self.delegations
    }
    pub fn accruals(&self) -> &AccrualEngine {
        &self.accruals
    }
    pub fn sync_queue(&self) -> &SyncQueue {
        &self.queue
    }
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Worker sharing this service's queue, request store and locks.
    /// Register targets on it, then drive it on a schedule or by hand.
    pub fn sync_worker(&self) -> SyncWorker {
        SyncWorker::new(self.queue.clone(), self.requests.clone(), self.locks.clone())
    }

    /// Submit a leave request. Computes the working-day span, detects
    /// overlaps with the employee's other active requests, resolves the
    /// entitlement and routes the manager step through any accepted
    /// delegation. The request lands in PendingManager.
    pub fn submit_request(
        &self,
        draft: RequestDraft,
        now: Timestamp,
    ) -> Result<LeaveRequest, LeaveError> {
        let draft = draft.validate()?;
        let profile =
            self.directory
                .profile(&draft.employee_id)
                .ok_or_else(|| LeaveError::NotFound {
                    kind: "employee",
                    id: draft.employee_id.clone(),
                })?;
        if profile.status == EmploymentStatus::Terminated {
            return Err(LeaveError::Validation(format!(
                "employee {} is terminated and cannot request leave",
                draft.employee_id
            )));
        }
        let policy = self.policies.get(&draft.leave_type)?;

        let requested_days =
            DayAmount::days(draft.start_date.inclusive_days_until(draft.end_date));
        let net = self.calendar.net_days(draft.start_date, draft.end_date);
        if net == 0 {
            return Err(LeaveError::Validation(
                "requested range contains no working days".into(),
            ));
        }
        let net_days = DayAmount::days(i64::from(net));

        // Failed eligibility still creates the request, flagged so the
        // whole span finalizes unpaid.
        let (applied_rule_id, mut exceeds) = match self.entitlements.resolve(
            &draft.employee_id,
            &draft.leave_type,
            draft.start_date,
        ) {
            Ok(resolved) => (Some(resolved.applied_rule_id), false),
            Err(LeaveError::EligibilityNotMet { .. }) => (None, true),
            Err(err) => return Err(err),
        };
        let balance = self
            .ledger
            .current_balance(&draft.employee_id, &draft.leave_type)?;
        if net_days > balance {
            exceeds = true;
        }

        let mut overlapping = Vec::new();
        for other in self.requests.for_employee(&draft.employee_id)? {
            let active = matches!(
                other.status,
                RequestStatus::PendingManager
                    | RequestStatus::ManagerApproved
                    | RequestStatus::HrApproved
                    | RequestStatus::Finalized
            );
            if active && other.overlaps(draft.start_date, draft.end_date) {
                overlapping.push(other.request_id);
            }
        }

        let manager_id = profile.manager_id.clone().ok_or_else(|| {
            LeaveError::Validation(format!(
                "employee {} has no manager to approve leave",
                draft.employee_id
            ))
        })?;
        let approver = self.delegations.resolve_approver(&manager_id, now.date())?;

        let mut request = LeaveRequest {
            request_id: utils::mint_id(hrp::REQUEST)?,
            employee_id: draft.employee_id,
            leave_type: draft.leave_type,
            applied_rule_id,
            start_date: draft.start_date,
            end_date: draft.end_date,
            requested_days,
            net_days,
            justification: draft.justification,
            attachments: draft.attachments,
            status: RequestStatus::Submitted,
            is_post_leave: draft.start_date < now.date(),
            approval_records: Vec::new(),
            has_overlap_with_approved: !overlapping.is_empty(),
            overlapping_request_ids: overlapping,
            exceeds_entitlement: exceeds,
            converted_unpaid_days: DayAmount::ZERO,
            released_days: DayAmount::ZERO,
            payroll_sync: None,
            time_sync: None,
            current_approver: Some(approver.clone()),
            finalized_by: None,
            finalized_at: None,
            grace_period_hours: draft
                .grace_period_hours
                .unwrap_or(policy.default_grace_period_hours),
            escalated_at: None,
            submitted_at: now,
        };
        if approver != manager_id {
            request.record_approval(
                &manager_id,
                ApproverRole::Manager,
                ApprovalAction::Delegated,
                Some(&format!("delegated to {approver}")),
                now,
            );
        }
        request.transition(RequestStatus::PendingManager)?;

        self.save_with_audit(None, &request, &request.employee_id, "request submitted", now)?;
        self.notifier.notify(NotifyEvent::RequestSubmitted {
            request_id: request.request_id.clone(),
            approver_id: approver,
        });
        tracing::info!(
            request = %request.request_id,
            employee = %request.employee_id,
            net = %request.net_days,
            exceeds = request.exceeds_entitlement,
            "leave request submitted"
        );
        Ok(request)
    }

    /// Approve the step the request is waiting on: the manager step in
    /// PendingManager, the HR step in ManagerApproved. Finalizes outright
    /// when no HR review is called for.
    pub fn approve_request(
        &self,
        request_id: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<LeaveRequest, LeaveError> {
        let lock_key = RequestStore::lock_key(request_id);
        let (request, events) = self.locks.with(&lock_key, move || {
            let request = self.requests.get(request_id)?;
            match request.status {
                RequestStatus::PendingManager => self.manager_approve(request, actor, now),
                RequestStatus::ManagerApproved => self.hr_approve(request, actor, now),
                _ => Err(LeaveError::IllegalTransition {
                    request_id: request_id.to_string(),
                    from: request.status.to_string(),
                    to: "an approved state".to_string(),
                }),
            }
        })?;
        for event in events {
            self.notifier.notify(event);
        }
        Ok(request)
    }

    fn manager_approve(
        &self,
        mut request: LeaveRequest,
        actor: &str,
        now: Timestamp,
    ) -> Result<(LeaveRequest, Vec<NotifyEvent>), LeaveError> {
        self.ensure_manager_actor(&request, actor, now)?;
        let before = minicbor::to_vec(&request)?;
        request.record_approval(actor, ApproverRole::Manager, ApprovalAction::Approved, None, now);
        request.transition(RequestStatus::ManagerApproved)?;

        let policy = self.policies.get(&request.leave_type)?;
        if request.exceeds_entitlement || policy.requires_hr_approval {
            // Wait in the HR queue instead of finalizing.
            self.save_with_audit(Some(before), &request, actor, "manager approved, awaiting hr", now)?;
            tracing::info!(request = %request.request_id, "manager approved, hr review required");
            let event = NotifyEvent::RequestDecided {
                request_id: request.request_id.clone(),
                approved: true,
                decided_by: actor.to_string(),
            };
            return Ok((request, vec![event]));
        }
        let events = self.finalize(&mut request, actor, now)?;
        Ok((request, events))
    }

    fn hr_approve(
        &self,
        mut request: LeaveRequest,
        actor: &str,
        now: Timestamp,
    ) -> Result<(LeaveRequest, Vec<NotifyEvent>), LeaveError> {
        if actor == request.employee_id {
            return Err(LeaveError::NotAuthorized {
                actor: actor.to_string(),
                subject: request.request_id.clone(),
                reason: "employees cannot approve their own requests".into(),
            });
        }
        request.record_approval(actor, ApproverRole::Hr, ApprovalAction::Approved, None, now);
        request.transition(RequestStatus::HrApproved)?;
        let events = self.finalize(&mut request, actor, now)?;
        Ok((request, events))
    }

    /// Debit the ledger and close the request. The take transaction, the
    /// request state, its audit row and both integration log entries
    /// commit in one batch; a shortfall follows the leave type policy.
    fn finalize(
        &self,
        request: &mut LeaveRequest,
        actor: &str,
        now: Timestamp,
    ) -> Result<Vec<NotifyEvent>, LeaveError> {
        let before = minicbor::to_vec(&*request)?;
        let policy = self.policies.get(&request.leave_type)?;
        let balance = self
            .ledger
            .current_balance(&request.employee_id, &request.leave_type)?;
        let net = request.net_days;
        let (debit, unpaid) = if balance >= net {
            (net, DayAmount::ZERO)
        } else {
            match policy.insufficient_balance {
                InsufficientBalancePolicy::Reject => {
                    return Err(LeaveError::InsufficientBalance {
                        employee_id: request.employee_id.clone(),
                        leave_type: request.leave_type.clone(),
                        available: balance,
                        requested: net,
                    });
                }
                InsufficientBalancePolicy::ConvertToUnpaid => {
                    let covered = balance.max(DayAmount::ZERO).min(net);
                    (covered, net - covered)
                }
            }
        };

        request.transition(RequestStatus::Finalized)?;
        request.converted_unpaid_days = unpaid;
        request.finalized_by = Some(actor.to_string());
        request.finalized_at = Some(now);
        request.payroll_sync = Some(SyncStatus::Pending);
        request.time_sync = Some(SyncStatus::Pending);

        let payroll = SyncQueue::new_entry(
            SyncEntity::Request,
            &request.request_id,
            ExternalSystem::Payroll,
            SyncAction::UpdateBalance,
            &format!(
                "leave for {}: {} debited, {} unpaid",
                request.employee_id, debit, unpaid
            ),
            now,
        )?;
        let time = SyncQueue::new_entry(
            SyncEntity::Request,
            &request.request_id,
            ExternalSystem::TimeManagement,
            SyncAction::BlockAttendance,
            &format!(
                "block {} to {} for {}",
                request.start_date, request.end_date, request.employee_id
            ),
            now,
        )?;
        let audit = AuditDraft::new(AuditTarget::Request, &request.request_id, actor, now)
            .set_before(before)
            .set_after(minicbor::to_vec(&*request)?)
            .set_reason(&format!("finalized, {debit} debited, {unpaid} unpaid"));

        if debit.is_positive() {
            let draft = TransactionDraft::new()
                .set_employee(&request.employee_id)
                .set_leave_type(&request.leave_type)
                .set_kind(TransactionKind::Take)
                .set_amount(-debit)
                .set_origin_request(&request.request_id)
                .set_performed_by(actor)
                .set_reason(&format!(
                    "leave {} to {}",
                    request.start_date, request.end_date
                ));
            let staged = &*request;
            self.ledger
                .append_linked(draft, AppendGuard::RejectNegative, now, |_, batch| {
                    self.requests.put_in(batch, staged)?;
                    self.audit.stage(batch, audit)?;
                    self.queue.stage(batch, &payroll)?;
                    self.queue.stage(batch, &time)?;
                    Ok(())
                })?;
        } else {
            // Nothing left to debit; the whole span converts to unpaid.
            let mut batch = Batch::default();
            self.requests.put_in(&mut batch, request)?;
            self.audit.stage(&mut batch, audit)?;
            self.queue.stage(&mut batch, &payroll)?;
            self.queue.stage(&mut batch, &time)?;
            self.db.apply_batch(batch)?;
        }

        tracing::info!(
            request = %request.request_id,
            debit = %debit,
            unpaid = %unpaid,
            "leave request finalized"
        );
        Ok(vec![NotifyEvent::RequestFinalized {
            request_id: request.request_id.clone(),
            employee_id: request.employee_id.clone(),
        }])
    }

    /// Reject the pending step. Terminal; appends no ledger transaction.
    pub fn reject_request(
        &self,
        request_id: &str,
        actor: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<LeaveRequest, LeaveError> {
        if reason.trim().is_empty() {
            return Err(LeaveError::Validation(
                "a rejection reason is required".into(),
            ));
        }
        let lock_key = RequestStore::lock_key(request_id);
        let request = self.locks.with(&lock_key, move || {
            let mut request = self.requests.get(request_id)?;
            let before = minicbor::to_vec(&request)?;
            match request.status {
                RequestStatus::PendingManager => {
                    self.ensure_manager_actor(&request, actor, now)?;
                    request.record_approval(
                        actor,
                        ApproverRole::Manager,
                        ApprovalAction::Rejected,
                        Some(reason),
                        now,
                    );
                    request.transition(RequestStatus::ManagerRejected)?;
                }
                RequestStatus::ManagerApproved => {
                    if actor == request.employee_id {
                        return Err(LeaveError::NotAuthorized {
                            actor: actor.to_string(),
                            subject: request_id.to_string(),
                            reason: "employees cannot reject their own requests".into(),
                        });
                    }
                    request.record_approval(
                        actor,
                        ApproverRole::Hr,
                        ApprovalAction::Rejected,
                        Some(reason),
                        now,
                    );
                    request.transition(RequestStatus::HrRejected)?;
                }
                _ => {
                    return Err(LeaveError::IllegalTransition {
                        request_id: request_id.to_string(),
                        from: request.status.to_string(),
                        to: "a rejected state".to_string(),
                    });
                }
            }
            self.save_with_audit(Some(before), &request, actor, "request rejected", now)?;
            Ok::<_, LeaveError>(request)
        })?;

        self.notifier.notify(NotifyEvent::RequestDecided {
            request_id: request.request_id.clone(),
            approved: false,
            decided_by: actor.to_string(),
        });
        tracing::info!(request = %request.request_id, by = %actor, "leave request rejected");
        Ok(request)
    }

    /// Requester withdraws the request. Allowed from any non-terminal
    /// state, never after finalization.
    pub fn cancel_request(
        &self,
        request_id: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<LeaveRequest, LeaveError> {
        let lock_key = RequestStore::lock_key(request_id);
        let request = self.locks.with(&lock_key, move || {
            let mut request = self.requests.get(request_id)?;
            if actor != request.employee_id {
                return Err(LeaveError::NotAuthorized {
                    actor: actor.to_string(),
                    subject: request_id.to_string(),
                    reason: "only the requester may cancel".into(),
                });
            }
            let before = minicbor::to_vec(&request)?;
            request.transition(RequestStatus::Canceled)?;
            self.save_with_audit(Some(before), &request, actor, "request canceled", now)?;
            Ok::<_, LeaveError>(request)
        })?;

        self.notifier.notify(NotifyEvent::RequestCanceled {
            request_id: request.request_id.clone(),
        });
        tracing::info!(request = %request.request_id, "leave request canceled");
        Ok(request)
    }

    /// Move requests whose manager step sat past its grace period into
    /// the HR queue. Safe under overlapping scheduler fires: the status
    /// check under the request lock applies each escalation once.
    pub fn escalate_overdue(&self, now: Timestamp) -> Result<Vec<String>, LeaveError> {
        let mut escalated = Vec::new();
        for candidate in self.requests.all()? {
            if candidate.status != RequestStatus::PendingManager {
                continue;
            }
            let deadline = candidate
                .submitted_at
                .plus(chrono::Duration::hours(i64::from(candidate.grace_period_hours)));
            if now < deadline {
                continue;
            }
            let lock_key = RequestStore::lock_key(&candidate.request_id);
            let escalated_id = self.locks.with(&lock_key, || {
                let mut request = self.requests.get(&candidate.request_id)?;
                if request.status != RequestStatus::PendingManager
                    || request.escalated_at.is_some()
                {
                    return Ok::<_, LeaveError>(None);
                }
                let before = minicbor::to_vec(&request)?;
                request.record_approval(
                    "system",
                    ApproverRole::System,
                    ApprovalAction::Overridden,
                    Some("auto-escalated: manager SLA exceeded"),
                    now,
                );
                request.transition(RequestStatus::ManagerApproved)?;
                request.escalated_at = Some(now);
                request.current_approver = None;
                self.save_with_audit(Some(before), &request, "system", "auto-escalated to hr", now)?;
                Ok(Some(request.request_id.clone()))
            })?;
            if let Some(request_id) = escalated_id {
                tracing::warn!(
                    request = %request_id,
                    grace_hours = candidate.grace_period_hours,
                    "manager grace period exceeded, escalated to hr"
                );
                self.notifier.notify(NotifyEvent::RequestEscalated {
                    request_id: request_id.clone(),
                });
                escalated.push(request_id);
            }
        }
        Ok(escalated)
    }

    /// HR correction against past dates, outside the request workflow.
    /// May push the balance negative when the leave type policy allows;
    /// the shortfall is recorded for payroll, not auto-corrected.
    pub fn retro_deduct(
        &self,
        employee_id: &str,
        leave_type: &str,
        days: DayAmount,
        on: CalendarDate,
        actor: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<LedgerTransaction, LeaveError> {
        if !days.is_positive() {
            return Err(LeaveError::Validation(
                "retro deduction must be a positive number of days".into(),
            ));
        }
        if on >= now.date() {
            return Err(LeaveError::Validation(
                "retro deduction targets a past date".into(),
            ));
        }
        let policy = self.policies.get(leave_type)?;
        let guard = if policy.allow_negative_after_retro {
            AppendGuard::AllowNegative
        } else {
            AppendGuard::RejectNegative
        };
        let draft = TransactionDraft::new()
            .set_employee(employee_id)
            .set_leave_type(leave_type)
            .set_kind(TransactionKind::Retro)
            .set_amount(-days)
            .set_performed_by(actor)
            .set_reason(&format!("{reason} ({on})"));
        let pair = format!("{employee_id}/{leave_type}");
        let txn = self.ledger.append_linked(draft, guard, now, |_, batch| {
            let entry = SyncQueue::new_entry(
                SyncEntity::Balance,
                &pair,
                ExternalSystem::Payroll,
                SyncAction::UpdateBalance,
                &format!("retro deduction of {days} for {employee_id} dated {on}"),
                now,
            )?;
            self.queue.stage(batch, &entry)?;
            Ok(())
        })?;
        tracing::info!(
            employee = %employee_id,
            leave_type = %leave_type,
            days = %days,
            by = %actor,
            "retroactive deduction applied"
        );
        Ok(txn)
    }

    /// Pay out accrued days. Debits the ledger and tells payroll.
    pub fn encash(
        &self,
        employee_id: &str,
        leave_type: &str,
        days: DayAmount,
        actor: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<LedgerTransaction, LeaveError> {
        if !days.is_positive() {
            return Err(LeaveError::Validation(
                "encashment must be a positive number of days".into(),
            ));
        }
        let draft = TransactionDraft::new()
            .set_employee(employee_id)
            .set_leave_type(leave_type)
            .set_kind(TransactionKind::Encashment)
            .set_amount(-days)
            .set_performed_by(actor)
            .set_reason(reason);
        let pair = format!("{employee_id}/{leave_type}");
        let txn = self
            .ledger
            .append_linked(draft, AppendGuard::RejectNegative, now, |_, batch| {
                let entry = SyncQueue::new_entry(
                    SyncEntity::Balance,
                    &pair,
                    ExternalSystem::Payroll,
                    SyncAction::Encashment,
                    &format!("encash {days} for {employee_id}"),
                    now,
                )?;
                self.queue.stage(batch, &entry)?;
                Ok(())
            })?;
        tracing::info!(
            employee = %employee_id,
            leave_type = %leave_type,
            days = %days,
            "leave encashed"
        );
        Ok(txn)
    }

    /// Credit back part of a finalized request's reserved days after an
    /// early return. Undelivered sync instructions for the request are
    /// superseded and replaced with entries reflecting the shorter leave.
    pub fn release_unused_days(
        &self,
        request_id: &str,
        days: DayAmount,
        actor: &str,
        now: Timestamp,
    ) -> Result<LeaveRequest, LeaveError> {
        if !days.is_positive() {
            return Err(LeaveError::Validation(
                "released days must be positive".into(),
            ));
        }
        let lock_key = RequestStore::lock_key(request_id);
        let (request, stale) = self.locks.with(&lock_key, move || {
            let mut request = self.requests.get(request_id)?;
            if request.status != RequestStatus::Finalized {
                return Err(LeaveError::Validation(format!(
                    "request {request_id} is {}, only finalized requests release days",
                    request.status
                )));
            }
            let debited = request.net_days - request.converted_unpaid_days;
            let releasable = debited - request.released_days;
            if days > releasable {
                return Err(LeaveError::Validation(format!(
                    "cannot release {days}, only {releasable} still reserved"
                )));
            }
            let before = minicbor::to_vec(&request)?;
            let stale: Vec<String> = self
                .queue
                .for_entity(SyncEntity::Request, request_id)?
                .into_iter()
                .filter(|e| e.status != SyncStatus::Success && !e.superseded)
                .map(|e| e.log_id)
                .collect();

            request.released_days += days;
            request.payroll_sync = Some(SyncStatus::Pending);
            request.time_sync = Some(SyncStatus::Pending);

            let payroll = SyncQueue::new_entry(
                SyncEntity::Request,
                request_id,
                ExternalSystem::Payroll,
                SyncAction::UpdateBalance,
                &format!("release {days} back to {}", request.employee_id),
                now,
            )?;
            let unblock = SyncQueue::new_entry(
                SyncEntity::Request,
                request_id,
                ExternalSystem::TimeManagement,
                SyncAction::UnblockAttendance,
                &format!("unblock {days} of leave for {}", request.employee_id),
                now,
            )?;
            let audit = AuditDraft::new(AuditTarget::Request, request_id, actor, now)
                .set_before(before)
                .set_after(minicbor::to_vec(&request)?)
                .set_reason(&format!("released {days} unused days"));

            let draft = TransactionDraft::new()
                .set_employee(&request.employee_id)
                .set_leave_type(&request.leave_type)
                .set_kind(TransactionKind::ReserveRelease)
                .set_amount(days)
                .set_origin_request(request_id)
                .set_performed_by(actor)
                .set_reason(&format!("early return, {days} released"));
            let staged = &request;
            self.ledger
                .append_linked(draft, AppendGuard::AllowNegative, now, |_, batch| {
                    self.requests.put_in(batch, staged)?;
                    self.audit.stage(batch, audit)?;
                    self.queue.stage(batch, &payroll)?;
                    self.queue.stage(batch, &unblock)?;
                    Ok(())
                })?;
            Ok((request, stale))
        })?;

        // Old undelivered instructions would re-block the released days;
        // flag them once the replacement entries are durable.
        for log_id in &stale {
            self.queue.mark_superseded(log_id, now)?;
        }
        tracing::info!(
            request = %request.request_id,
            days = %days,
            "unused leave days released"
        );
        Ok(request)
    }

    pub fn balance(&self, employee_id: &str, leave_type: &str) -> Result<DayAmount, LeaveError> {
        self.ledger.current_balance(employee_id, leave_type)
    }

    pub fn request(&self, request_id: &str) -> Result<LeaveRequest, LeaveError> {
        self.requests.get(request_id)
    }

    pub fn requests_for_employee(
        &self,
        employee_id: &str,
    ) -> Result<Vec<LeaveRequest>, LeaveError> {
        self.requests.for_employee(employee_id)
    }

    /// The routed approver, the employee's manager, or whoever a current
    /// accepted delegation resolves to may act on the manager step.
    fn ensure_manager_actor(
        &self,
        request: &LeaveRequest,
        actor: &str,
        now: Timestamp,
    ) -> Result<(), LeaveError> {
        if actor == request.employee_id {
            return Err(LeaveError::NotAuthorized {
                actor: actor.to_string(),
                subject: request.request_id.clone(),
                reason: "employees cannot approve their own requests".into(),
            });
        }
        if request.current_approver.as_deref() == Some(actor) {
            return Ok(());
        }
        let profile =
            self.directory
                .profile(&request.employee_id)
                .ok_or_else(|| LeaveError::NotFound {
                    kind: "employee",
                    id: request.employee_id.clone(),
                })?;
        let Some(manager_id) = profile.manager_id else {
            return Err(LeaveError::NotAuthorized {
                actor: actor.to_string(),
                subject: request.request_id.clone(),
                reason: "employee has no manager on record".into(),
            });
        };
        if actor == manager_id
            || self.delegations.resolve_approver(&manager_id, now.date())? == actor
        {
            return Ok(());
        }
        Err(LeaveError::NotAuthorized {
            actor: actor.to_string(),
            subject: request.request_id.clone(),
            reason: "not the assigned approver for this request".into(),
        })
    }

    /// Persist a request and its audit row in one batch.
    fn save_with_audit(
        &self,
        before: Option<Vec<u8>>,
        request: &LeaveRequest,
        changed_by: &str,
        reason: &str,
        now: Timestamp,
    ) -> Result<(), LeaveError> {
        let mut batch = Batch::default();
        self.requests.put_in(&mut batch, request)?;
        let mut audit = AuditDraft::new(AuditTarget::Request, &request.request_id, changed_by, now)
            .set_after(minicbor::to_vec(request)?)
            .set_reason(reason);
        if let Some(before) = before {
            audit = audit.set_before(before);
        }
        self.audit.stage(&mut batch, audit)?;
        self.db.apply_batch(batch)?;
        Ok(())
    }
}
