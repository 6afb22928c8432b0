//! End-to-end adjudication scenarios
//!
//! Each test drives the full service: submit, approve, finalize, and the
//! ledger/sync side effects. Sled uses file-based locking, so every test
//! opens its own database under a tempdir for simplified cleanup.

use anyhow::Context;
use leave_ledger::calendar::WeekendCalendar;
use leave_ledger::directory::{EmployeeProfile, InMemoryDirectory};
use leave_ledger::entitlement::EntitlementRule;
use leave_ledger::error::LeaveError;
use leave_ledger::ledger::{AppendGuard, TransactionDraft, TransactionKind};
use leave_ledger::policy::{InsufficientBalancePolicy, LeaveTypePolicy};
use leave_ledger::request::{ApprovalAction, RequestDraft, RequestStatus};
use leave_ledger::service::LeaveService;
use leave_ledger::sync::{
    DeliveryAck, ExternalSystem, IntegrationLog, RetryPolicy, SyncEntity, SyncStatus, SyncTarget,
};
use leave_ledger::types::{CalendarDate, DayAmount, Timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::tempdir;

fn open_service(dir: &tempfile::TempDir) -> anyhow::Result<LeaveService> {
    let db = Arc::new(sled::open(dir.path().join("leave.db"))?);
    db.clear()?;

    let directory = Arc::new(InMemoryDirectory::new());
    directory.upsert(
        EmployeeProfile::new("emp_ada", CalendarDate::new(2020, 1, 6)).set_manager("mgr_grace"),
    );
    directory.upsert(
        EmployeeProfile::new("emp_bob", CalendarDate::new(2021, 3, 1)).set_manager("mgr_grace"),
    );
    directory.upsert(EmployeeProfile::new("mgr_grace", CalendarDate::new(2015, 5, 4)));

    Ok(LeaveService::new(
        db,
        directory,
        Arc::new(WeekendCalendar::new()),
    ))
}

fn seed_annual(service: &LeaveService, policy: LeaveTypePolicy, now: Timestamp) -> anyhow::Result<()> {
    service.policies().upsert(policy)?;
    service
        .entitlements()
        .set_base_rule(EntitlementRule::new("annual", DayAmount::days(25), now)?)?;
    Ok(())
}

fn credit(service: &LeaveService, employee: &str, days: i64, now: Timestamp) -> anyhow::Result<()> {
    let draft = TransactionDraft::new()
        .set_employee(employee)
        .set_leave_type("annual")
        .set_kind(TransactionKind::Accrual)
        .set_amount(DayAmount::days(days))
        .set_reason("opening balance");
    service.ledger().append(draft, AppendGuard::AllowNegative, now)?;
    Ok(())
}

// 2025-06-02 is a Monday; the week ending 06-06 holds five working days.
fn one_week_draft() -> RequestDraft {
    RequestDraft::new()
        .set_employee("emp_ada")
        .set_leave_type("annual")
        .set_start_date(CalendarDate::new(2025, 6, 2))
        .set_end_date(CalendarDate::new(2025, 6, 6))
        .set_justification("summer break")
}

#[test]
fn approved_request_debits_ledger_and_queues_sync() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let request = service
        .submit_request(one_week_draft(), now)
        .context("submission failed")?;
    assert_eq!(request.status, RequestStatus::PendingManager);
    assert_eq!(request.net_days, DayAmount::days(5));
    assert!(!request.exceeds_entitlement);
    assert!(!request.has_overlap_with_approved);
    assert_eq!(request.current_approver.as_deref(), Some("mgr_grace"));

    let request = service
        .approve_request(&request.request_id, "mgr_grace", now)
        .context("approval failed")?;
    assert_eq!(request.status, RequestStatus::Finalized);
    assert_eq!(request.finalized_by.as_deref(), Some("mgr_grace"));
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::days(15));

    let txns = service.ledger().transactions("emp_ada", "annual")?;
    assert_eq!(txns.len(), 2);
    let take = txns.last().unwrap();
    assert_eq!(take.kind, TransactionKind::Take);
    assert_eq!(take.amount, DayAmount::days(-5));
    assert_eq!(
        take.origin_request_id.as_deref(),
        Some(request.request_id.as_str())
    );

    let logs = service
        .sync_queue()
        .for_entity(SyncEntity::Request, &request.request_id)?;
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == SyncStatus::Pending));
    assert!(logs.iter().any(|l| l.system == ExternalSystem::Payroll));
    assert!(logs.iter().any(|l| l.system == ExternalSystem::TimeManagement));
    Ok(())
}

#[test]
fn shortfall_converts_to_unpaid_when_policy_allows() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(
        &service,
        LeaveTypePolicy::new("annual")
            .set_insufficient_balance(InsufficientBalancePolicy::ConvertToUnpaid),
        now,
    )?;
    credit(&service, "emp_ada", 3, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    assert!(request.exceeds_entitlement);

    // The shortfall routes the request through HR after the manager step.
    let request = service.approve_request(&request.request_id, "mgr_grace", now)?;
    assert_eq!(request.status, RequestStatus::ManagerApproved);
    let request = service.approve_request(&request.request_id, "hr_dana", now)?;

    assert_eq!(request.status, RequestStatus::Finalized);
    assert_eq!(request.converted_unpaid_days, DayAmount::days(2));
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::ZERO);

    let take = service
        .ledger()
        .transactions("emp_ada", "annual")?
        .into_iter()
        .find(|t| t.kind == TransactionKind::Take)
        .unwrap();
    assert_eq!(take.amount, DayAmount::days(-3));
    Ok(())
}

#[test]
fn shortfall_hard_blocks_when_policy_rejects() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 3, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    let request = service.approve_request(&request.request_id, "mgr_grace", now)?;
    let err = service
        .approve_request(&request.request_id, "hr_dana", now)
        .unwrap_err();
    assert!(matches!(err, LeaveError::InsufficientBalance { .. }));

    // The failed finalization leaves the request where it was, undebited.
    let request = service.request(&request.request_id)?;
    assert_eq!(request.status, RequestStatus::ManagerApproved);
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::days(3));
    Ok(())
}

#[test]
fn overdue_manager_step_escalates_once() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    assert_eq!(request.grace_period_hours, 48);

    // Nothing is due yet.
    assert!(service.escalate_overdue(now.plus(chrono::Duration::hours(47)))?.is_empty());

    let later = now.plus(chrono::Duration::hours(49));
    let escalated = service.escalate_overdue(later)?;
    assert_eq!(escalated, vec![request.request_id.clone()]);

    let request = service.request(&request.request_id)?;
    assert_eq!(request.status, RequestStatus::ManagerApproved);
    assert!(request.escalated_at.is_some());
    let record = request.approval_records.last().unwrap();
    assert_eq!(record.action, ApprovalAction::Overridden);
    assert!(record.is_override);
    assert_eq!(
        record.reason.as_deref(),
        Some("auto-escalated: manager SLA exceeded")
    );

    // A second scheduler fire applies nothing.
    assert!(service.escalate_overdue(later)?.is_empty());

    // HR takes the escalated request to completion.
    let request = service.approve_request(&request.request_id, "hr_dana", later)?;
    assert_eq!(request.status, RequestStatus::Finalized);
    Ok(())
}

struct FlakyTarget {
    failures_left: AtomicU32,
}

impl SyncTarget for FlakyTarget {
    fn deliver(&self, _entry: &IntegrationLog) -> anyhow::Result<DeliveryAck> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("payroll endpoint unavailable");
        }
        Ok(DeliveryAck::Applied {
            external_id: "pr-20250602".into(),
        })
    }
}

struct AckTarget;

impl SyncTarget for AckTarget {
    fn deliver(&self, _entry: &IntegrationLog) -> anyhow::Result<DeliveryAck> {
        Ok(DeliveryAck::Applied {
            external_id: "tm-1".into(),
        })
    }
}

#[test]
fn sync_worker_retries_with_backoff_until_delivery() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    let request = service.approve_request(&request.request_id, "mgr_grace", now)?;

    let worker = service
        .sync_worker()
        .register_target(
            ExternalSystem::Payroll,
            Arc::new(FlakyTarget {
                failures_left: AtomicU32::new(3),
            }),
        )
        .register_target(ExternalSystem::TimeManagement, Arc::new(AckTarget))
        .set_retry_policy(RetryPolicy {
            base_delay_secs: 60,
            multiplier: 2,
            max_attempts: 5,
        });

    let payroll_log = |service: &LeaveService| -> anyhow::Result<IntegrationLog> {
        Ok(service
            .sync_queue()
            .for_entity(SyncEntity::Request, &request.request_id)?
            .into_iter()
            .find(|l| l.system == ExternalSystem::Payroll)
            .unwrap())
    };

    // First pass: time management delivers, payroll fails and backs off.
    let mut at = now;
    worker.run_due(at)?;
    let mut log = payroll_log(&service)?;
    assert_eq!(log.status, SyncStatus::Failed);
    assert_eq!(log.attempts, 1);
    assert!(log.last_error.is_some());

    // Two more failures, each rescheduled further out.
    for expected_attempts in [2, 3] {
        at = log.next_attempt_at.unwrap().plus(chrono::Duration::seconds(1));
        assert!(service.sync_queue().due(at.plus(-chrono::Duration::seconds(2)))?.is_empty());
        worker.run_due(at)?;
        log = payroll_log(&service)?;
        assert_eq!(log.status, SyncStatus::Failed);
        assert_eq!(log.attempts, expected_attempts);
    }

    // Fourth attempt lands; the error clears and the mirror follows.
    at = log.next_attempt_at.unwrap().plus(chrono::Duration::seconds(1));
    worker.run_due(at)?;
    let log = payroll_log(&service)?;
    assert_eq!(log.status, SyncStatus::Success);
    assert_eq!(log.attempts, 4);
    assert_eq!(log.last_error, None);
    assert_eq!(log.external_id.as_deref(), Some("pr-20250602"));

    let request = service.request(&request.request_id)?;
    assert_eq!(request.payroll_sync, Some(SyncStatus::Success));
    assert_eq!(request.time_sync, Some(SyncStatus::Success));
    Ok(())
}

#[test]
fn sync_worker_stops_after_exhausting_attempts() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    service.approve_request(&request.request_id, "mgr_grace", now)?;

    let worker = service
        .sync_worker()
        .register_target(
            ExternalSystem::Payroll,
            Arc::new(FlakyTarget {
                failures_left: AtomicU32::new(u32::MAX),
            }),
        )
        .register_target(ExternalSystem::TimeManagement, Arc::new(AckTarget))
        .set_retry_policy(RetryPolicy {
            base_delay_secs: 1,
            multiplier: 2,
            max_attempts: 3,
        });

    let mut at = now;
    for _ in 0..3 {
        worker.run_due(at)?;
        at = at.plus(chrono::Duration::seconds(60));
    }

    let log = service
        .sync_queue()
        .for_entity(SyncEntity::Request, &request.request_id)?
        .into_iter()
        .find(|l| l.system == ExternalSystem::Payroll)
        .unwrap();
    assert_eq!(log.status, SyncStatus::Failed);
    assert_eq!(log.attempts, 3);
    assert_eq!(log.next_attempt_at, None);

    // Exhausted entries wait for an operator, then run again.
    assert!(service.sync_queue().due(at)?.is_empty());
    service.sync_queue().retry_failed(&log.log_id, at)?;
    assert_eq!(service.sync_queue().due(at)?.len(), 1);
    Ok(())
}

#[test]
fn delegation_routes_the_manager_step_inside_its_window() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2026, 1, 10, 8, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let delegation = service.delegations().create(
        "mgr_grace",
        "emp_bob",
        CalendarDate::new(2026, 1, 1),
        Some(CalendarDate::new(2026, 1, 31)),
        now,
    )?;
    service
        .delegations()
        .accept(&delegation.delegation_id, "emp_bob", now)?;

    // Routed January 15: the delegate holds the manager step.
    let jan = Timestamp::new_with(2026, 1, 15, 9, 0, 0);
    let request = service.submit_request(
        RequestDraft::new()
            .set_employee("emp_ada")
            .set_leave_type("annual")
            .set_start_date(CalendarDate::new(2026, 2, 9))
            .set_end_date(CalendarDate::new(2026, 2, 13))
            .set_justification("family visit"),
        jan,
    )?;
    assert_eq!(request.current_approver.as_deref(), Some("emp_bob"));
    assert_eq!(
        request.approval_records.first().unwrap().action,
        ApprovalAction::Delegated
    );
    let request = service.approve_request(&request.request_id, "emp_bob", jan)?;
    assert_eq!(request.status, RequestStatus::Finalized);

    // Routed February 2, past the window: back to the manager.
    let feb = Timestamp::new_with(2026, 2, 2, 9, 0, 0);
    let request = service.submit_request(
        RequestDraft::new()
            .set_employee("emp_ada")
            .set_leave_type("annual")
            .set_start_date(CalendarDate::new(2026, 3, 9))
            .set_end_date(CalendarDate::new(2026, 3, 13))
            .set_justification("spring trip"),
        feb,
    )?;
    assert_eq!(request.current_approver.as_deref(), Some("mgr_grace"));
    assert!(request.approval_records.is_empty());
    Ok(())
}

#[test]
fn cancel_is_rejected_after_finalization() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    service.cancel_request(&request.request_id, "emp_ada", now)?;
    assert_eq!(
        service.request(&request.request_id)?.status,
        RequestStatus::Canceled
    );

    let request = service.submit_request(one_week_draft(), now)?;
    let request = service.approve_request(&request.request_id, "mgr_grace", now)?;
    assert_eq!(request.status, RequestStatus::Finalized);

    let err = service
        .cancel_request(&request.request_id, "emp_ada", now)
        .unwrap_err();
    assert!(matches!(err, LeaveError::IllegalTransition { .. }));
    Ok(())
}

#[test]
fn early_return_releases_reserved_days_and_supersedes_sync() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 20, now)?;

    let request = service.submit_request(one_week_draft(), now)?;
    let request = service.approve_request(&request.request_id, "mgr_grace", now)?;
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::days(15));

    let later = now.plus(chrono::Duration::days(20));
    let request = service.release_unused_days(&request.request_id, DayAmount::days(2), "hr_dana", later)?;
    assert_eq!(request.released_days, DayAmount::days(2));
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::days(17));

    let logs = service
        .sync_queue()
        .for_entity(SyncEntity::Request, &request.request_id)?;
    let superseded = logs.iter().filter(|l| l.superseded).count();
    let live_pending = logs
        .iter()
        .filter(|l| !l.superseded && l.status == SyncStatus::Pending)
        .count();
    assert_eq!(superseded, 2);
    assert_eq!(live_pending, 2);

    // Releasing more than remains reserved is refused.
    let err = service
        .release_unused_days(&request.request_id, DayAmount::days(4), "hr_dana", later)
        .unwrap_err();
    assert!(matches!(err, LeaveError::Validation(_)));
    Ok(())
}

#[test]
fn retro_deduction_bypasses_workflow_but_reaches_payroll() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 1, now)?;

    let txn = service.retro_deduct(
        "emp_ada",
        "annual",
        DayAmount::days(3),
        CalendarDate::new(2025, 4, 7),
        "hr_dana",
        "unrecorded absence",
        now,
    )?;
    assert_eq!(txn.kind, TransactionKind::Retro);
    assert_eq!(txn.amount, DayAmount::days(-3));
    // Policy allows the balance to go negative; the shortfall is recorded,
    // not auto-corrected.
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::days(-2));

    let logs = service
        .sync_queue()
        .for_entity(SyncEntity::Balance, "emp_ada/annual")?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].system, ExternalSystem::Payroll);
    assert_eq!(logs[0].status, SyncStatus::Pending);
    Ok(())
}

#[test]
fn concurrent_debits_cannot_both_pass_the_balance_check() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = open_service(&temp_dir)?;
    let now = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    seed_annual(&service, LeaveTypePolicy::new("annual"), now)?;
    credit(&service, "emp_ada", 5, now)?;

    // Balance covers one of the two takes, never both.
    let ledger = service.ledger().clone();
    let mut handles = vec![];
    for _ in 0..2 {
        let ledger = ledger.clone();
        handles.push(std::thread::spawn(move || {
            let draft = TransactionDraft::new()
                .set_employee("emp_ada")
                .set_leave_type("annual")
                .set_kind(TransactionKind::Take)
                .set_amount(DayAmount::days(-5))
                .set_reason("racing take");
            ledger.append(draft, AppendGuard::RejectNegative, Timestamp::now())
        }));
    }
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(LeaveError::InsufficientBalance { .. }))));
    assert_eq!(service.balance("emp_ada", "annual")?, DayAmount::ZERO);
    Ok(())
}
