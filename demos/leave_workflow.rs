//! End-to-end walkthrough of the leave core: configure a leave type,
//! accrue a balance, adjudicate a request, and drive the sync worker
//! against a stub payroll endpoint.
//!
//! Run with `cargo run --example leave_workflow`.

use leave_ledger::accrual::{AccrualRule, Frequency};
use leave_ledger::calendar::WeekendCalendar;
use leave_ledger::directory::{EmployeeProfile, InMemoryDirectory};
use leave_ledger::entitlement::EntitlementRule;
use leave_ledger::policy::{InsufficientBalancePolicy, LeaveTypePolicy};
use leave_ledger::request::RequestDraft;
use leave_ledger::service::LeaveService;
use leave_ledger::sync::{DeliveryAck, ExternalSystem, IntegrationLog, SyncTarget};
use leave_ledger::types::{CalendarDate, DayAmount, Timestamp};
use std::sync::Arc;

/// Pretends to be the payroll endpoint: logs the payload and acks.
struct StubPayroll;

impl SyncTarget for StubPayroll {
    fn deliver(&self, entry: &IntegrationLog) -> anyhow::Result<DeliveryAck> {
        println!("  -> payroll received {}: {}", entry.action, entry.summary);
        Ok(DeliveryAck::Applied {
            external_id: format!("payroll-{}", entry.attempts),
        })
    }
}

struct StubTimeManagement;

impl SyncTarget for StubTimeManagement {
    fn deliver(&self, entry: &IntegrationLog) -> anyhow::Result<DeliveryAck> {
        println!("  -> time mgmt received {}: {}", entry.action, entry.summary);
        Ok(DeliveryAck::Applied {
            external_id: "tm-ack".into(),
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leave_ledger=info".into()),
        )
        .init();

    let temp = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp.path().join("leave.db"))?);

    let directory = Arc::new(InMemoryDirectory::new());
    directory.upsert(
        EmployeeProfile::new("emp_ada", CalendarDate::new(2020, 1, 6)).set_manager("mgr_grace"),
    );
    directory.upsert(EmployeeProfile::new("mgr_grace", CalendarDate::new(2015, 5, 4)));

    let calendar = Arc::new(WeekendCalendar::new().add_holiday(CalendarDate::new(2025, 6, 5)));
    let service = LeaveService::new(db, directory, calendar);

    // Configure the annual leave type: policy, entitlement, accrual.
    let now = Timestamp::new_with(2025, 1, 31, 8, 0, 0);
    service.policies().upsert(
        LeaveTypePolicy::new("annual")
            .set_insufficient_balance(InsufficientBalancePolicy::ConvertToUnpaid),
    )?;
    service
        .entitlements()
        .set_base_rule(EntitlementRule::new("annual", DayAmount::days(25), now)?)?;
    let rule = AccrualRule::new("annual", Frequency::Monthly, DayAmount::centidays(208), now)?
        .set_max_carryover(DayAmount::days(10));
    service.accruals().upsert_rule(rule.clone())?;

    // Five monthly accrual runs.
    for month in 1..=5 {
        let report =
            service
                .accruals()
                .run_period(&rule.rule_id, CalendarDate::new(2025, month, 28), now)?;
        println!(
            "accrual {}: credited {} employees, {} days total",
            report.period, report.credited, report.total_credited
        );
    }
    println!(
        "balance for emp_ada: {} days",
        service.balance("emp_ada", "annual")?
    );

    // Submit a week of leave (the 5th is a holiday, so four net days).
    let submitted = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
    let request = service.submit_request(
        RequestDraft::new()
            .set_employee("emp_ada")
            .set_leave_type("annual")
            .set_start_date(CalendarDate::new(2025, 6, 2))
            .set_end_date(CalendarDate::new(2025, 6, 6))
            .set_justification("summer break"),
        submitted,
    )?;
    println!(
        "submitted {}: {} net days, approver {}",
        request.request_id,
        request.net_days,
        request.current_approver.as_deref().unwrap_or("-")
    );

    let request = service.approve_request(&request.request_id, "mgr_grace", submitted)?;
    println!(
        "request is {}, unpaid portion {} days, balance now {}",
        request.status,
        request.converted_unpaid_days,
        service.balance("emp_ada", "annual")?
    );

    // Deliver the queued payroll and time-management instructions.
    let worker = service
        .sync_worker()
        .register_target(ExternalSystem::Payroll, Arc::new(StubPayroll))
        .register_target(ExternalSystem::TimeManagement, Arc::new(StubTimeManagement));
    for outcome in worker.run_due(submitted)? {
        println!("sync outcome: {outcome:?}");
    }

    let request = service.request(&request.request_id)?;
    println!(
        "sync mirrors: payroll {:?}, time {:?}",
        request.payroll_sync, request.time_sync
    );

    for record in service
        .ledger()
        .transactions("emp_ada", "annual")?
    {
        println!(
            "ledger #{:02} {:>10} {:>7}  {}",
            record.seq,
            record.kind.to_string(),
            record.amount.to_string(),
            record.reason
        );
    }
    Ok(())
}
