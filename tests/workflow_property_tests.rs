//! Property-based tests for the request state machine and date logic
//!
//! These stay pure: the state machine, overlap detection, approval
//! history and calendar math are all exercised without a database, so
//! the default case count is fine.

use chrono::Weekday;
use leave_ledger::calendar::{WeekendCalendar, WorkCalendar};
use leave_ledger::delegation::{Delegation, DelegationStatus};
use leave_ledger::error::LeaveError;
use leave_ledger::request::{ApprovalAction, ApproverRole, LeaveRequest, RequestStatus};
use leave_ledger::types::{CalendarDate, DayAmount, Timestamp};
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = RequestStatus> {
    prop_oneof![
        Just(RequestStatus::Submitted),
        Just(RequestStatus::PendingManager),
        Just(RequestStatus::ManagerApproved),
        Just(RequestStatus::ManagerRejected),
        Just(RequestStatus::HrApproved),
        Just(RequestStatus::HrRejected),
        Just(RequestStatus::Finalized),
        Just(RequestStatus::Canceled),
    ]
}

fn date_strategy() -> impl Strategy<Value = CalendarDate> {
    (2020i32..=2030, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| CalendarDate::new(y, m, d))
}

/// Inclusive range with start <= end.
fn range_strategy() -> impl Strategy<Value = (CalendarDate, CalendarDate)> {
    (date_strategy(), date_strategy()).prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
}

fn request_in(status: RequestStatus, start: CalendarDate, end: CalendarDate) -> LeaveRequest {
    LeaveRequest {
        request_id: "req_prop".into(),
        employee_id: "emp_prop".into(),
        leave_type: "annual".into(),
        applied_rule_id: None,
        start_date: start,
        end_date: end,
        requested_days: DayAmount::days(start.inclusive_days_until(end)),
        net_days: DayAmount::days(1),
        justification: "property case".into(),
        attachments: Vec::new(),
        status,
        is_post_leave: false,
        approval_records: Vec::new(),
        has_overlap_with_approved: false,
        overlapping_request_ids: Vec::new(),
        exceeds_entitlement: false,
        converted_unpaid_days: DayAmount::ZERO,
        released_days: DayAmount::ZERO,
        payroll_sync: None,
        time_sync: None,
        current_approver: None,
        finalized_by: None,
        finalized_at: None,
        grace_period_hours: 48,
        escalated_at: None,
        submitted_at: Timestamp::new_with(2025, 1, 1, 0, 0, 0),
    }
}

proptest! {
    /// No transition leaves a terminal state, and every illegal move
    /// fails with the typed error while the request stays put.
    #[test]
    fn illegal_transitions_are_rejected_and_change_nothing(
        from in status_strategy(),
        to in status_strategy(),
        (start, end) in range_strategy(),
    ) {
        let mut request = request_in(from, start, end);
        let legal = from.legal_successors().contains(&to);

        match request.transition(to) {
            Ok(()) => {
                prop_assert!(legal);
                prop_assert_eq!(request.status, to);
            }
            Err(LeaveError::IllegalTransition { from: f, to: t, .. }) => {
                prop_assert!(!legal);
                prop_assert_eq!(request.status, from);
                prop_assert_eq!(f, from.to_string());
                prop_assert_eq!(t, to.to_string());
            }
            Err(other) => return Err(TestCaseError::fail(other.to_string())),
        }

        if from.is_terminal() {
            prop_assert_eq!(request.status, from);
        }
    }

    /// Walking any chain of legal transitions never escapes the machine:
    /// each hop is a declared successor and terminal states end the walk.
    #[test]
    fn legal_walks_end_in_terminal_states(choices in prop::collection::vec(0usize..4, 0..12)) {
        let mut status = RequestStatus::Submitted;
        for choice in choices {
            let successors = status.legal_successors();
            if successors.is_empty() {
                prop_assert!(status.is_terminal());
                break;
            }
            status = successors[choice % successors.len()];
        }
        // Finalized is reachable only through an approved state.
        if status == RequestStatus::Finalized {
            prop_assert!(RequestStatus::ManagerApproved.legal_successors().contains(&status)
                || RequestStatus::HrApproved.legal_successors().contains(&status));
        }
    }

    /// Approval history keeps contiguous step numbers in arrival order.
    #[test]
    fn approval_steps_are_contiguous(count in 1usize..10) {
        let mut request = request_in(
            RequestStatus::PendingManager,
            CalendarDate::new(2025, 6, 2),
            CalendarDate::new(2025, 6, 6),
        );
        let at = Timestamp::new_with(2025, 5, 20, 9, 0, 0);
        for i in 0..count {
            request.record_approval(
                &format!("actor_{i}"),
                ApproverRole::Manager,
                ApprovalAction::Approved,
                None,
                at,
            );
        }

        prop_assert_eq!(request.approval_records.len(), count);
        for (i, record) in request.approval_records.iter().enumerate() {
            prop_assert_eq!(record.step_number as usize, i + 1);
            prop_assert!(!record.is_override);
        }
    }

    /// Overlap detection is symmetric and agrees with interval math.
    #[test]
    fn overlap_is_symmetric(
        (a_start, a_end) in range_strategy(),
        (b_start, b_end) in range_strategy(),
    ) {
        let a = request_in(RequestStatus::PendingManager, a_start, a_end);
        let b = request_in(RequestStatus::PendingManager, b_start, b_end);

        let expected = a_start <= b_end && b_start <= a_end;
        prop_assert_eq!(a.overlaps(b_start, b_end), expected);
        prop_assert_eq!(b.overlaps(a_start, a_end), expected);
        // Every range touches itself.
        prop_assert!(a.overlaps(a_start, a_end));
    }

    /// Net days never exceed the calendar span, and a holiday inside the
    /// range can only shrink the count.
    #[test]
    fn net_days_are_bounded_by_the_span((start, end) in range_strategy(), holiday in date_strategy()) {
        let cal = WeekendCalendar::new();
        let net = cal.net_days(start, end);
        let span = start.inclusive_days_until(end);
        prop_assert!(i64::from(net) <= span);

        let with_holiday = WeekendCalendar::new().add_holiday(holiday);
        prop_assert!(with_holiday.net_days(start, end) <= net);
    }

    /// A seven-day week always holds exactly the non-weekend days.
    #[test]
    fn full_weeks_count_the_working_days(start in date_strategy(), weeks in 1i64..8) {
        let cal = WeekendCalendar::new();
        let end = CalendarDate::from(
            start
                .naive()
                .checked_add_days(chrono::Days::new((weeks * 7 - 1) as u64))
                .unwrap(),
        );
        prop_assert_eq!(i64::from(cal.net_days(start, end)), weeks * 5);

        let single = WeekendCalendar::new().set_weekend(&[Weekday::Fri]);
        prop_assert_eq!(i64::from(single.net_days(start, end)), weeks * 6);
    }

    /// A delegation covers exactly the dates inside its window.
    #[test]
    fn delegation_window_coverage(
        (start, end) in range_strategy(),
        probe in date_strategy(),
        open_ended in any::<bool>(),
    ) {
        let delegation = Delegation {
            delegation_id: "dlg_prop".into(),
            manager_id: "mgr".into(),
            delegate_id: "dep".into(),
            starts_on: start,
            ends_on: if open_ended { None } else { Some(end) },
            status: DelegationStatus::Accepted,
            created_at: Timestamp::new_with(2025, 1, 1, 0, 0, 0),
            decided_at: None,
            revoked_at: None,
        };

        let expected = if open_ended {
            start <= probe
        } else {
            start <= probe && probe <= end
        };
        prop_assert_eq!(delegation.covers(probe), expected);
    }
}
