//! Leave request aggregate: status machine, embedded approval history
//! and the sled-backed request store.

use crate::error::LeaveError;
use crate::sync::SyncStatus;
use crate::types::{CalendarDate, DayAmount, Timestamp};
use sled::{Batch, Db};
use std::fmt;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestStatus {
    #[n(0)]
    Submitted,
    #[n(1)]
    PendingManager,
    #[n(2)]
    ManagerApproved,
    #[n(3)]
    ManagerRejected,
    #[n(4)]
    HrApproved,
    #[n(5)]
    HrRejected,
    #[n(6)]
    Finalized,
    #[n(7)]
    Canceled,
}

impl RequestStatus {
    /// States every request ends in. No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::ManagerRejected
                | RequestStatus::HrRejected
                | RequestStatus::Finalized
                | RequestStatus::Canceled
        )
    }

    pub fn legal_successors(&self) -> &'static [RequestStatus] {
        match self {
            RequestStatus::Submitted => {
                &[RequestStatus::PendingManager, RequestStatus::Canceled]
            }
            RequestStatus::PendingManager => &[
                RequestStatus::ManagerApproved,
                RequestStatus::ManagerRejected,
                RequestStatus::Canceled,
            ],
            RequestStatus::ManagerApproved => &[
                RequestStatus::HrApproved,
                RequestStatus::HrRejected,
                RequestStatus::Finalized,
                RequestStatus::Canceled,
            ],
            RequestStatus::HrApproved => {
                &[RequestStatus::Finalized, RequestStatus::Canceled]
            }
            RequestStatus::ManagerRejected
            | RequestStatus::HrRejected
            | RequestStatus::Finalized
            | RequestStatus::Canceled => &[],
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestStatus::Submitted => "submitted",
            RequestStatus::PendingManager => "pending_manager",
            RequestStatus::ManagerApproved => "manager_approved",
            RequestStatus::ManagerRejected => "manager_rejected",
            RequestStatus::HrApproved => "hr_approved",
            RequestStatus::HrRejected => "hr_rejected",
            RequestStatus::Finalized => "finalized",
            RequestStatus::Canceled => "canceled",
        };
        write!(f, "{label}")
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ApproverRole {
    #[n(0)]
    Manager,
    #[n(1)]
    Hr,
    #[n(2)]
    System,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ApprovalAction {
    #[n(0)]
    Approved,
    #[n(1)]
    Rejected,
    #[n(2)]
    Delegated,
    #[n(3)]
    Overridden,
}

/// One decision in a request's history. Append-only within the request.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct ApprovalRecord {
    #[n(0)]
    pub step_number: u32,
    #[n(1)]
    pub approver_id: String,
    #[n(2)]
    pub role: ApproverRole,
    #[n(3)]
    pub action: ApprovalAction,
    #[n(4)]
    pub reason: Option<String>,
    #[n(5)]
    pub is_override: bool,
    #[n(6)]
    pub acted_at: Timestamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AttachmentRef {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub uri: String,
}

/// A leave request from submission to a terminal state. Mutated only
/// through adjudication transitions, never deleted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LeaveRequest {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub employee_id: String,
    #[n(2)]
    pub leave_type: String,
    /// Entitlement rule or override that applied at submission.
    #[n(3)]
    pub applied_rule_id: Option<String>,
    #[n(4)]
    pub start_date: CalendarDate,
    #[n(5)]
    pub end_date: CalendarDate,
    /// Inclusive calendar span of the request.
    #[n(6)]
    pub requested_days: DayAmount,
    /// Working days after weekends and holidays are removed.
    #[n(7)]
    pub net_days: DayAmount,
    #[n(8)]
    pub justification: String,
    #[n(9)]
    pub attachments: Vec<AttachmentRef>,
    #[n(10)]
    pub status: RequestStatus,
    /// Submitted after the leave already started.
    #[n(11)]
    pub is_post_leave: bool,
    #[n(12)]
    pub approval_records: Vec<ApprovalRecord>,
    #[n(13)]
    pub has_overlap_with_approved: bool,
    #[n(14)]
    pub overlapping_request_ids: Vec<String>,
    #[n(15)]
    pub exceeds_entitlement: bool,
    /// Days of the span not covered by balance, finalized unpaid.
    #[n(16)]
    pub converted_unpaid_days: DayAmount,
    /// Reserved days credited back after an early return.
    #[n(17)]
    pub released_days: DayAmount,
    #[n(18)]
    pub payroll_sync: Option<SyncStatus>,
    #[n(19)]
    pub time_sync: Option<SyncStatus>,
    #[n(20)]
    pub current_approver: Option<String>,
    #[n(21)]
    pub finalized_by: Option<String>,
    #[n(22)]
    pub finalized_at: Option<Timestamp>,
    #[n(23)]
    pub grace_period_hours: u32,
    #[n(24)]
    pub escalated_at: Option<Timestamp>,
    #[n(25)]
    pub submitted_at: Timestamp,
}

impl LeaveRequest {
    /// Move to `to` if the state machine allows it from the current status.
    pub fn transition(&mut self, to: RequestStatus) -> Result<(), LeaveError> {
        if !self.status.legal_successors().contains(&to) {
            return Err(LeaveError::IllegalTransition {
                request_id: self.request_id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Append a decision; step numbers run from 1 in arrival order.
    pub fn record_approval(
        &mut self,
        approver_id: &str,
        role: ApproverRole,
        action: ApprovalAction,
        reason: Option<&str>,
        at: Timestamp,
    ) {
        let is_override = action == ApprovalAction::Overridden;
        self.approval_records.push(ApprovalRecord {
            step_number: self.approval_records.len() as u32 + 1,
            approver_id: approver_id.to_string(),
            role,
            action,
            reason: reason.map(str::to_string),
            is_override,
            acted_at: at,
        });
    }

    /// Date windows touch when neither ends before the other starts.
    pub fn overlaps(&self, start: CalendarDate, end: CalendarDate) -> bool {
        self.start_date <= end && start <= self.end_date
    }
}

/// What a caller supplies at submission. The adjudicator fills in the rest.
#[derive(Debug, Clone, Default)]
pub struct RequestDraft {
    employee_id: Option<String>,
    leave_type: Option<String>,
    start_date: Option<CalendarDate>,
    end_date: Option<CalendarDate>,
    justification: Option<String>,
    attachments: Vec<AttachmentRef>,
    grace_period_hours: Option<u32>,
}

/// Draft fields once checked, handed to the adjudicator.
pub(crate) struct ValidatedDraft {
    pub(crate) employee_id: String,
    pub(crate) leave_type: String,
    pub(crate) start_date: CalendarDate,
    pub(crate) end_date: CalendarDate,
    pub(crate) justification: String,
    pub(crate) attachments: Vec<AttachmentRef>,
    pub(crate) grace_period_hours: Option<u32>,
}

impl RequestDraft {
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
    pub fn set_start_date(mut self, start: CalendarDate) -> Self {
        self.start_date = Some(start);
        self
    }
    pub fn set_end_date(mut self, end: CalendarDate) -> Self {
        self.end_date = Some(end);
        self
    }
    pub fn set_justification(mut self, justification: &str) -> Self {
        self.justification = Some(justification.to_string());
        self
    }
    pub fn add_attachment(mut self, name: &str, uri: &str) -> Self {
        self.attachments.push(AttachmentRef {
            name: name.to_string(),
            uri: uri.to_string(),
        });
        self
    }
    /// Hours before an unanswered manager step escalates. Defaults to the
    /// leave type policy when unset.
    pub fn set_grace_period_hours(mut self, hours: u32) -> Self {
        self.grace_period_hours = Some(hours);
        self
    }

    /// Check the draft and hand over its fields, or say what is missing.
    pub(crate) fn validate(self) -> Result<ValidatedDraft, LeaveError> {
        let Some(employee_id) = self.employee_id.filter(|v| !v.is_empty()) else {
            return Err(LeaveError::Validation("employee id is required".into()));
        };
        let Some(leave_type) = self.leave_type.filter(|v| !v.is_empty()) else {
            return Err(LeaveError::Validation("leave type is required".into()));
        };
        let (Some(start_date), Some(end_date)) = (self.start_date, self.end_date) else {
            return Err(LeaveError::Validation(
                "start and end dates are required".into(),
            ));
        };
        if end_date < start_date {
            return Err(LeaveError::Validation(format!(
                "end date {end_date} is before start date {start_date}"
            )));
        }
        let Some(justification) = self.justification.filter(|v| !v.is_empty()) else {
            return Err(LeaveError::Validation("justification is required".into()));
        };
        Ok(ValidatedDraft {
            employee_id,
            leave_type,
            start_date,
            end_date,
            justification,
            attachments: self.attachments,
            grace_period_hours: self.grace_period_hours,
        })
    }
}

#[derive(Clone)]
pub struct RequestStore {
    db: Arc<Db>,
}

impl RequestStore {
    pub(crate) fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn key(request_id: &str) -> String {
        format!("req/{request_id}")
    }

    /// Lock key serializing transitions on one request.
    pub(crate) fn lock_key(request_id: &str) -> String {
        Self::key(request_id)
    }

    pub fn get(&self, request_id: &str) -> Result<LeaveRequest, LeaveError> {
        match self.db.get(Self::key(request_id).into_bytes())? {
            Some(value) => Ok(minicbor::decode(&value)?),
            None => Err(LeaveError::NotFound {
                kind: "leave request",
                id: request_id.to_string(),
            }),
        }
    }

    pub(crate) fn save(&self, request: &LeaveRequest) -> Result<(), LeaveError> {
        self.db.insert(
            Self::key(&request.request_id).into_bytes(),
            minicbor::to_vec(request)?,
        )?;
        Ok(())
    }

    /// Stage the request into a batch so it commits with its transaction.
    pub(crate) fn put_in(&self, batch: &mut Batch, request: &LeaveRequest) -> Result<(), LeaveError> {
        batch.insert(
            Self::key(&request.request_id).into_bytes(),
            minicbor::to_vec(request)?,
        );
        Ok(())
    }

    pub fn for_employee(&self, employee_id: &str) -> Result<Vec<LeaveRequest>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(b"req/") {
            let (_, value) = kv?;
            let request: LeaveRequest = minicbor::decode(&value)?;
            if request.employee_id == employee_id {
                out.push(request);
            }
        }
        out.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<LeaveRequest>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(b"req/") {
            let (_, value) = kv?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }
}
