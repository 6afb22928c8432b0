//! Periodic accrual engine with carryover caps, expiry sweeps and
//! per-period idempotency marks.

use crate::directory::{EmployeeDirectory, EmploymentStatus};
use crate::error::LeaveError;
use crate::ledger::{AppendGuard, LedgerStore, TransactionDraft, TransactionKind};
use crate::locks::KeyedLocks;
use crate::types::{CalendarDate, DayAmount, RoundingMethod, Timestamp};
use crate::utils::{self, hrp};
use chrono::Months;
use sled::Db;
use std::fmt;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Frequency {
    #[n(0)]
    Monthly,
    #[n(1)]
    Quarterly,
    #[n(2)]
    Yearly,
}

impl Frequency {
    /// Canonical label for the period containing `on`, e.g. "2025-M03",
    /// "2025-Q1" or "2025". Marks key off this label.
    pub fn period_key(&self, on: CalendarDate) -> String {
        match self {
            Frequency::Monthly => format!("{:04}-M{:02}", on.year(), on.month()),
            Frequency::Quarterly => format!("{:04}-Q{}", on.year(), (on.month() - 1) / 3 + 1),
            Frequency::Yearly => format!("{:04}", on.year()),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Monthly => write!(f, "monthly"),
            Frequency::Quarterly => write!(f, "quarterly"),
            Frequency::Yearly => write!(f, "yearly"),
        }
    }
}

/// How a leave type accrues over time. Rules are retired, never deleted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AccrualRule {
    #[n(0)]
    pub rule_id: String,
    #[n(1)]
    pub leave_type: String,
    #[n(2)]
    pub frequency: Frequency,
    #[n(3)]
    pub rate_per_period: DayAmount,
    #[n(4)]
    pub rounding: RoundingMethod,
    #[n(5)]
    pub max_carryover: Option<DayAmount>,
    #[n(6)]
    pub carryover_expiry_years: Option<u32>,
    #[n(7)]
    pub suspend_during_unpaid_leave: bool,
    #[n(8)]
    pub active: bool,
    #[n(9)]
    pub deleted_at: Option<Timestamp>,
    #[n(10)]
    pub created_at: Timestamp,
}

impl AccrualRule {
    pub fn new(
        leave_type: &str,
        frequency: Frequency,
        rate_per_period: DayAmount,
        created_at: Timestamp,
    ) -> Result<Self, LeaveError> {
        Ok(Self {
            rule_id: utils::mint_id(hrp::ACCRUAL_RULE)?,
            leave_type: leave_type.to_string(),
            frequency,
            rate_per_period,
            rounding: RoundingMethod::None,
            max_carryover: None,
            carryover_expiry_years: None,
            suspend_during_unpaid_leave: false,
            active: true,
            deleted_at: None,
            created_at,
        })
    }
    pub fn set_rounding(mut self, rounding: RoundingMethod) -> Self {
        self.rounding = rounding;
        self
    }
    pub fn set_max_carryover(mut self, cap: DayAmount) -> Self {
        self.max_carryover = Some(cap);
        self
    }
    pub fn set_carryover_expiry_years(mut self, years: u32) -> Self {
        self.carryover_expiry_years = Some(years);
        self
    }
    pub fn set_suspend_during_unpaid_leave(mut self, suspend: bool) -> Self {
        self.suspend_during_unpaid_leave = suspend;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active && self.deleted_at.is_none()
    }

    /// Amount credited per period after the rule's rounding.
    fn credit_amount(&self) -> DayAmount {
        self.rate_per_period.round_to_whole(self.rounding)
    }
}

/// One mark per (rule, employee, period). Its presence makes accrual runs
/// re-runnable; a mark without a transaction records a suspended period.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct AccrualMark {
    #[n(0)]
    pub rule_id: String,
    #[n(1)]
    pub employee_id: String,
    #[n(2)]
    pub period: String,
    #[n(3)]
    pub amount: DayAmount,
    #[n(4)]
    pub transaction_id: Option<String>,
    #[n(5)]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccrualOutcome {
    Credited {
        transaction_id: String,
        amount: DayAmount,
    },
    AlreadyAccrued,
    Suspended,
    SkippedTerminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccrualRunReport {
    pub rule_id: String,
    pub period: String,
    pub credited: u32,
    pub total_credited: DayAmount,
    pub already_marked: u32,
    pub suspended: u32,
    pub skipped_terminated: u32,
}

impl AccrualRunReport {
    fn new(rule_id: &str, period: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            period: period.to_string(),
            credited: 0,
            total_credited: DayAmount::ZERO,
            already_marked: 0,
            suspended: 0,
            skipped_terminated: 0,
        }
    }
}

/// Year-boundary record of what carried over and what the cap forfeited.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct CarryoverTag {
    #[n(0)]
    pub employee_id: String,
    #[n(1)]
    pub leave_type: String,
    /// Boundary date label, ISO formatted.
    #[n(2)]
    pub label: String,
    #[n(3)]
    pub carried: DayAmount,
    #[n(4)]
    pub forfeited_at_boundary: DayAmount,
    #[n(5)]
    pub expires_on: Option<CalendarDate>,
    #[n(6)]
    pub swept: bool,
    #[n(7)]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CarryoverOutcome {
    Applied(CarryoverTag),
    AlreadyApplied(CarryoverTag),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarryoverSweep {
    pub employee_id: String,
    pub leave_type: String,
    pub label: String,
    pub forfeited: DayAmount,
}

pub struct AccrualEngine {
    db: Arc<Db>,
    ledger: LedgerStore,
    directory: Arc<dyn EmployeeDirectory>,
    locks: Arc<KeyedLocks>,
}

impl AccrualEngine {
    pub(crate) fn new(
        db: Arc<Db>,
        ledger: LedgerStore,
        directory: Arc<dyn EmployeeDirectory>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            db,
            ledger,
            directory,
            locks,
        }
    }

    fn rule_key(rule_id: &str) -> String {
        format!("rule/{rule_id}")
    }
    fn mark_key(rule_id: &str, employee_id: &str, period: &str) -> String {
        format!("accr/{rule_id}/{employee_id}/{period}")
    }
    fn carry_key(employee_id: &str, leave_type: &str, label: &str) -> String {
        format!("carry/{employee_id}/{leave_type}/{label}")
    }

    pub fn upsert_rule(&self, rule: AccrualRule) -> Result<(), LeaveError> {
        if rule.leave_type.is_empty() {
            return Err(LeaveError::Validation("accrual rule needs a leave type".into()));
        }
        if !rule.rate_per_period.is_positive() {
            return Err(LeaveError::Validation(
                "accrual rate must be positive".into(),
            ));
        }
        if rule.credit_amount().is_zero() {
            return Err(LeaveError::Validation(format!(
                "rate {} rounds to zero and would never credit",
                rule.rate_per_period
            )));
        }
        if rule.max_carryover.is_some_and(|cap| cap.is_negative()) {
            return Err(LeaveError::Validation(
                "carryover cap cannot be negative".into(),
            ));
        }
        self.db
            .insert(Self::rule_key(&rule.rule_id).into_bytes(), minicbor::to_vec(&rule)?)?;
        Ok(())
    }

    pub fn rule(&self, rule_id: &str) -> Result<AccrualRule, LeaveError> {
        match self.db.get(Self::rule_key(rule_id).into_bytes())? {
            Some(value) => Ok(minicbor::decode(&value)?),
            None => Err(LeaveError::NotFound {
                kind: "accrual rule",
                id: rule_id.to_string(),
            }),
        }
    }

    pub fn rules(&self) -> Result<Vec<AccrualRule>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(b"rule/") {
            let (_, value) = kv?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }

    /// Soft-delete: the rule stops accruing but stays readable since marks
    /// and transactions reference it.
    pub fn retire_rule(&self, rule_id: &str, now: Timestamp) -> Result<AccrualRule, LeaveError> {
        let mut rule = self.rule(rule_id)?;
        rule.active = false;
        rule.deleted_at.get_or_insert(now);
        self.db
            .insert(Self::rule_key(rule_id).into_bytes(), minicbor::to_vec(&rule)?)?;
        tracing::info!(rule = %rule_id, "accrual rule retired");
        Ok(rule)
    }

    /// Credit every known employee for the period containing `on`.
    /// Re-running the same period is a no-op thanks to the marks.
    pub fn run_period(
        &self,
        rule_id: &str,
        on: CalendarDate,
        now: Timestamp,
    ) -> Result<AccrualRunReport, LeaveError> {
        let rule = self.rule(rule_id)?;
        if !rule.is_active() {
            return Err(LeaveError::Validation(format!(
                "accrual rule {rule_id} is retired"
            )));
        }
        let period = rule.frequency.period_key(on);
        let mut report = AccrualRunReport::new(rule_id, &period);
        for employee_id in self.directory.employee_ids() {
            match self.accrue_one(&rule, &period, &employee_id, now)? {
                AccrualOutcome::Credited { amount, .. } => {
                    report.credited += 1;
                    report.total_credited += amount;
                }
                AccrualOutcome::AlreadyAccrued => report.already_marked += 1,
                AccrualOutcome::Suspended => report.suspended += 1,
                AccrualOutcome::SkippedTerminated => report.skipped_terminated += 1,
            }
        }
        tracing::info!(
            rule = %rule_id,
            period = %report.period,
            credited = report.credited,
            total = %report.total_credited,
            "accrual run complete"
        );
        Ok(report)
    }

    /// On-demand accrual for a single employee, e.g. a mid-period joiner.
    pub fn accrue_employee(
        &self,
        rule_id: &str,
        employee_id: &str,
        on: CalendarDate,
        now: Timestamp,
    ) -> Result<AccrualOutcome, LeaveError> {
        let rule = self.rule(rule_id)?;
        if !rule.is_active() {
            return Err(LeaveError::Validation(format!(
                "accrual rule {rule_id} is retired"
            )));
        }
        let period = rule.frequency.period_key(on);
        self.accrue_one(&rule, &period, employee_id, now)
    }

    fn accrue_one(
        &self,
        rule: &AccrualRule,
        period: &str,
        employee_id: &str,
        now: Timestamp,
    ) -> Result<AccrualOutcome, LeaveError> {
        let mark_key = Self::mark_key(&rule.rule_id, employee_id, period);
        let lock_key = mark_key.clone();
        // Mark lock first, then the balance lock inside append_linked.
        self.locks.with(&lock_key, move || {
            if self.db.get(mark_key.as_bytes())?.is_some() {
                return Ok(AccrualOutcome::AlreadyAccrued);
            }
            let profile =
                self.directory
                    .profile(employee_id)
                    .ok_or_else(|| LeaveError::NotFound {
                        kind: "employee",
                        id: employee_id.to_string(),
                    })?;
            if profile.status == EmploymentStatus::Terminated {
                return Ok(AccrualOutcome::SkippedTerminated);
            }
            if rule.suspend_during_unpaid_leave && profile.status == EmploymentStatus::UnpaidLeave
            {
                let mark = AccrualMark {
                    rule_id: rule.rule_id.clone(),
                    employee_id: employee_id.to_string(),
                    period: period.to_string(),
                    amount: DayAmount::ZERO,
                    transaction_id: None,
                    created_at: now,
                };
                self.db
                    .insert(mark_key.into_bytes(), minicbor::to_vec(&mark)?)?;
                return Ok(AccrualOutcome::Suspended);
            }

            let amount = rule.credit_amount();
            let draft = TransactionDraft::new()
                .set_employee(employee_id)
                .set_leave_type(&rule.leave_type)
                .set_kind(TransactionKind::Accrual)
                .set_amount(amount)
                .set_reason(&format!("accrual {period} under rule {}", rule.rule_id));
            let txn = self
                .ledger
                .append_linked(draft, AppendGuard::AllowNegative, now, |txn, batch| {
                    let mark = AccrualMark {
                        rule_id: rule.rule_id.clone(),
                        employee_id: employee_id.to_string(),
                        period: period.to_string(),
                        amount,
                        transaction_id: Some(txn.transaction_id.clone()),
                        created_at: now,
                    };
                    batch.insert(mark_key.into_bytes(), minicbor::to_vec(&mark)?);
                    Ok(())
                })?;
            Ok(AccrualOutcome::Credited {
                transaction_id: txn.transaction_id,
                amount,
            })
        })
    }

    pub fn mark(
        &self,
        rule_id: &str,
        employee_id: &str,
        period: &str,
    ) -> Result<Option<AccrualMark>, LeaveError> {
        match self
            .db
            .get(Self::mark_key(rule_id, employee_id, period).into_bytes())?
        {
            Some(value) => Ok(Some(minicbor::decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Close a period boundary for one employee: cap the carried balance,
    /// forfeit the excess and tag the carry for a later expiry sweep.
    /// Re-applying the same boundary returns the existing tag.
    pub fn apply_carryover(
        &self,
        rule_id: &str,
        employee_id: &str,
        boundary: CalendarDate,
        now: Timestamp,
    ) -> Result<CarryoverOutcome, LeaveError> {
        let rule = self.rule(rule_id)?;
        let label = boundary.to_string();
        let key = Self::carry_key(employee_id, &rule.leave_type, &label);
        let lock_key = key.clone();
        self.locks.with(&lock_key, move || {
            if let Some(value) = self.db.get(key.as_bytes())? {
                return Ok(CarryoverOutcome::AlreadyApplied(minicbor::decode(&value)?));
            }
            let balance = self.ledger.current_balance(employee_id, &rule.leave_type)?;
            let positive = balance.max(DayAmount::ZERO);
            let (carried, forfeit) = match rule.max_carryover {
                Some(cap) => {
                    let kept = positive.min(cap);
                    (kept, positive - kept)
                }
                None => (positive, DayAmount::ZERO),
            };
            let expires_on = match rule.carryover_expiry_years {
                Some(years) => Some(add_months(boundary, years * 12)?),
                None => None,
            };
            let tag = CarryoverTag {
                employee_id: employee_id.to_string(),
                leave_type: rule.leave_type.clone(),
                label: label.clone(),
                carried,
                forfeited_at_boundary: forfeit,
                expires_on,
                swept: false,
                created_at: now,
            };
            if forfeit.is_positive() {
                let draft = TransactionDraft::new()
                    .set_employee(employee_id)
                    .set_leave_type(&rule.leave_type)
                    .set_kind(TransactionKind::Adjustment)
                    .set_amount(-forfeit)
                    .set_reason(&format!("carryover cap at {label}"));
                self.ledger
                    .append_linked(draft, AppendGuard::AllowNegative, now, |_, batch| {
                        batch.insert(key.into_bytes(), minicbor::to_vec(&tag)?);
                        Ok(())
                    })?;
            } else {
                self.db.insert(key.into_bytes(), minicbor::to_vec(&tag)?)?;
            }
            tracing::info!(
                employee = %tag.employee_id,
                leave_type = %tag.leave_type,
                carried = %tag.carried,
                forfeited = %tag.forfeited_at_boundary,
                "carryover applied"
            );
            Ok(CarryoverOutcome::Applied(tag))
        })
    }

    /// Forfeit carried days whose expiry date has been reached. Only the
    /// part of the carry still unused counts; later takes consume the
    /// oldest days first.
    pub fn sweep_expired_carryover(
        &self,
        today: CalendarDate,
        now: Timestamp,
    ) -> Result<Vec<CarryoverSweep>, LeaveError> {
        let mut tags = Vec::new();
        for kv in self.db.scan_prefix(b"carry/") {
            let (_, value) = kv?;
            let tag: CarryoverTag = minicbor::decode(&value)?;
            if !tag.swept && tag.expires_on.is_some_and(|on| on <= today) {
                tags.push(tag);
            }
        }

        let mut report = Vec::new();
        for tag in tags {
            let key = Self::carry_key(&tag.employee_id, &tag.leave_type, &tag.label);
            let lock_key = key.clone();
            let swept = self.locks.with(&lock_key, move || {
                let current: CarryoverTag = match self.db.get(key.as_bytes())? {
                    Some(value) => minicbor::decode(&value)?,
                    None => return Ok::<_, LeaveError>(None),
                };
                if current.swept {
                    return Ok(None);
                }
                let balance = self
                    .ledger
                    .current_balance(&current.employee_id, &current.leave_type)?;
                let unused = current.carried.min(balance).max(DayAmount::ZERO);
                let mut updated = current.clone();
                updated.swept = true;
                if unused.is_positive() {
                    let draft = TransactionDraft::new()
                        .set_employee(&current.employee_id)
                        .set_leave_type(&current.leave_type)
                        .set_kind(TransactionKind::Adjustment)
                        .set_amount(-unused)
                        .set_reason(&format!("carryover expiry {}", current.label));
                    self.ledger.append_linked(
                        draft,
                        AppendGuard::AllowNegative,
                        now,
                        |_, batch| {
                            batch.insert(key.into_bytes(), minicbor::to_vec(&updated)?);
                            Ok(())
                        },
                    )?;
                } else {
                    self.db
                        .insert(key.into_bytes(), minicbor::to_vec(&updated)?)?;
                }
                Ok(Some(CarryoverSweep {
                    employee_id: current.employee_id,
                    leave_type: current.leave_type,
                    label: current.label,
                    forfeited: unused,
                }))
            })?;
            if let Some(entry) = swept {
                report.push(entry);
            }
        }
        if !report.is_empty() {
            tracing::info!(count = report.len(), "carryover expiry sweep complete");
        }
        Ok(report)
    }

    pub fn carryover_tags(&self, employee_id: &str) -> Result<Vec<CarryoverTag>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(format!("carry/{employee_id}/").as_bytes()) {
            let (_, value) = kv?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }
}

/// Calendar-safe month addition, clamping to the last day of a short month.
fn add_months(date: CalendarDate, months: u32) -> Result<CalendarDate, LeaveError> {
    date.naive()
        .checked_add_months(Months::new(months))
        .map(CalendarDate::from)
        .ok_or_else(|| LeaveError::Validation("date out of range for expiry".into()))
}
