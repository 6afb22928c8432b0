//! Entitlement rules and precedence resolution
//!
//! Yearly allotment resolves as: individual override > group override >
//! base rule. Group ties break by a configurable precedence policy.

use crate::directory::{ContractType, EmployeeDirectory, EmployeeProfile};
use crate::error::LeaveError;
use crate::types::{CalendarDate, DayAmount, Timestamp};
use crate::utils::{self, hrp};
use sled::Db;
use std::sync::Arc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq)]
pub struct EligibilityCriteria {
    #[n(0)]
    pub min_tenure_months: Option<u32>,
    #[n(1)]
    pub grade: Option<String>,
    #[n(2)]
    pub contract_type: Option<ContractType>,
}

impl EligibilityCriteria {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_min_tenure_months(mut self, months: u32) -> Self {
        self.min_tenure_months = Some(months);
        self
    }
    pub fn set_grade(mut self, grade: &str) -> Self {
        self.grade = Some(grade.to_string());
        self
    }
    pub fn set_contract_type(mut self, contract_type: ContractType) -> Self {
        self.contract_type = Some(contract_type);
        self
    }

    /// First unmet criterion, or None when the employee qualifies.
    fn unmet(&self, profile: &EmployeeProfile, as_of: CalendarDate) -> Option<String> {
        if let Some(min) = self.min_tenure_months {
            let tenure = profile.tenure_months(as_of);
            if tenure < min {
                return Some(format!(
                    "tenure {tenure} months is below the required {min}"
                ));
            }
        }
        if let Some(grade) = &self.grade {
            if profile.grade.as_ref() != Some(grade) {
                return Some(format!("grade {grade} required"));
            }
        }
        if let Some(contract) = self.contract_type {
            if profile.contract_type != contract {
                return Some("contract type does not qualify".to_string());
            }
        }
        None
    }
}

/// Base yearly allotment for a leave type, gated by eligibility.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct EntitlementRule {
    #[n(0)]
    pub rule_id: String,
    #[n(1)]
    pub leave_type: String,
    #[n(2)]
    pub yearly_days: DayAmount,
    #[n(3)]
    pub eligibility: EligibilityCriteria,
    #[n(4)]
    pub created_at: Timestamp,
}

impl EntitlementRule {
    pub fn new(
        leave_type: &str,
        yearly_days: DayAmount,
        created_at: Timestamp,
    ) -> Result<Self, LeaveError> {
        Ok(Self {
            rule_id: utils::mint_id(hrp::ENTITLEMENT)?,
            leave_type: leave_type.to_string(),
            yearly_days,
            eligibility: EligibilityCriteria::default(),
            created_at,
        })
    }
    pub fn set_eligibility(mut self, eligibility: EligibilityCriteria) -> Self {
        self.eligibility = eligibility;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq)]
pub struct GroupCriteria {
    #[n(0)]
    pub department: Option<String>,
    #[n(1)]
    pub grade: Option<String>,
    #[n(2)]
    pub contract_type: Option<ContractType>,
    /// Explicit membership list; empty means not used.
    #[n(3)]
    pub employee_ids: Vec<String>,
}

impl GroupCriteria {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_department(mut self, department: &str) -> Self {
        self.department = Some(department.to_string());
        self
    }
    pub fn set_grade(mut self, grade: &str) -> Self {
        self.grade = Some(grade.to_string());
        self
    }
    pub fn set_contract_type(mut self, contract_type: ContractType) -> Self {
        self.contract_type = Some(contract_type);
        self
    }
    pub fn add_employee(mut self, employee_id: &str) -> Self {
        self.employee_ids.push(employee_id.to_string());
        self
    }

    fn is_empty(&self) -> bool {
        self.department.is_none()
            && self.grade.is_none()
            && self.contract_type.is_none()
            && self.employee_ids.is_empty()
    }

    /// Every present criterion must match.
    fn matches(&self, profile: &EmployeeProfile) -> bool {
        if let Some(department) = &self.department {
            if profile.department.as_ref() != Some(department) {
                return false;
            }
        }
        if let Some(grade) = &self.grade {
            if profile.grade.as_ref() != Some(grade) {
                return false;
            }
        }
        if let Some(contract) = self.contract_type {
            if profile.contract_type != contract {
                return false;
            }
        }
        if !self.employee_ids.is_empty()
            && !self.employee_ids.iter().any(|id| id == &profile.employee_id)
        {
            return false;
        }
        true
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub enum EntitlementScope {
    #[n(0)]
    Employee {
        #[n(0)]
        employee_id: String,
    },
    #[n(1)]
    Group {
        #[n(0)]
        criteria: GroupCriteria,
    },
}

/// HR-granted deviation from the base rule, for one employee or a group.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct PersonalizedEntitlement {
    #[n(0)]
    pub entitlement_id: String,
    #[n(1)]
    pub leave_type: String,
    #[n(2)]
    pub scope: EntitlementScope,
    #[n(3)]
    pub days: DayAmount,
    #[n(4)]
    pub reason: String,
    #[n(5)]
    pub valid_from: Option<CalendarDate>,
    #[n(6)]
    pub valid_to: Option<CalendarDate>,
    #[n(7)]
    pub created_at: Timestamp,
}

impl PersonalizedEntitlement {
    pub fn new(
        leave_type: &str,
        scope: EntitlementScope,
        days: DayAmount,
        reason: &str,
        created_at: Timestamp,
    ) -> Result<Self, LeaveError> {
        Ok(Self {
            entitlement_id: utils::mint_id(hrp::ENTITLEMENT)?,
            leave_type: leave_type.to_string(),
            scope,
            days,
            reason: reason.to_string(),
            valid_from: None,
            valid_to: None,
            created_at,
        })
    }
    pub fn set_valid_window(
        mut self,
        from: Option<CalendarDate>,
        to: Option<CalendarDate>,
    ) -> Self {
        self.valid_from = from;
        self.valid_to = to;
        self
    }

    fn active_on(&self, as_of: CalendarDate) -> bool {
        self.valid_from.is_none_or(|from| from <= as_of)
            && self.valid_to.is_none_or(|to| as_of <= to)
    }
}

/// Tie-break when several group overrides match the same employee.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum PrecedencePolicy {
    #[default]
    MostRecent,
    MostGenerous,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntitlementSource {
    Base,
    GroupOverride,
    IndividualOverride,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntitlement {
    pub leave_type: String,
    pub days: DayAmount,
    pub applied_rule_id: String,
    pub source: EntitlementSource,
}

pub struct EntitlementResolver {
    db: Arc<Db>,
    directory: Arc<dyn EmployeeDirectory>,
    precedence: PrecedencePolicy,
}

impl EntitlementResolver {
    pub(crate) fn new(db: Arc<Db>, directory: Arc<dyn EmployeeDirectory>) -> Self {
        Self {
            db,
            directory,
            precedence: PrecedencePolicy::default(),
        }
    }

    pub(crate) fn set_precedence(mut self, precedence: PrecedencePolicy) -> Self {
        self.precedence = precedence;
        self
    }

    fn base_key(leave_type: &str) -> String {
        format!("ent/base/{leave_type}")
    }
    fn override_key(entitlement_id: &str) -> String {
        format!("ent/ovr/{entitlement_id}")
    }

    pub fn set_base_rule(&self, rule: EntitlementRule) -> Result<(), LeaveError> {
        if rule.yearly_days.is_negative() {
            return Err(LeaveError::Validation(
                "yearly entitlement cannot be negative".into(),
            ));
        }
        self.db
            .insert(Self::base_key(&rule.leave_type).into_bytes(), minicbor::to_vec(&rule)?)?;
        Ok(())
    }

    pub fn base_rule(&self, leave_type: &str) -> Result<EntitlementRule, LeaveError> {
        match self.db.get(Self::base_key(leave_type).into_bytes())? {
            Some(value) => Ok(minicbor::decode(&value)?),
            None => Err(LeaveError::NotFound {
                kind: "entitlement rule",
                id: leave_type.to_string(),
            }),
        }
    }

    pub fn add_override(&self, entitlement: PersonalizedEntitlement) -> Result<(), LeaveError> {
        if entitlement.days.is_negative() {
            return Err(LeaveError::Validation(
                "entitlement override cannot be negative".into(),
            ));
        }
        if let EntitlementScope::Group { criteria } = &entitlement.scope {
            if criteria.is_empty() {
                return Err(LeaveError::Validation(
                    "group override needs at least one criterion".into(),
                ));
            }
        }
        self.db.insert(
            Self::override_key(&entitlement.entitlement_id).into_bytes(),
            minicbor::to_vec(&entitlement)?,
        )?;
        Ok(())
    }

    fn overrides(&self, leave_type: &str) -> Result<Vec<PersonalizedEntitlement>, LeaveError> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(b"ent/ovr/") {
            let (_, value) = kv?;
            let entitlement: PersonalizedEntitlement = minicbor::decode(&value)?;
            if entitlement.leave_type == leave_type {
                out.push(entitlement);
            }
        }
        Ok(out)
    }

    fn pick(&self, candidates: Vec<PersonalizedEntitlement>) -> Option<PersonalizedEntitlement> {
        match self.precedence {
            PrecedencePolicy::MostRecent => candidates
                .into_iter()
                .max_by(|a, b| (a.created_at, &a.entitlement_id).cmp(&(b.created_at, &b.entitlement_id))),
            PrecedencePolicy::MostGenerous => candidates.into_iter().max_by(|a, b| {
                (a.days, a.created_at, &a.entitlement_id)
                    .cmp(&(b.days, b.created_at, &b.entitlement_id))
            }),
        }
    }

    /// Resolve the applicable yearly entitlement for an employee.
    ///
    /// Eligibility gates the base rule only: a personalized override is a
    /// deliberate HR act and applies regardless of tenure or grade.
    pub fn resolve(
        &self,
        employee_id: &str,
        leave_type: &str,
        as_of: CalendarDate,
    ) -> Result<ResolvedEntitlement, LeaveError> {
        let profile = self
            .directory
            .profile(employee_id)
            .ok_or_else(|| LeaveError::NotFound {
                kind: "employee",
                id: employee_id.to_string(),
            })?;

        let mut individual = Vec::new();
        let mut group = Vec::new();
        for entitlement in self.overrides(leave_type)? {
            if !entitlement.active_on(as_of) {
                continue;
            }
            match &entitlement.scope {
                EntitlementScope::Employee { employee_id: id } if id == employee_id => {
                    individual.push(entitlement)
                }
                EntitlementScope::Group { criteria } if criteria.matches(&profile) => {
                    group.push(entitlement)
                }
                _ => {}
            }
        }

        if let Some(win) = self.pick(individual) {
            return Ok(ResolvedEntitlement {
                leave_type: leave_type.to_string(),
                days: win.days,
                applied_rule_id: win.entitlement_id,
                source: EntitlementSource::IndividualOverride,
            });
        }
        if let Some(win) = self.pick(group) {
            return Ok(ResolvedEntitlement {
                leave_type: leave_type.to_string(),
                days: win.days,
                applied_rule_id: win.entitlement_id,
                source: EntitlementSource::GroupOverride,
            });
        }

        let base = self.base_rule(leave_type)?;
        if let Some(reason) = base.eligibility.unmet(&profile, as_of) {
            return Err(LeaveError::EligibilityNotMet {
                employee_id: employee_id.to_string(),
                rule_id: base.rule_id,
                reason,
            });
        }
        Ok(ResolvedEntitlement {
            leave_type: leave_type.to_string(),
            days: base.yearly_days,
            applied_rule_id: base.rule_id,
            source: EntitlementSource::Base,
        })
    }
}
