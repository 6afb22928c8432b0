//! Employee master-data boundary
//!
//! The core never owns employee records. It reads tenure, reporting line,
//! and employment status through this trait; the in-memory implementation
//! backs tests and demos.

use crate::types::CalendarDate;
use chrono::Datelike;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum EmploymentStatus {
    #[n(0)]
    Active,
    #[n(1)]
    UnpaidLeave,
    #[n(2)]
    Terminated,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ContractType {
    #[n(0)]
    Permanent,
    #[n(1)]
    FixedTerm,
    #[n(2)]
    Contractor,
}

#[derive(Debug, Clone)]
pub struct EmployeeProfile {
    pub employee_id: String,
    pub manager_id: Option<String>,
    pub department: Option<String>,
    pub grade: Option<String>,
    pub contract_type: ContractType,
    pub hire_date: CalendarDate,
    pub status: EmploymentStatus,
}

impl EmployeeProfile {
    pub fn new(employee_id: &str, hire_date: CalendarDate) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            manager_id: None,
            department: None,
            grade: None,
            contract_type: ContractType::Permanent,
            hire_date,
            status: EmploymentStatus::Active,
        }
    }
    pub fn set_manager(mut self, manager_id: &str) -> Self {
        self.manager_id = Some(manager_id.to_string());
        self
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
        self.contract_type = contract_type;
        self
    }
    pub fn set_status(mut self, status: EmploymentStatus) -> Self {
        self.status = status;
        self
    }

    /// Whole months of service as of the given date, clamped at zero for
    /// hire dates in the future.
    pub fn tenure_months(&self, as_of: CalendarDate) -> u32 {
        let hired = self.hire_date.naive();
        let date = as_of.naive();
        let mut months = (date.year() - hired.year()) * 12 + (date.month() as i32 - hired.month() as i32);
        if date.day() < hired.day() {
            months -= 1;
        }
        months.max(0) as u32
    }
}

pub trait EmployeeDirectory: Send + Sync {
    fn profile(&self, employee_id: &str) -> Option<EmployeeProfile>;
    /// Snapshot of every known employee id, for accrual runs.
    fn employee_ids(&self) -> Vec<String>;
}

/// Directory backed by a map, for tests and embedding without an HR feed.
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<String, EmployeeProfile>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
    pub fn upsert(&self, profile: EmployeeProfile) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(profile.employee_id.clone(), profile);
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl EmployeeDirectory for InMemoryDirectory {
    fn profile(&self, employee_id: &str) -> Option<EmployeeProfile> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(employee_id).cloned()
    }
    fn employee_ids(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}
