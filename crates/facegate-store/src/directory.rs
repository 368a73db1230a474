//! Employee directory records.
//!
//! Employees exclusively own their face encodings (deleting an employee
//! deletes them). Departments and shifts are only referenced: deleting one
//! clears the reference on every employee that pointed at it.

use chrono::{DateTime, NaiveTime, Utc};
use facegate_core::EmployeeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub employee_id: EmployeeId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    /// Department name, if assigned.
    pub department: Option<String>,
    /// Shift name, if assigned.
    pub shift: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Employee {
    /// A new active employee with no department or shift.
    pub fn new(employee_id: EmployeeId, first_name: &str, last_name: &str) -> Self {
        let now = Utc::now();
        Self {
            employee_id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: None,
            phone: None,
            is_active: true,
            department: None,
            shift: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Department, keyed by its human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub name: String,
    pub description: Option<String>,
}

/// Work shift, keyed by its human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub description: Option<String>,
}

/// Selects active employees by department and/or shift.
///
/// Inactive employees are never accepted, with or without a filter, so they
/// cannot be identified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterFilter {
    pub department: Option<String>,
    pub shift: Option<String>,
}

impl RosterFilter {
    pub fn is_empty(&self) -> bool {
        self.department.is_none() && self.shift.is_none()
    }

    pub fn accepts(&self, employee: &Employee) -> bool {
        employee.is_active
            && self
                .department
                .as_ref()
                .map_or(true, |d| employee.department.as_ref() == Some(d))
            && self
                .shift
                .as_ref()
                .map_or(true, |s| employee.shift.as_ref() == Some(s))
    }
}
