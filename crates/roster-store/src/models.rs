//! Row types for the two collections.

use crate::StoreError;
use chrono::NaiveDateTime;
use roster_core::{AttendanceStatus, Descriptor, PoseDescriptors};
use serde::{Deserialize, Serialize};

/// Registration form for a new employee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEmployee {
    pub name: String,
    pub email: String,
    pub position: String,
    pub department: String,
}

impl NewEmployee {
    /// Name, position and department need at least two characters; email
    /// must look like `local@domain.tld`.
    pub fn validate(&self) -> Result<(), StoreError> {
        min_chars("name", &self.name, 2)?;
        if !is_valid_email(&self.email) {
            return Err(StoreError::Validation {
                field: "email",
                reason: format!("'{}' is not a valid email address", self.email),
            });
        }
        min_chars("position", &self.position, 2)?;
        min_chars("department", &self.department, 2)?;
        Ok(())
    }

    /// Trimmed copy with a lowercased email.
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            email: self.email.trim().to_lowercase(),
            position: self.position.trim().to_string(),
            department: self.department.trim().to_string(),
        }
    }
}

fn min_chars(field: &'static str, value: &str, min: usize) -> Result<(), StoreError> {
    if value.trim().chars().count() < min {
        return Err(StoreError::Validation {
            field,
            reason: format!("must be at least {min} characters"),
        });
    }
    Ok(())
}

fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct Employee {
    pub id: String,
    pub created_at: NaiveDateTime,
    pub name: String,
    pub email: String,
    pub position: String,
    pub department: String,
    pub face_descriptor: Option<Descriptor>,
    pub face_angles: Option<PoseDescriptors>,
    #[serde(skip)]
    pub profile_image: Option<Vec<u8>>,
}

impl Employee {
    /// Enrolled means a primary descriptor is stored.
    pub fn is_enrolled(&self) -> bool {
        self.face_descriptor.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Attendance {
    pub id: String,
    pub created_at: NaiveDateTime,
    pub employee_id: String,
    pub check_in_time: NaiveDateTime,
    pub check_out_time: Option<NaiveDateTime>,
    pub status: AttendanceStatus,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

/// One line of the daily report: an attendance record with its employee.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRow {
    #[serde(flatten)]
    pub attendance: Attendance,
    pub employee_name: String,
    pub employee_position: String,
    pub employee_department: String,
}
