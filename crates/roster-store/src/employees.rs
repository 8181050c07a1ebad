//! The `employees` collection.

use crate::error::is_unique_violation;
use crate::models::{Employee, NewEmployee};
use crate::{Store, StoreError};
use chrono::NaiveDateTime;
use roster_core::FaceEnrollment;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use uuid::Uuid;

const EMPLOYEE_COLUMNS: &str = "id, created_at, name, email, position, department, \
     face_descriptor, face_angles, profile_image";

impl Store {
    /// Validate and insert a new employee with no face data.
    pub async fn create_employee(
        &self,
        form: NewEmployee,
        now: NaiveDateTime,
    ) -> Result<Employee, StoreError> {
        let form = form.normalized();
        form.validate()?;

        let employee = Employee {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            name: form.name,
            email: form.email,
            position: form.position,
            department: form.department,
            face_descriptor: None,
            face_angles: None,
            profile_image: None,
        };

        let row = employee.clone();
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO employees (id, created_at, name, email, position, department)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![row.id, row.created_at, row.name, row.email, row.position, row.department],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(id = %employee.id, email = %employee.email, "employee registered");
                Ok(employee)
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateEmail(employee.email)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_employee(&self, id: &str) -> Result<Option<Employee>, StoreError> {
        let id = id.to_string();
        let employee = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE id = ?1");
                Ok(conn.query_row(&sql, params![id], row_to_employee).optional()?)
            })
            .await?;
        Ok(employee)
    }

    /// All employees ordered by name.
    pub async fn list_employees(&self) -> Result<Vec<Employee>, StoreError> {
        self.select_employees("1 = 1").await
    }

    /// Employees with a stored primary descriptor, ordered by name.
    pub async fn enrolled_employees(&self) -> Result<Vec<Employee>, StoreError> {
        self.select_employees("face_descriptor IS NOT NULL").await
    }

    async fn select_employees(&self, filter: &'static str) -> Result<Vec<Employee>, StoreError> {
        let employees = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE {filter} ORDER BY name ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_employee)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(employees)
    }

    pub async fn count_employees(&self) -> Result<u64, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM employees", [], |r| r.get::<_, i64>(0))?)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Replace the employee's face data in one write. Prior descriptors are
    /// discarded, not merged.
    pub async fn save_face_enrollment(
        &self,
        employee_id: &str,
        enrollment: &FaceEnrollment,
    ) -> Result<(), StoreError> {
        let descriptor = serde_json::to_string(&enrollment.primary)?;
        let angles = serde_json::to_string(&enrollment.poses)?;
        let image = enrollment.profile_image.clone();
        let id = employee_id.to_string();

        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE employees
                     SET face_descriptor = ?1, face_angles = ?2, profile_image = ?3
                     WHERE id = ?4",
                    params![descriptor, angles, image, id],
                )?)
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::EmployeeNotFound(employee_id.to_string()));
        }
        tracing::info!(employee = employee_id, "face enrollment saved");
        Ok(())
    }
}

fn row_to_employee(row: &Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        id: row.get(0)?,
        created_at: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        position: row.get(4)?,
        department: row.get(5)?,
        face_descriptor: json_column(row, 6)?,
        face_angles: json_column(row, 7)?,
        profile_image: row.get(8)?,
    })
}

/// Decode a nullable JSON text column, validating descriptor lengths on the way.
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use roster_core::{Descriptor, Pose, PoseDescriptors, DESCRIPTOR_DIM};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn form(name: &str, email: &str) -> NewEmployee {
        NewEmployee {
            name: name.into(),
            email: email.into(),
            position: "Engineer".into(),
            department: "Operations".into(),
        }
    }

    fn unit(index: usize, value: f32) -> Descriptor {
        let mut v = vec![0.0; DESCRIPTOR_DIM];
        v[index] = value;
        Descriptor::new(v).unwrap()
    }

    fn enrollment(value: f32) -> FaceEnrollment {
        let mut poses = PoseDescriptors::default();
        for pose in Pose::ALL {
            poses.set(pose, unit(0, value));
        }
        FaceEnrollment {
            primary: unit(0, value),
            poses,
            profile_image: vec![0xFF, 0xD8, 0xFF, 0xD9],
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = Store::open_in_memory().await.unwrap();
        let created = store
            .create_employee(form("Somchai", "somchai@example.com"), now())
            .await
            .unwrap();

        let fetched = store.get_employee(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Somchai");
        assert_eq!(fetched.created_at, now());
        assert!(!fetched.is_enrolled());
        assert!(store.get_employee("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_employee(form("Somchai", "somchai@example.com"), now())
            .await
            .unwrap();
        let err = store
            .create_employee(form("Somchai Two", "SOMCHAI@example.com"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(ref e) if e == "somchai@example.com"));
        assert_eq!(store.count_employees().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_form_not_inserted() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.create_employee(form("S", "s@example.com"), now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { field: "name", .. }));
        assert_eq!(store.count_employees().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_ordered_by_name() {
        let store = Store::open_in_memory().await.unwrap();
        for (name, email) in [("Wichai", "w@example.com"), ("Anong", "a@example.com"), ("Malee", "m@example.com")] {
            store.create_employee(form(name, email), now()).await.unwrap();
        }
        let names: Vec<String> = store
            .list_employees()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Anong", "Malee", "Wichai"]);
    }

    #[tokio::test]
    async fn test_enrollment_overwrites_and_marks_enrolled() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.create_employee(form("Anong", "a@example.com"), now()).await.unwrap();
        store.create_employee(form("Malee", "m@example.com"), now()).await.unwrap();

        store.save_face_enrollment(&a.id, &enrollment(1.0)).await.unwrap();
        store.save_face_enrollment(&a.id, &enrollment(0.5)).await.unwrap();

        let enrolled = store.enrolled_employees().await.unwrap();
        assert_eq!(enrolled.len(), 1);
        let stored = &enrolled[0];
        assert!(stored.is_enrolled());
        assert_eq!(stored.face_descriptor, Some(unit(0, 0.5)));
        let angles = stored.face_angles.as_ref().unwrap();
        assert!(angles.missing().is_empty());
        assert_eq!(angles.get(Pose::Up), Some(&unit(0, 0.5)));
        assert_eq!(stored.profile_image.as_deref(), Some(&[0xFF, 0xD8, 0xFF, 0xD9][..]));
    }

    #[tokio::test]
    async fn test_enrollment_for_unknown_employee() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.save_face_enrollment("nobody", &enrollment(1.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::EmployeeNotFound(_)));
    }

    #[tokio::test]
    async fn test_corrupt_descriptor_rejected_on_read() {
        let store = Store::open_in_memory().await.unwrap();
        let e = store.create_employee(form("Anong", "a@example.com"), now()).await.unwrap();
        let id = e.id.clone();
        store
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE employees SET face_descriptor = '[1.0, 2.0]' WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(store.get_employee(&e.id).await, Err(StoreError::Database(_))));
    }
}
