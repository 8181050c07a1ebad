//! The `attendance` collection.

use crate::error::{is_foreign_key_violation, is_unique_violation};
use crate::models::{Attendance, AttendanceRow};
use crate::{Store, StoreError};
use chrono::{NaiveDate, NaiveDateTime};
use roster_core::attendance::day_bounds;
use roster_core::AttendanceStatus;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

const ATTENDANCE_COLUMNS: &str =
    "a.id, a.created_at, a.employee_id, a.check_in_time, a.check_out_time, a.status, a.image";

impl Store {
    /// The employee's record for `day` that has no check-out yet.
    pub async fn open_attendance(
        &self,
        employee_id: &str,
        day: NaiveDate,
    ) -> Result<Option<Attendance>, StoreError> {
        let (start, end) = day_bounds(day);
        let employee_id = employee_id.to_string();
        let record = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ATTENDANCE_COLUMNS} FROM attendance a
                     WHERE a.employee_id = ?1
                       AND a.created_at >= ?2 AND a.created_at < ?3
                       AND a.check_out_time IS NULL
                     ORDER BY a.created_at DESC
                     LIMIT 1"
                );
                Ok(conn
                    .query_row(&sql, params![employee_id, start, end], row_to_attendance)
                    .optional()?)
            })
            .await?;
        Ok(record)
    }

    /// Insert a check-in. Fails with `AlreadyCheckedIn` if the employee
    /// already has an open record for the same day.
    pub async fn check_in(
        &self,
        employee_id: &str,
        now: NaiveDateTime,
        status: AttendanceStatus,
        image: Option<Vec<u8>>,
    ) -> Result<Attendance, StoreError> {
        let record = Attendance {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            employee_id: employee_id.to_string(),
            check_in_time: now,
            check_out_time: None,
            status,
            image,
        };

        let row = record.clone();
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance
                        (id, created_at, work_date, employee_id, check_in_time, status, image)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id,
                        row.created_at,
                        row.created_at.date(),
                        row.employee_id,
                        row.check_in_time,
                        row.status.as_str(),
                        row.image,
                    ],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    id = %record.id,
                    employee = employee_id,
                    status = %record.status,
                    "checked in"
                );
                Ok(record)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::AlreadyCheckedIn(employee_id.to_string()))
            }
            Err(e) if is_foreign_key_violation(&e) => {
                Err(StoreError::EmployeeNotFound(employee_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close an open record. The update only applies while `check_out_time`
    /// is still null, so a record closed elsewhere fails with `NotOpen`.
    pub async fn check_out(
        &self,
        attendance_id: &str,
        now: NaiveDateTime,
    ) -> Result<Attendance, StoreError> {
        let id = attendance_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE attendance SET check_out_time = ?1
                     WHERE id = ?2 AND check_out_time IS NULL",
                    params![now, id],
                )?;
                let record = if changed == 0 {
                    None
                } else {
                    let sql = format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance a WHERE a.id = ?1");
                    Some(tx.query_row(&sql, params![id], row_to_attendance)?)
                };
                tx.commit()?;
                Ok(record)
            })
            .await?;

        let record = updated.ok_or_else(|| StoreError::NotOpen(attendance_id.to_string()))?;
        tracing::info!(id = %record.id, employee = %record.employee_id, "checked out");
        Ok(record)
    }

    /// Every record created on `day` with its employee, latest check-in first.
    pub async fn attendance_for_date(&self, day: NaiveDate) -> Result<Vec<AttendanceRow>, StoreError> {
        let (start, end) = day_bounds(day);
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ATTENDANCE_COLUMNS}, e.name, e.position, e.department
                     FROM attendance a
                     JOIN employees e ON e.id = a.employee_id
                     WHERE a.created_at >= ?1 AND a.created_at < ?2
                     ORDER BY a.check_in_time DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![start, end], |row| {
                        Ok(AttendanceRow {
                            attendance: row_to_attendance(row)?,
                            employee_name: row.get(7)?,
                            employee_position: row.get(8)?,
                            employee_department: row.get(9)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

fn row_to_attendance(row: &Row<'_>) -> rusqlite::Result<Attendance> {
    let status: String = row.get(5)?;
    let status = status.parse::<AttendanceStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Attendance {
        id: row.get(0)?,
        created_at: row.get(1)?,
        employee_id: row.get(2)?,
        check_in_time: row.get(3)?,
        check_out_time: row.get(4)?,
        status,
        image: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewEmployee;
    use roster_core::report;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        day().and_hms_opt(h, m, s).unwrap()
    }

    async fn store_with(names: &[&str]) -> (Store, Vec<String>) {
        let store = Store::open_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for name in names {
            let e = store
                .create_employee(
                    NewEmployee {
                        name: name.to_string(),
                        email: format!("{}@example.com", name.to_lowercase()),
                        position: "Clerk".into(),
                        department: "Finance".into(),
                    },
                    at(7, 0, 0),
                )
                .await
                .unwrap();
            ids.push(e.id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_check_in_then_open_record() {
        let (store, ids) = store_with(&["Somchai"]).await;
        assert!(store.open_attendance(&ids[0], day()).await.unwrap().is_none());

        let record = store
            .check_in(&ids[0], at(8, 45, 0), AttendanceStatus::Present, Some(vec![1, 2, 3]))
            .await
            .unwrap();
        let open = store.open_attendance(&ids[0], day()).await.unwrap().unwrap();
        assert_eq!(open.id, record.id);
        assert_eq!(open.image, Some(vec![1, 2, 3]));

        // A different day sees nothing open
        let next = day().succ_opt().unwrap();
        assert!(store.open_attendance(&ids[0], next).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_check_in_same_day_rejected() {
        let (store, ids) = store_with(&["Somchai"]).await;
        store
            .check_in(&ids[0], at(8, 0, 0), AttendanceStatus::Present, None)
            .await
            .unwrap();
        let err = store
            .check_in(&ids[0], at(8, 0, 1), AttendanceStatus::Present, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyCheckedIn(_)));
    }

    #[tokio::test]
    async fn test_check_in_allowed_after_check_out() {
        let (store, ids) = store_with(&["Somchai"]).await;
        let first = store
            .check_in(&ids[0], at(8, 0, 0), AttendanceStatus::Present, None)
            .await
            .unwrap();
        store.check_out(&first.id, at(12, 0, 0)).await.unwrap();
        store
            .check_in(&ids[0], at(13, 0, 0), AttendanceStatus::Late, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_out_of_closed_record_rejected() {
        let (store, ids) = store_with(&["Somchai"]).await;
        let record = store
            .check_in(&ids[0], at(8, 0, 0), AttendanceStatus::Present, None)
            .await
            .unwrap();
        let closed = store.check_out(&record.id, at(17, 0, 0)).await.unwrap();
        assert_eq!(closed.check_out_time, Some(at(17, 0, 0)));
        assert_eq!(closed.status, AttendanceStatus::Present);

        let err = store.check_out(&record.id, at(17, 5, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotOpen(_)));
        assert!(matches!(
            store.check_out("unknown", at(17, 5, 0)).await.unwrap_err(),
            StoreError::NotOpen(_)
        ));
    }

    #[tokio::test]
    async fn test_check_in_unknown_employee() {
        let (store, _) = store_with(&[]).await;
        let err = store
            .check_in("ghost", at(8, 0, 0), AttendanceStatus::Present, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmployeeNotFound(_)));
    }

    #[tokio::test]
    async fn test_report_for_date() {
        let (store, ids) = store_with(&["Anong", "Somchai"]).await;

        let anong = store
            .check_in(&ids[0], at(8, 10, 0), AttendanceStatus::Present, None)
            .await
            .unwrap();
        store.check_out(&anong.id, at(17, 25, 0)).await.unwrap();
        store
            .check_in(&ids[1], at(9, 5, 0), AttendanceStatus::Late, None)
            .await
            .unwrap();
        // Last second of the day still belongs to it
        let (store2, other) = store_with(&["Malee"]).await;
        store2
            .check_in(&other[0], at(23, 59, 59), AttendanceStatus::Late, None)
            .await
            .unwrap();
        assert_eq!(store2.attendance_for_date(day()).await.unwrap().len(), 1);

        let rows = store.attendance_for_date(day()).await.unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].employee_name, "Somchai");
        assert_eq!(report::format_time(Some(rows[0].attendance.check_in_time)), "09:05");
        assert_eq!(
            report::format_duration(rows[0].attendance.check_in_time, rows[0].attendance.check_out_time),
            "-"
        );

        assert_eq!(rows[1].employee_name, "Anong");
        assert_eq!(
            report::format_duration(rows[1].attendance.check_in_time, rows[1].attendance.check_out_time),
            "9 h 15 min"
        );

        let next = day().succ_opt().unwrap();
        assert!(store.attendance_for_date(next).await.unwrap().is_empty());
    }
}
