/// Applied on every open; statements are idempotent.
///
/// `attendance_one_open_per_day` allows at most one record without a
/// check-out per employee and day, so two kiosks cannot both check the same
/// person in.
pub(crate) const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS employees (
    id              TEXT PRIMARY KEY,
    created_at      TEXT NOT NULL,
    name            TEXT NOT NULL,
    email           TEXT NOT NULL UNIQUE,
    position        TEXT NOT NULL,
    department      TEXT NOT NULL,
    face_descriptor TEXT,
    face_angles     TEXT,
    profile_image   BLOB
);

CREATE TABLE IF NOT EXISTS attendance (
    id             TEXT PRIMARY KEY,
    created_at     TEXT NOT NULL,
    work_date      TEXT NOT NULL,
    employee_id    TEXT NOT NULL REFERENCES employees(id),
    check_in_time  TEXT NOT NULL,
    check_out_time TEXT,
    status         TEXT NOT NULL CHECK (status IN ('present', 'late', 'absent')),
    image          BLOB
);

CREATE INDEX IF NOT EXISTS attendance_created_at ON attendance(created_at);

CREATE UNIQUE INDEX IF NOT EXISTS attendance_one_open_per_day
    ON attendance(employee_id, work_date)
    WHERE check_out_time IS NULL;
";
