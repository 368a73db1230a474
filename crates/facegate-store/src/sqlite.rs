//! SQLite storage implementation.
//!
//! One connection guarded by a mutex. Multi-statement mutations and the
//! full-table snapshot each run inside a transaction, so `all()` never sees
//! a half-applied enroll or cascade.

use std::path::Path;

use chrono::{DateTime, NaiveTime, Utc};
use facegate_core::{Embedding, EmployeeId, EncodingId, FaceEncoding, ImageRef, ValidationError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::directory::{Department, Employee, RosterFilter, Shift};
use crate::error::{Result, StoreError};
use crate::schema::{decode_vector, encode_vector, SCHEMA_SQL, TIME_FORMAT};
use crate::{EmployeeDirectory, EncodingStore, FaceStore, GallerySnapshot};

const ENCODING_COLUMNS: &str =
    "encoding_id, employee_id, dimension, vector, model_version, image_ref, created_at";
const EMPLOYEE_COLUMNS: &str = "employee_id, first_name, last_name, email, phone, is_active, \
     department, shift, created_at, updated_at";

/// SQLite-backed storage implementation.
pub struct SqliteStore {
    dimension: usize,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::DimensionMismatch` if the file was created
    /// with a different dimension, or a database error.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), dimension, "opened encoding database");
        Self::init(conn, dimension)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;

        conn.execute(
            "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('dimension', ?1)",
            params![dimension.to_string()],
        )?;
        let stored: String = conn.query_row(
            "SELECT value FROM store_meta WHERE key = 'dimension'",
            [],
            |row| row.get(0),
        )?;
        let stored: usize = stored
            .parse()
            .map_err(|_| StoreError::InvalidDbValue(format!("stored dimension: {stored}")))?;
        if stored != dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: stored,
                actual: dimension,
            }
            .into());
        }

        Ok(Self {
            dimension,
            conn: Mutex::new(conn),
        })
    }
}

fn require_reference(tx: &Transaction<'_>, kind: &'static str, name: Option<&str>) -> Result<()> {
    let Some(name) = name else {
        return Ok(());
    };
    let sql = match kind {
        "department" => "SELECT EXISTS(SELECT 1 FROM departments WHERE name = ?1)",
        _ => "SELECT EXISTS(SELECT 1 FROM shifts WHERE name = ?1)",
    };
    let exists: bool = tx.query_row(sql, params![name], |row| row.get(0))?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::UnknownReference {
            kind,
            name: name.to_string(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidDbValue(format!("timestamp {raw:?}: {e}")))
}

fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, TIME_FORMAT)
        .map_err(|e| StoreError::InvalidDbValue(format!("time of day {raw:?}: {e}")))
}

fn parse_employee_id(raw: String) -> Result<EmployeeId> {
    EmployeeId::try_from(raw)
        .map_err(|e| StoreError::InvalidDbValue(e.to_string()))
}

/// Raw `face_encodings` row before validation.
struct EncodingRow {
    encoding_id: String,
    employee_id: String,
    dimension: i64,
    vector: Vec<u8>,
    model_version: Option<String>,
    image_ref: String,
    created_at: String,
}

impl EncodingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            encoding_id: row.get(0)?,
            employee_id: row.get(1)?,
            dimension: row.get(2)?,
            vector: row.get(3)?,
            model_version: row.get(4)?,
            image_ref: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<FaceEncoding> {
        let id = EncodingId::parse(&self.encoding_id).ok_or_else(|| {
            StoreError::InvalidDbValue(format!("encoding id: {}", self.encoding_id))
        })?;
        let dimension = usize::try_from(self.dimension)
            .map_err(|_| StoreError::InvalidDbValue(format!("dimension: {}", self.dimension)))?;
        Ok(FaceEncoding {
            id,
            employee_id: parse_employee_id(self.employee_id)?,
            embedding: Embedding {
                values: decode_vector(&self.vector, dimension)?,
                model_version: self.model_version,
            },
            image_ref: ImageRef(self.image_ref),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct EmployeeRow {
    employee_id: String,
    first_name: String,
    last_name: String,
    email: Option<String>,
    phone: Option<String>,
    is_active: bool,
    department: Option<String>,
    shift: Option<String>,
    created_at: String,
    updated_at: String,
}

impl EmployeeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            employee_id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
            phone: row.get(4)?,
            is_active: row.get(5)?,
            department: row.get(6)?,
            shift: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Employee> {
        Ok(Employee {
            employee_id: parse_employee_id(self.employee_id)?,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            is_active: self.is_active,
            department: self.department,
            shift: self.shift,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl EmployeeDirectory for SqliteStore {
    fn exists_active(&self, employee_id: &EmployeeId) -> Result<bool> {
        let conn = self.conn.lock();
        let active: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM employees WHERE employee_id = ?1 AND is_active = 1)",
            params![employee_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(active)
    }

    fn put_employee(&self, employee: &Employee) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_reference(&tx, "department", employee.department.as_deref())?;
        require_reference(&tx, "shift", employee.shift.as_deref())?;

        tx.execute(
            "INSERT INTO employees (
                employee_id, first_name, last_name, email, phone, is_active,
                department, shift, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(employee_id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                phone = excluded.phone,
                is_active = excluded.is_active,
                department = excluded.department,
                shift = excluded.shift,
                updated_at = excluded.updated_at",
            params![
                employee.employee_id.as_str(),
                employee.first_name,
                employee.last_name,
                employee.email,
                employee.phone,
                employee.is_active,
                employee.department,
                employee.shift,
                employee.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_employee(&self, employee_id: &EmployeeId) -> Result<Option<Employee>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE employee_id = ?1"),
                params![employee_id.as_str()],
                EmployeeRow::from_row,
            )
            .optional()?;
        row.map(EmployeeRow::decode).transpose()
    }

    fn delete_employee(&self, employee_id: &EmployeeId) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let encodings = tx.execute(
            "DELETE FROM face_encodings WHERE employee_id = ?1",
            params![employee_id.as_str()],
        )?;
        let deleted = tx.execute(
            "DELETE FROM employees WHERE employee_id = ?1",
            params![employee_id.as_str()],
        )?;
        tx.commit()?;

        if deleted > 0 {
            tracing::info!(employee_id = %employee_id, encodings, "employee deleted");
        }
        Ok(deleted > 0)
    }

    fn put_department(&self, department: &Department) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO departments (name, description) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET description = excluded.description",
            params![department.name, department.description],
        )?;
        Ok(())
    }

    fn delete_department(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE employees SET department = NULL WHERE department = ?1",
            params![name],
        )?;
        let deleted = tx.execute("DELETE FROM departments WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn put_shift(&self, shift: &Shift) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO shifts (name, start_time, end_time, description) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                description = excluded.description",
            params![
                shift.name,
                shift.start_time.format(TIME_FORMAT).to_string(),
                shift.end_time.format(TIME_FORMAT).to_string(),
                shift.description,
            ],
        )?;
        Ok(())
    }

    fn delete_shift(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE employees SET shift = NULL WHERE shift = ?1",
            params![name],
        )?;
        let deleted = tx.execute("DELETE FROM shifts WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn get_shift(&self, name: &str) -> Result<Option<Shift>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, start_time, end_time, description FROM shifts WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(name, start, end, description)| {
            Ok(Shift {
                name,
                start_time: parse_time(&start)?,
                end_time: parse_time(&end)?,
                description,
            })
        })
        .transpose()
    }

    fn roster(&self, filter: &RosterFilter) -> Result<Vec<EmployeeId>> {
        select_roster(&self.conn.lock(), filter)
    }
}

fn select_roster(conn: &Connection, filter: &RosterFilter) -> Result<Vec<EmployeeId>> {
    let mut stmt = conn.prepare(
        "SELECT employee_id FROM employees
         WHERE is_active = 1
           AND (?1 IS NULL OR department = ?1)
           AND (?2 IS NULL OR shift = ?2)
         ORDER BY employee_id",
    )?;
    let ids = stmt
        .query_map(params![filter.department, filter.shift], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ids.into_iter().map(parse_employee_id).collect()
}

fn select_all(conn: &Connection) -> Result<Vec<EncodingRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENCODING_COLUMNS} FROM face_encodings ORDER BY rowid"
    ))?;
    let rows = stmt
        .query_map([], EncodingRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl EncodingStore for SqliteStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn enroll(
        &self,
        employee_id: &EmployeeId,
        embedding: Embedding,
        image_ref: ImageRef,
    ) -> Result<EncodingId> {
        embedding.validate(self.dimension)?;

        let id = EncodingId::new();
        let dimension = i64::try_from(self.dimension)
            .map_err(|_| StoreError::InvalidDbValue(format!("dimension: {}", self.dimension)))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM employees WHERE employee_id = ?1 AND is_active = 1)",
            params![employee_id.as_str()],
            |row| row.get(0),
        )?;
        if !active {
            return Err(ValidationError::UnknownEmployee(employee_id.clone()).into());
        }

        tx.execute(
            "INSERT INTO face_encodings (
                encoding_id, employee_id, dimension, vector, model_version, image_ref, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                employee_id.as_str(),
                dimension,
                encode_vector(&embedding.values),
                embedding.model_version,
                image_ref.0,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(employee_id = %employee_id, encoding_id = %id, "encoding enrolled");
        Ok(id)
    }

    fn list_by_employee(&self, employee_id: &EmployeeId) -> Result<Vec<FaceEncoding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENCODING_COLUMNS} FROM face_encodings WHERE employee_id = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt
            .query_map(params![employee_id.as_str()], EncodingRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EncodingRow::decode).collect()
    }

    fn all(&self) -> Result<Vec<FaceEncoding>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = select_all(&tx)?;
        tx.commit()?;
        rows.into_iter().map(EncodingRow::decode).collect()
    }

    fn delete_by_employee(&self, employee_id: &EmployeeId) -> Result<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM face_encodings WHERE employee_id = ?1",
            params![employee_id.as_str()],
        )?;
        Ok(removed)
    }

    fn delete_encoding(&self, encoding_id: &EncodingId) -> Result<bool> {
        let removed = self.conn.lock().execute(
            "DELETE FROM face_encodings WHERE encoding_id = ?1",
            params![encoding_id.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM face_encodings", [], |row| row.get(0))?;
        usize::try_from(n).map_err(|_| StoreError::InvalidDbValue(format!("count: {n}")))
    }
}

impl FaceStore for SqliteStore {
    fn snapshot(&self, filter: &RosterFilter) -> Result<GallerySnapshot> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = select_all(&tx)?;
        let eligible = select_roster(&tx, filter)?;
        tx.commit()?;
        Ok(GallerySnapshot {
            encodings: rows
                .into_iter()
                .map(EncodingRow::decode)
                .collect::<Result<_>>()?,
            eligible: eligible.into_iter().collect(),
        })
    }
}
