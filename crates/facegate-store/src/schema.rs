//! SQLite schema and the on-disk vector encoding.

use crate::error::{Result, StoreError};

pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS departments (
    name TEXT PRIMARY KEY NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS shifts (
    name TEXT PRIMARY KEY NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS employees (
    employee_id TEXT PRIMARY KEY NOT NULL,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    department TEXT REFERENCES departments(name) ON DELETE SET NULL,
    shift TEXT REFERENCES shifts(name) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_encodings (
    encoding_id TEXT PRIMARY KEY NOT NULL,
    employee_id TEXT NOT NULL REFERENCES employees(employee_id) ON DELETE CASCADE,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    model_version TEXT,
    image_ref TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_encodings_employee
    ON face_encodings(employee_id);
";

/// Time-of-day format for shift boundaries.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Little-endian `f32` sequence.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let expected_len = dimension
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| StoreError::InvalidDbValue(format!("dimension overflow: {dimension}")))?;
    if blob.len() != expected_len {
        return Err(StoreError::InvalidDbValue(format!(
            "invalid vector byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }

    let mut out = Vec::with_capacity(dimension);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err(StoreError::InvalidDbValue(
                "vector contains non-finite values".to_string(),
            ));
        }
        out.push(value);
    }
    Ok(out)
}
