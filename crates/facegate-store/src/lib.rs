//! Storage layer for facegate.
//!
//! Persists the employee directory and the face encodings each employee
//! owns. Two implementations are provided:
//!
//! - [`MemoryStore`]: everything behind one `RwLock`, for tests and ephemeral daemons
//! - [`SqliteStore`]: a single SQLite file with foreign keys enforcing the
//!   cascade (encodings) and set-null (department, shift) rules
//!
//! # Example
//!
//! ```no_run
//! use facegate_core::{Embedding, EmployeeId, ImageRef};
//! use facegate_store::{Employee, EmployeeDirectory, EncodingStore, SqliteStore};
//!
//! let store = SqliteStore::open("/tmp/facegate.db", 512).unwrap();
//! let id = EmployeeId::parse("E001").unwrap();
//! store.put_employee(&Employee::new(id.clone(), "Lan", "Nguyen")).unwrap();
//! let encoding_id = store
//!     .enroll(&id, Embedding::new(vec![0.0; 512]), ImageRef::from("face_data/e001.jpg"))
//!     .unwrap();
//! ```

#![forbid(unsafe_code)]

pub mod directory;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

use std::collections::HashSet;

pub use directory::{Department, Employee, RosterFilter, Shift};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use facegate_core::{Embedding, EmployeeId, EncodingId, FaceEncoding, ImageRef};

/// Authoritative employee, department and shift records.
pub trait EmployeeDirectory: Send + Sync {
    /// Whether `employee_id` exists and is active.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn exists_active(&self, employee_id: &EmployeeId) -> Result<bool>;

    /// Insert or update an employee.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownReference` if the department or shift does not exist.
    fn put_employee(&self, employee: &Employee) -> Result<()>;

    /// Get an employee by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_employee(&self, employee_id: &EmployeeId) -> Result<Option<Employee>>;

    /// Delete an employee and every encoding it owns.
    ///
    /// Returns `false` if the employee did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_employee(&self, employee_id: &EmployeeId) -> Result<bool>;

    /// Insert or update a department.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_department(&self, department: &Department) -> Result<()>;

    /// Delete a department, clearing it on every employee that referenced it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_department(&self, name: &str) -> Result<bool>;

    /// Insert or update a shift.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_shift(&self, shift: &Shift) -> Result<()>;

    /// Delete a shift, clearing it on every employee that referenced it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_shift(&self, name: &str) -> Result<bool>;

    /// Get a shift by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the row is corrupt.
    fn get_shift(&self, name: &str) -> Result<Option<Shift>>;

    /// IDs of active employees accepted by `filter`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn roster(&self, filter: &RosterFilter) -> Result<Vec<EmployeeId>>;
}

/// Keyed storage of face encodings.
///
/// Rows are never edited in place: re-enrollment adds rows, purging removes them.
pub trait EncodingStore: Send + Sync {
    /// Vector dimensionality every stored encoding must have.
    fn dimension(&self) -> usize;

    /// Store a new encoding for an active employee.
    ///
    /// Never deduplicates. The owner check and the insert are atomic, and a
    /// failed call leaves the store unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownEmployee` if the employee is missing or
    /// inactive, `ValidationError::DimensionMismatch` or
    /// `ValidationError::NonFiniteComponent` for a bad vector.
    fn enroll(
        &self,
        employee_id: &EmployeeId,
        embedding: Embedding,
        image_ref: ImageRef,
    ) -> Result<EncodingId>;

    /// All encodings owned by one employee.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_by_employee(&self, employee_id: &EmployeeId) -> Result<Vec<FaceEncoding>>;

    /// Consistent snapshot of every stored encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn all(&self) -> Result<Vec<FaceEncoding>>;

    /// Remove every encoding of one employee. Returns how many were removed;
    /// zero is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_by_employee(&self, employee_id: &EmployeeId) -> Result<usize>;

    /// Remove a single encoding. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_encoding(&self, encoding_id: &EncodingId) -> Result<bool>;

    /// Number of stored encodings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn count(&self) -> Result<usize>;
}

/// What identification scans: every stored encoding plus the employees
/// allowed to match, read together.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    pub encodings: Vec<FaceEncoding>,
    /// Active employees accepted by the roster filter.
    pub eligible: HashSet<EmployeeId>,
}

/// A directory and an encoding store sharing one consistency domain.
pub trait FaceStore: EmployeeDirectory + EncodingStore {
    /// Read `all()` and `roster(filter)` as one consistent snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn snapshot(&self, filter: &RosterFilter) -> Result<GallerySnapshot>;
}
