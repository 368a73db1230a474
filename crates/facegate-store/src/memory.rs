//! In-memory storage implementation.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use facegate_core::{Embedding, EmployeeId, EncodingId, FaceEncoding, ImageRef, ValidationError};
use parking_lot::RwLock;

use crate::directory::{Department, Employee, RosterFilter, Shift};
use crate::error::{Result, StoreError};
use crate::{EmployeeDirectory, EncodingStore, FaceStore, GallerySnapshot};

#[derive(Default)]
struct Inner {
    employees: BTreeMap<EmployeeId, Employee>,
    departments: HashMap<String, Department>,
    shifts: HashMap<String, Shift>,
    /// Encodings grouped by owner; an owner key exists only while it has rows.
    encodings: BTreeMap<EmployeeId, Vec<FaceEncoding>>,
}

impl Inner {
    fn check_references(&self, employee: &Employee) -> Result<()> {
        if let Some(d) = &employee.department {
            if !self.departments.contains_key(d) {
                return Err(StoreError::UnknownReference {
                    kind: "department",
                    name: d.clone(),
                });
            }
        }
        if let Some(s) = &employee.shift {
            if !self.shifts.contains_key(s) {
                return Err(StoreError::UnknownReference {
                    kind: "shift",
                    name: s.clone(),
                });
            }
        }
        Ok(())
    }

    fn roster<'a>(&'a self, filter: &'a RosterFilter) -> impl Iterator<Item = &'a EmployeeId> + 'a {
        self.employees
            .values()
            .filter(move |e| filter.accepts(e))
            .map(|e| &e.employee_id)
    }

    fn all(&self) -> Vec<FaceEncoding> {
        self.encodings.values().flatten().cloned().collect()
    }
}

/// Store held entirely in memory.
///
/// Every mutation takes the write lock, so a snapshot taken under the read
/// lock never observes a half-applied change.
pub struct MemoryStore {
    dimension: usize,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl EmployeeDirectory for MemoryStore {
    fn exists_active(&self, employee_id: &EmployeeId) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .employees
            .get(employee_id)
            .is_some_and(|e| e.is_active))
    }

    fn put_employee(&self, employee: &Employee) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_references(employee)?;
        let mut record = employee.clone();
        if let Some(existing) = inner.employees.get(&employee.employee_id) {
            record.created_at = existing.created_at;
        }
        record.updated_at = Utc::now();
        inner.employees.insert(record.employee_id.clone(), record);
        Ok(())
    }

    fn get_employee(&self, employee_id: &EmployeeId) -> Result<Option<Employee>> {
        Ok(self.inner.read().employees.get(employee_id).cloned())
    }

    fn delete_employee(&self, employee_id: &EmployeeId) -> Result<bool> {
        let mut inner = self.inner.write();
        let existed = inner.employees.remove(employee_id).is_some();
        let removed = inner.encodings.remove(employee_id).map_or(0, |v| v.len());
        if existed {
            tracing::info!(employee_id = %employee_id, encodings = removed, "employee deleted");
        }
        Ok(existed)
    }

    fn put_department(&self, department: &Department) -> Result<()> {
        self.inner
            .write()
            .departments
            .insert(department.name.clone(), department.clone());
        Ok(())
    }

    fn delete_department(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.departments.remove(name).is_none() {
            return Ok(false);
        }
        for employee in inner.employees.values_mut() {
            if employee.department.as_deref() == Some(name) {
                employee.department = None;
            }
        }
        Ok(true)
    }

    fn put_shift(&self, shift: &Shift) -> Result<()> {
        self.inner
            .write()
            .shifts
            .insert(shift.name.clone(), shift.clone());
        Ok(())
    }

    fn delete_shift(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.shifts.remove(name).is_none() {
            return Ok(false);
        }
        for employee in inner.employees.values_mut() {
            if employee.shift.as_deref() == Some(name) {
                employee.shift = None;
            }
        }
        Ok(true)
    }

    fn get_shift(&self, name: &str) -> Result<Option<Shift>> {
        Ok(self.inner.read().shifts.get(name).cloned())
    }

    fn roster(&self, filter: &RosterFilter) -> Result<Vec<EmployeeId>> {
        Ok(self.inner.read().roster(filter).cloned().collect())
    }
}

impl EncodingStore for MemoryStore {
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

        let mut inner = self.inner.write();
        let active = inner
            .employees
            .get(employee_id)
            .is_some_and(|e| e.is_active);
        if !active {
            return Err(ValidationError::UnknownEmployee(employee_id.clone()).into());
        }

        let encoding = FaceEncoding {
            id: EncodingId::new(),
            employee_id: employee_id.clone(),
            embedding,
            image_ref,
            created_at: Utc::now(),
        };
        let id = encoding.id;
        inner
            .encodings
            .entry(employee_id.clone())
            .or_default()
            .push(encoding);

        tracing::debug!(employee_id = %employee_id, encoding_id = %id, "encoding enrolled");
        Ok(id)
    }

    fn list_by_employee(&self, employee_id: &EmployeeId) -> Result<Vec<FaceEncoding>> {
        Ok(self
            .inner
            .read()
            .encodings
            .get(employee_id)
            .cloned()
            .unwrap_or_default())
    }

    fn all(&self) -> Result<Vec<FaceEncoding>> {
        Ok(self.inner.read().all())
    }

    fn delete_by_employee(&self, employee_id: &EmployeeId) -> Result<usize> {
        let removed = self
            .inner
            .write()
            .encodings
            .remove(employee_id)
            .map_or(0, |v| v.len());
        Ok(removed)
    }

    fn delete_encoding(&self, encoding_id: &EncodingId) -> Result<bool> {
        let mut inner = self.inner.write();
        let mut emptied = None;
        let mut found = false;
        for (owner, rows) in inner.encodings.iter_mut() {
            if let Some(pos) = rows.iter().position(|e| e.id == *encoding_id) {
                rows.remove(pos);
                found = true;
                if rows.is_empty() {
                    emptied = Some(owner.clone());
                }
                break;
            }
        }
        if let Some(owner) = emptied {
            inner.encodings.remove(&owner);
        }
        Ok(found)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.inner.read().encodings.values().map(Vec::len).sum())
    }
}

impl FaceStore for MemoryStore {
    fn snapshot(&self, filter: &RosterFilter) -> Result<GallerySnapshot> {
        let inner = self.inner.read();
        Ok(GallerySnapshot {
            encodings: inner.all(),
            eligible: inner.roster(filter).cloned().collect(),
        })
    }
}
