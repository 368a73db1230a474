use std::sync::Arc;

use facegate_core::Embedding;
use facegate_store::RosterFilter;
use zbus::interface;
use zbus::message::Header;

use crate::service::{FaceService, ServiceError};

pub const BUS_NAME: &str = "org.facegate.Facegate1";
pub const OBJECT_PATH: &str = "/org/facegate/Facegate1";

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Facegate1
/// Object path: /org/facegate/Facegate1
///
/// Identification outcomes are returned as JSON with an `outcome` field of
/// `match`, `no_match` or `ambiguous`. Only caller errors and extraction
/// failures are D-Bus errors.
pub struct FacegateInterface {
    service: Arc<FaceService>,
}

impl FacegateInterface {
    pub fn new(service: Arc<FaceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.facegate.Facegate1")]
impl FacegateInterface {
    /// Enroll a face image for an employee. Returns the new encoding id.
    async fn enroll(
        &self,
        employee_id: &str,
        image: Vec<u8>,
        image_ref: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(employee_id, bytes = image.len(), "enroll requested");
        let id = self
            .service
            .enroll_image(employee_id, image, image_ref)
            .await
            .map_err(to_fdo)?;
        Ok(id.to_string())
    }

    /// Enroll a pre-computed encoding vector for an employee.
    async fn enroll_vector(
        &self,
        employee_id: &str,
        vector: Vec<f64>,
        image_ref: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(employee_id, dimension = vector.len(), "enroll_vector requested");
        let id = self
            .service
            .enroll_vector(employee_id, to_embedding(&vector), image_ref)
            .map_err(to_fdo)?;
        Ok(id.to_string())
    }

    /// Identify the face in an image. Empty `department`/`shift` disables that filter.
    async fn identify(
        &self,
        #[zbus(header)] header: Header<'_>,
        image: Vec<u8>,
        caller: &str,
        department: &str,
        shift: &str,
    ) -> zbus::fdo::Result<String> {
        let sender = header.sender().map(|s| s.to_string()).unwrap_or_default();
        tracing::info!(caller, sender = %sender, bytes = image.len(), "identify requested");
        let filter = RosterFilter {
            department: non_empty(department),
            shift: non_empty(shift),
        };
        let outcome = self
            .service
            .identify_image(image, caller, &filter)
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Identify a raw query vector. Empty `department`/`shift` disables that
    /// filter; a `threshold` of 0 keeps the configured one.
    async fn identify_vector(
        &self,
        #[zbus(header)] header: Header<'_>,
        vector: Vec<f64>,
        caller: &str,
        department: &str,
        shift: &str,
        threshold: f64,
    ) -> zbus::fdo::Result<String> {
        let sender = header.sender().map(|s| s.to_string()).unwrap_or_default();
        tracing::info!(caller, sender = %sender, dimension = vector.len(), threshold, "identify_vector requested");
        let filter = RosterFilter {
            department: non_empty(department),
            shift: non_empty(shift),
        };
        let outcome = self
            .service
            .identify_vector(&to_embedding(&vector), caller, &filter, threshold_override(threshold))
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// List an employee's encodings (metadata only) as JSON.
    async fn list_encodings(&self, employee_id: &str) -> zbus::fdo::Result<String> {
        let encodings = self.service.list_encodings(employee_id).map_err(to_fdo)?;
        to_json(&encodings)
    }

    /// Remove all encodings of an employee. Returns how many were removed.
    async fn purge_encodings(&self, employee_id: &str) -> zbus::fdo::Result<u32> {
        let removed = self.service.purge_encodings(employee_id).map_err(to_fdo)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Remove one encoding by id.
    async fn remove_encoding(&self, encoding_id: &str) -> zbus::fdo::Result<bool> {
        self.service.remove_encoding(encoding_id).map_err(to_fdo)
    }

    /// Remove an employee and, with it, every encoding it owns.
    async fn remove_employee(&self, employee_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(employee_id, "remove_employee requested");
        self.service.remove_employee(employee_id).map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status().map_err(to_fdo)?;
        Ok(status.to_string())
    }
}

fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    match err {
        ServiceError::Validation(_) | ServiceError::InvalidEncodingId(_) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        ServiceError::Extraction(_) => zbus::fdo::Error::Failed(err.to_string()),
        ServiceError::Store(_) | ServiceError::Engine(_) => {
            tracing::error!(error = %err, "request failed");
            zbus::fdo::Error::Failed(err.to_string())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// D-Bus carries doubles; encodings are stored as f32.
fn to_embedding(vector: &[f64]) -> Embedding {
    Embedding::new(vector.iter().map(|&v| v as f32).collect())
}

fn threshold_override(threshold: f64) -> Option<f32> {
    (threshold != 0.0).then_some(threshold as f32)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
