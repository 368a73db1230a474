//! Enrollment and identification, independent of the IPC transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use facegate_core::{
    Embedding, EmployeeId, EncodingId, ExtractionError, IdentityMatcher, Identification,
    ImageRef, ValidationError,
};
use facegate_store::{EmployeeDirectory, EncodingStore, FaceStore, RosterFilter, StoreError};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{EngineError, EngineHandle};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("invalid encoding id: {0}")]
    InvalidEncodingId(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("engine unavailable: {0}")]
    Engine(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(v) => Self::Validation(v),
            other => Self::Store(other),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Extraction(e) => Self::Extraction(e),
            other => Self::Engine(other.to_string()),
        }
    }
}

/// Encoding metadata returned to clients; vectors never leave the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct EncodingSummary {
    pub encoding_id: EncodingId,
    pub employee_id: EmployeeId,
    pub image_ref: String,
    pub model_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct FaceService {
    engine: EngineHandle,
    store: Arc<dyn FaceStore>,
    matcher: IdentityMatcher,
}

impl FaceService {
    pub fn new(engine: EngineHandle, store: Arc<dyn FaceStore>, matcher: IdentityMatcher) -> Self {
        Self {
            engine,
            store,
            matcher,
        }
    }

    /// Extract an encoding from `image` and store it for `employee_id`.
    pub async fn enroll_image(
        &self,
        employee_id: &str,
        image: Vec<u8>,
        image_ref: &str,
    ) -> Result<EncodingId, ServiceError> {
        let employee_id = self.require_active(employee_id)?;
        let embedding = self.engine.extract(image).await?;
        self.store_encoding(&employee_id, embedding, image_ref)
    }

    /// Store a pre-computed encoding for `employee_id`.
    pub fn enroll_vector(
        &self,
        employee_id: &str,
        embedding: Embedding,
        image_ref: &str,
    ) -> Result<EncodingId, ServiceError> {
        let employee_id = self.require_active(employee_id)?;
        self.store_encoding(&employee_id, embedding, image_ref)
    }

    /// Extract a query from `image` and identify it.
    pub async fn identify_image(
        &self,
        image: Vec<u8>,
        caller: &str,
        filter: &RosterFilter,
    ) -> Result<Identification, ServiceError> {
        let query = self.engine.extract(image).await?;
        self.identify_vector(&query, caller, filter, None)
    }

    /// Identify a raw query vector against the current store snapshot.
    ///
    /// Only active employees accepted by `filter` can match. `threshold`
    /// overrides the configured one for this call.
    pub fn identify_vector(
        &self,
        query: &Embedding,
        caller: &str,
        filter: &RosterFilter,
        threshold: Option<f32>,
    ) -> Result<Identification, ServiceError> {
        query.validate(self.matcher.dimension())?;
        let matcher = match threshold {
            Some(t) => self.matcher.with_threshold(t)?,
            None => self.matcher,
        };

        let snapshot = self.store.snapshot(filter)?;
        let outcome = matcher.identify(query, &snapshot.encodings, Some(&snapshot.eligible))?;

        match &outcome {
            Identification::Match(m) => tracing::info!(
                caller,
                employee_id = %m.employee_id,
                encoding_id = %m.encoding_id,
                distance = m.distance,
                gallery = snapshot.encodings.len(),
                "identify: match"
            ),
            Identification::NoMatch => {
                tracing::info!(caller, gallery = snapshot.encodings.len(), "identify: no match")
            }
            Identification::Ambiguous { candidates } => tracing::warn!(
                caller,
                candidates = ?candidates.iter().map(|c| c.employee_id.as_str()).collect::<Vec<_>>(),
                "identify: ambiguous, refusing to pick"
            ),
        }

        Ok(outcome)
    }

    pub fn list_encodings(&self, employee_id: &str) -> Result<Vec<EncodingSummary>, ServiceError> {
        let employee_id = EmployeeId::parse(employee_id)?;
        Ok(self
            .store
            .list_by_employee(&employee_id)?
            .into_iter()
            .map(|e| EncodingSummary {
                encoding_id: e.id,
                employee_id: e.employee_id,
                image_ref: e.image_ref.0,
                model_version: e.embedding.model_version,
                created_at: e.created_at,
            })
            .collect())
    }

    /// Remove every encoding of an employee, typically before re-enrollment.
    pub fn purge_encodings(&self, employee_id: &str) -> Result<usize, ServiceError> {
        let employee_id = EmployeeId::parse(employee_id)?;
        let removed = self.store.delete_by_employee(&employee_id)?;
        tracing::info!(employee_id = %employee_id, removed, "encodings purged");
        Ok(removed)
    }

    pub fn remove_encoding(&self, encoding_id: &str) -> Result<bool, ServiceError> {
        let id = EncodingId::parse(encoding_id)
            .ok_or_else(|| ServiceError::InvalidEncodingId(encoding_id.to_string()))?;
        let removed = self.store.delete_encoding(&id)?;
        tracing::info!(encoding_id = %id, removed, "remove encoding");
        Ok(removed)
    }

    /// Delete an employee together with all of its encodings.
    pub fn remove_employee(&self, employee_id: &str) -> Result<bool, ServiceError> {
        let employee_id = EmployeeId::parse(employee_id)?;
        Ok(self.store.delete_employee(&employee_id)?)
    }

    pub fn status(&self) -> Result<serde_json::Value, ServiceError> {
        let policy = self.matcher.policy();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "encodings": self.store.count()?,
            "dimension": self.matcher.dimension(),
            "extractor_dimension": self.engine.dimension(),
            "metric": policy.metric.to_string(),
            "threshold": policy.threshold,
            "ambiguity_margin": policy.ambiguity_margin,
        }))
    }

    fn require_active(&self, raw: &str) -> Result<EmployeeId, ServiceError> {
        let employee_id = EmployeeId::parse(raw)?;
        if !self.store.exists_active(&employee_id)? {
            return Err(ValidationError::UnknownEmployee(employee_id).into());
        }
        Ok(employee_id)
    }

    fn store_encoding(
        &self,
        employee_id: &EmployeeId,
        embedding: Embedding,
        image_ref: &str,
    ) -> Result<EncodingId, ServiceError> {
        let id = self
            .store
            .enroll(employee_id, embedding, ImageRef::from(image_ref))?;
        tracing::info!(employee_id = %employee_id, encoding_id = %id, image_ref, "enrolled");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use facegate_core::{DistanceMetric, EncodingExtractor, MatchPolicy};
    use facegate_store::{Department, Employee, MemoryStore};

    /// Reads the image bytes as signed coordinates, one per component.
    struct ByteExtractor;

    impl EncodingExtractor for ByteExtractor {
        fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractionError> {
            if image.is_empty() {
                return Err(ExtractionError::NoFace("blank frame".into()));
            }
            Ok(Embedding::new(image.iter().map(|&b| f32::from(b as i8)).collect()))
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn id(s: &str) -> EmployeeId {
        EmployeeId::parse(s).unwrap()
    }

    fn create_test_service() -> (FaceService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(2));
        store.put_department(&Department { name: "Ops".into(), description: None }).unwrap();
        store.put_employee(&Employee::new(id("A"), "An", "Vo")).unwrap();
        let mut b = Employee::new(id("B"), "Binh", "Do");
        b.department = Some("Ops".into());
        store.put_employee(&b).unwrap();

        let matcher = IdentityMatcher::new(
            2,
            MatchPolicy {
                metric: DistanceMetric::Euclidean,
                threshold: 1.5,
                ambiguity_margin: 0.0,
            },
        );
        let engine = spawn_engine(Box::new(ByteExtractor)).unwrap();
        let service = FaceService::new(engine, store.clone(), matcher);
        (service, store)
    }

    #[tokio::test]
    async fn enroll_then_identify_exact_image() {
        let (service, store) = create_test_service();
        let enc = service.enroll_image("A", vec![0, 0], "a.jpg").await.unwrap();
        assert_eq!(store.list_by_employee(&id("A")).unwrap().len(), 1);

        let outcome = service
            .identify_image(vec![0, 0], "kiosk-1", &RosterFilter::default())
            .await
            .unwrap();
        match outcome {
            Identification::Match(m) => {
                assert_eq!(m.employee_id, id("A"));
                assert_eq!(m.encoding_id, enc);
                assert!(m.distance.abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn midpoint_is_ambiguous() {
        let (service, _store) = create_test_service();
        service.enroll_image("A", vec![0, 0], "a.jpg").await.unwrap();
        service.enroll_image("B", vec![2, 0], "b.jpg").await.unwrap();

        let outcome = service
            .identify_image(vec![1, 0], "kiosk-1", &RosterFilter::default())
            .await
            .unwrap();
        assert!(matches!(outcome, Identification::Ambiguous { .. }), "got {outcome:?}");
    }

    #[tokio::test]
    async fn department_filter_resolves_ambiguity() {
        let (service, _store) = create_test_service();
        service.enroll_image("A", vec![0, 0], "a.jpg").await.unwrap();
        service.enroll_image("B", vec![2, 0], "b.jpg").await.unwrap();

        let filter = RosterFilter { department: Some("Ops".into()), shift: None };
        let outcome = service.identify_image(vec![1, 0], "kiosk-1", &filter).await.unwrap();
        assert_eq!(outcome.employee_id(), Some(&id("B")));
    }

    #[tokio::test]
    async fn far_query_is_no_match() {
        let (service, _store) = create_test_service();
        service.enroll_image("A", vec![0, 0], "a.jpg").await.unwrap();
        let outcome = service
            .identify_image(vec![50, 50], "kiosk-1", &RosterFilter::default())
            .await
            .unwrap();
        assert_eq!(outcome, Identification::NoMatch);
    }

    #[tokio::test]
    async fn unknown_employee_is_rejected_before_extraction() {
        let (service, _store) = create_test_service();
        // An empty image would fail extraction; the employee check must come first.
        let err = service.enroll_image("ZZ", Vec::new(), "z.jpg").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::UnknownEmployee(_))));
    }

    #[tokio::test]
    async fn extraction_failure_is_surfaced() {
        let (service, store) = create_test_service();
        let err = service.enroll_image("A", Vec::new(), "a.jpg").await.unwrap_err();
        assert!(matches!(err, ServiceError::Extraction(ExtractionError::NoFace(_))));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_dimension_query_is_rejected() {
        let (service, _store) = create_test_service();
        let err = service
            .identify_image(vec![1, 2, 3], "kiosk-1", &RosterFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn vector_enrollment_and_removal() {
        let (service, _store) = create_test_service();
        let enc = service
            .enroll_vector("A", Embedding::new(vec![0.5, 0.5]), "upload")
            .unwrap();
        let listed = service.list_encodings("A").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].encoding_id, enc);

        assert!(service.remove_encoding(&enc.to_string()).unwrap());
        assert!(service.list_encodings("A").unwrap().is_empty());
        assert!(matches!(
            service.remove_encoding("not-a-uuid"),
            Err(ServiceError::InvalidEncodingId(_))
        ));
    }

    #[test]
    fn remove_employee_cascades() {
        let (service, store) = create_test_service();
        service.enroll_vector("A", Embedding::new(vec![0.0, 0.0]), "1").unwrap();
        service.enroll_vector("A", Embedding::new(vec![0.1, 0.0]), "2").unwrap();
        assert!(service.remove_employee("A").unwrap());
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(service.purge_encodings("A").unwrap(), 0);
    }

    #[test]
    fn status_reports_counts() {
        let (service, _store) = create_test_service();
        service.enroll_vector("B", Embedding::new(vec![0.0, 1.0]), "1").unwrap();
        let status = service.status().unwrap();
        assert_eq!(status["encodings"], 1);
        assert_eq!(status["metric"], "euclidean");
    }

    #[tokio::test]
    async fn inactive_employee_is_never_identified() {
        let (service, store) = create_test_service();
        service.enroll_image("A", vec![0, 0], "a.jpg").await.unwrap();
        service.enroll_image("B", vec![5, 0], "b.jpg").await.unwrap();
        let mut a = store.get_employee(&id("A")).unwrap().unwrap();
        a.is_active = false;
        store.put_employee(&a).unwrap();

        let unscoped = service
            .identify_image(vec![0, 0], "kiosk-1", &RosterFilter::default())
            .await
            .unwrap();
        assert_eq!(unscoped, Identification::NoMatch);
    }

    #[test]
    fn vector_identify_honours_filter_and_threshold() {
        let (service, _store) = create_test_service();
        service.enroll_vector("A", Embedding::new(vec![0.0, 0.0]), "1").unwrap();
        service.enroll_vector("B", Embedding::new(vec![2.0, 0.0]), "2").unwrap();
        let query = Embedding::new(vec![1.0, 0.0]);

        let ops = RosterFilter { department: Some("Ops".into()), shift: None };
        let outcome = service.identify_vector(&query, "kiosk-1", &ops, None).unwrap();
        assert_eq!(outcome.employee_id(), Some(&id("B")));

        let outcome = service.identify_vector(&query, "kiosk-1", &ops, Some(0.5)).unwrap();
        assert_eq!(outcome, Identification::NoMatch);

        let err = service
            .identify_vector(&query, "kiosk-1", &ops, Some(-1.0))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::InvalidPolicy { .. })));
    }

    #[test]
    fn extraction_message_passes_through() {
        let err = ServiceError::from(ExtractionError::NoFace("no face detected".into()));
        assert_eq!(err.to_string(), ExtractionError::NoFace("no face detected".into()).to_string());
    }
}
