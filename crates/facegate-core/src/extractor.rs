//! Face encoding extraction.
//!
//! [`EncodingExtractor`] turns raw image bytes into an [`Embedding`].
//! [`ArcFaceExtractor`] finds the most confident face with SCRFD, aligns it to
//! the canonical 112x112 crop and runs the w600k_r50 ArcFace model via ONNX
//! Runtime.

use crate::alignment::align_face;
use crate::detector::{best_face, FaceBox, FaceDetector};
use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Images smaller than this on either side cannot hold a usable face.
const MIN_FACE_SIDE: u32 = 32;
/// Luma standard deviation below which the image is treated as blank.
const MIN_LUMA_STDDEV: f32 = 2.0;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("no face found in image: {0}")]
    NoFace(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Converts a face image into a fixed-length feature vector.
///
/// Implementations may hold mutable inference state, so extraction takes
/// `&mut self`; callers share an extractor by running it on one thread.
pub trait EncodingExtractor: Send {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractionError>;

    /// Length of every vector this extractor produces.
    fn dimension(&self) -> usize;
}

/// SCRFD detection followed by ArcFace recognition.
pub struct ArcFaceExtractor {
    detector: FaceDetector,
    session: Session,
}

impl ArcFaceExtractor {
    /// Load the SCRFD detector and the ArcFace recognizer.
    pub fn load(detector_path: &Path, model_path: &Path) -> Result<Self, ExtractionError> {
        let detector = FaceDetector::load(detector_path)?;

        if !model_path.exists() {
            return Err(ExtractionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { detector, session })
    }

    /// Decode and reject images too small or too flat to hold a face.
    fn decode(image_bytes: &[u8]) -> Result<RgbImage, ExtractionError> {
        let decoded = image::load_from_memory(image_bytes)
            .map_err(|e| ExtractionError::Decode(e.to_string()))?;

        let (w, h) = (decoded.width(), decoded.height());
        if w < MIN_FACE_SIDE || h < MIN_FACE_SIDE {
            return Err(ExtractionError::NoFace(format!(
                "{w}x{h} is smaller than {MIN_FACE_SIDE}x{MIN_FACE_SIDE}"
            )));
        }

        let stddev = luma_stddev(decoded.to_luma8().as_raw());
        if stddev < MIN_LUMA_STDDEV {
            return Err(ExtractionError::NoFace(format!(
                "image is blank (luma stddev {stddev:.2})"
            )));
        }

        Ok(decoded.to_rgb8())
    }

    /// Convert a 112x112 RGB crop into a normalized NCHW float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (f32::from(pixel[c]) - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl EncodingExtractor for ArcFaceExtractor {
    fn extract(&mut self, image_bytes: &[u8]) -> Result<Embedding, ExtractionError> {
        let image = Self::decode(image_bytes)?;
        let detections = self.detector.detect(&image)?;
        let face = crop_face(&image, detections)?;
        let input = Self::preprocess(&face);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractionError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

/// Align the most confident detection. No detection means no face.
fn crop_face(image: &RgbImage, detections: Vec<FaceBox>) -> Result<RgbImage, ExtractionError> {
    let candidates = detections.len();
    let face = best_face(detections)
        .ok_or_else(|| ExtractionError::NoFace("no face detected".to_string()))?;
    tracing::debug!(candidates, confidence = face.confidence, "selected face");

    align_face(image, &face.landmarks).ok_or_else(|| {
        ExtractionError::NoFace(format!(
            "face landmarks cannot be aligned (confidence {:.2})",
            face.confidence
        ))
    })
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

fn luma_stddev(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    let n = gray.len() as f32;
    let mean = gray.iter().map(|&p| f32::from(p)).sum::<f32>() / n;
    let var = gray
        .iter()
        .map(|&p| (f32::from(p) - mean).powi(2))
        .sum::<f32>()
        / n;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png(width: u32, height: u32, f: impl Fn(u32, u32) -> Rgb<u8>) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, f);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn detection(confidence: f32, landmarks: [(f32, f32); 5]) -> FaceBox {
        FaceBox {
            x: 60.0,
            y: 40.0,
            width: 80.0,
            height: 100.0,
            confidence,
            landmarks,
        }
    }

    const FACE_LANDMARKS: [(f32, f32); 5] = [
        (80.0, 60.0),
        (120.0, 60.0),
        (100.0, 85.0),
        (85.0, 110.0),
        (115.0, 110.0),
    ];

    #[test]
    fn test_decode_keeps_full_image() {
        let bytes = png(200, 160, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 40]));
        let image = ArcFaceExtractor::decode(&bytes).unwrap();
        assert_eq!(image.dimensions(), (200, 160));
    }

    #[test]
    fn test_decode_rejects_tiny_image() {
        let bytes = png(16, 16, |x, _| Rgb([(x * 10) as u8, 0, 0]));
        let err = ArcFaceExtractor::decode(&bytes).unwrap_err();
        assert!(matches!(err, ExtractionError::NoFace(_)), "got {err}");
    }

    #[test]
    fn test_decode_rejects_blank_image() {
        let bytes = png(64, 64, |_, _| Rgb([90, 90, 90]));
        let err = ArcFaceExtractor::decode(&bytes).unwrap_err();
        assert!(matches!(err, ExtractionError::NoFace(_)), "got {err}");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = ArcFaceExtractor::decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ExtractionError::Decode(_)), "got {err}");
    }

    #[test]
    fn test_textured_image_without_detections_has_no_face() {
        let bytes = png(200, 160, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 40]));
        let image = ArcFaceExtractor::decode(&bytes).unwrap();
        let err = crop_face(&image, Vec::new()).unwrap_err();
        match err {
            ExtractionError::NoFace(msg) => assert_eq!(msg, "no face detected"),
            other => panic!("expected NoFace, got {other}"),
        }
    }

    #[test]
    fn test_crop_uses_most_confident_face() {
        // Left half red, right half blue; only the right-hand face lands on blue.
        let image = RgbImage::from_fn(400, 200, |x, _| {
            if x < 200 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let right = FACE_LANDMARKS.map(|(x, y)| (x + 200.0, y));
        let crop = crop_face(
            &image,
            vec![detection(0.6, FACE_LANDMARKS), detection(0.9, right)],
        )
        .unwrap();
        assert_eq!(crop.dimensions(), (ARCFACE_INPUT_SIZE as u32, ARCFACE_INPUT_SIZE as u32));
        assert_eq!(*crop.get_pixel(56, 70), Rgb([0, 0, 255]));
    }

    #[test]
    fn test_crop_rejects_degenerate_landmarks() {
        let image = RgbImage::from_pixel(200, 200, Rgb([10, 200, 30]));
        let err = crop_face(&image, vec![detection(0.9, [(100.0, 100.0); 5])]).unwrap_err();
        assert!(matches!(err, ExtractionError::NoFace(_)), "got {err}");
    }

    #[test]
    fn test_preprocess_output_shape_and_normalization() {
        let face = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = ArcFaceExtractor::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceExtractor::load(
            Path::new("/nonexistent/det_10g.onnx"),
            Path::new("/nonexistent/w600k_r50.onnx"),
        )
        .err();
        assert!(matches!(err, Some(ExtractionError::ModelNotFound(m)) if m.contains("det_10g")));
    }
}
