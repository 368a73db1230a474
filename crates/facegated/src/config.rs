use facegate_core::matcher::{DEFAULT_AMBIGUITY_MARGIN, DEFAULT_DIMENSION, DEFAULT_THRESHOLD};
use facegate_core::{DistanceMetric, MatchPolicy, ValidationError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid matching policy: {0}")]
    Policy(#[from] ValidationError),
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `FACEGATE_CONFIG`, then `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Keep everything in memory instead of `db_path` (nothing persists).
    pub in_memory: bool,
    /// Directory containing the ArcFace ONNX model.
    pub model_dir: PathBuf,
    /// Fixed encoding dimensionality.
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// Distance below which a candidate matches.
    pub threshold: f32,
    /// Minimum gap between best and runner-up for an unambiguous match.
    pub ambiguity_margin: f32,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            db_path: data_dir.join("faces.db"),
            in_memory: false,
            model_dir: facegate_core::default_model_dir(),
            dimension: DEFAULT_DIMENSION,
            metric: DistanceMetric::default(),
            threshold: DEFAULT_THRESHOLD,
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Out-of-range policy values are fatal; they never fall back to defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy().validate()?;
        Ok(())
    }

    /// Overlay `FACEGATE_*` variables. Unparseable values keep the current setting.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        self.in_memory = env_flag(&var, "FACEGATE_IN_MEMORY", self.in_memory);
        self.session_bus = env_flag(&var, "FACEGATE_SESSION_BUS", self.session_bus);
        self.dimension = env_parse(&var, "FACEGATE_DIMENSION", self.dimension);
        self.metric = env_parse(&var, "FACEGATE_METRIC", self.metric);
        self.threshold = env_parse(&var, "FACEGATE_THRESHOLD", self.threshold);
        self.ambiguity_margin = env_parse(&var, "FACEGATE_AMBIGUITY_MARGIN", self.ambiguity_margin);
    }

    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            metric: self.metric,
            threshold: self.threshold,
            ambiguity_margin: self.ambiguity_margin,
        }
    }

    /// Path to the SCRFD face detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(facegate_core::detector::SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(facegate_core::extractor::ARCFACE_MODEL_FILE)
    }
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                current
            }
        },
        None => current,
    }
}

fn env_flag(var: &impl Fn(&str) -> Option<String>, key: &str, current: bool) -> bool {
    var(key).map(|v| v != "0").unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_arcface() {
        let config = Config::default();
        assert_eq!(config.dimension, 512);
        assert_eq!(config.metric, DistanceMetric::Cosine);
        assert!((config.threshold - 0.60).abs() < 1e-6);
        assert!(config.db_path.ends_with("facegate/faces.db"));
        assert!(config.arcface_model_path().ends_with("w600k_r50.onnx"));
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let mut config = Config::default();
        config.apply_env(vars(&[
            ("FACEGATE_DB_PATH", "/var/lib/facegate/x.db"),
            ("FACEGATE_METRIC", "euclidean"),
            ("FACEGATE_THRESHOLD", "0.6"),
            ("FACEGATE_DIMENSION", "128"),
            ("FACEGATE_SESSION_BUS", "1"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facegate/x.db"));
        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert_eq!(config.dimension, 128);
        assert!(config.session_bus);
        assert_eq!(config.policy().metric, DistanceMetric::Euclidean);
    }

    #[test]
    fn bad_env_values_keep_current() {
        let mut config = Config::default();
        config.apply_env(vars(&[
            ("FACEGATE_THRESHOLD", "close-enough"),
            ("FACEGATE_METRIC", "hamming"),
        ]));
        assert!((config.threshold - DEFAULT_THRESHOLD).abs() < 1e-6);
        assert_eq!(config.metric, DistanceMetric::Cosine);
    }

    #[test]
    fn toml_file_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegated.toml");
        std::fs::write(
            &path,
            "dimension = 128\nmetric = \"euclidean\"\nambiguity_margin = 0.1\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.dimension, 128);
        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert!((config.ambiguity_margin - 0.1).abs() < 1e-6);
        assert!((config.threshold - DEFAULT_THRESHOLD).abs() < 1e-6);
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegated.toml");
        std::fs::write(&path, "treshold = 0.5\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn negative_margin_from_env_is_fatal() {
        let mut config = Config::default();
        config.apply_env(vars(&[("FACEGATE_AMBIGUITY_MARGIN", "-0.01")]));
        assert!(config.ambiguity_margin < 0.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Policy(ValidationError::InvalidPolicy { field: "ambiguity_margin", .. }))
        ));
    }

    #[test]
    fn nan_threshold_from_env_is_fatal() {
        let mut config = Config::default();
        config.apply_env(vars(&[("FACEGATE_THRESHOLD", "NaN")]));
        assert!(config.threshold.is_nan());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Policy(ValidationError::InvalidPolicy { field: "threshold", .. }))
        ));
    }

    #[test]
    fn toml_rejects_out_of_range_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegated.toml");
        std::fs::write(&path, "threshold = 0.0\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Policy(_))));

        std::fs::write(&path, "ambiguity_margin = -0.5\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Policy(_))));
    }
}
