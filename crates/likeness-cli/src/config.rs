use anyhow::{ensure, Context, Result};
use likeness_core::{ComparisonPolicy, GalleryStore, ResolverConfig, StagingSlot};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Optional TOML config file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    gallery_dir: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    staging_path: Option<PathBuf>,
    threshold: Option<f32>,
    capture_timeout_secs: Option<u64>,
    model_path: Option<PathBuf>,
    detector_model_path: Option<PathBuf>,
    on_comparison_failure: Option<ComparisonPolicy>,
}

/// CLI configuration: config file, then `LIKENESS_*` environment
/// variables, then defaults.
#[derive(Debug)]
pub struct Config {
    /// Root folder holding one sub-folder per identity.
    pub gallery_dir: PathBuf,
    /// JSON counts ledger.
    pub ledger_path: PathBuf,
    /// Single-slot staging file for the face being resolved.
    pub staging_path: PathBuf,
    /// Maximum distance, exclusive, for a confident match.
    pub threshold: f32,
    /// Give up capturing after this many seconds without a face.
    pub capture_timeout_secs: u64,
    /// ArcFace ONNX model. Without one the thumbnail embedder is used.
    pub model_path: Option<PathBuf>,
    /// SCRFD ONNX model. Without one every frame is taken as a face crop.
    pub detector_model_path: Option<PathBuf>,
    pub on_comparison_failure: ComparisonPolicy,
}

impl Config {
    /// Load from `path`, or `$LIKENESS_CONFIG` when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("LIKENESS_CONFIG").map(PathBuf::from));

        let file = match path {
            Some(path) => Self::read_file(&path)?,
            None => FileConfig::default(),
        };

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn read_file(path: &Path) -> Result<FileConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = env("LIKENESS_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let path_setting = |key: &str, from_file: Option<PathBuf>, default: PathBuf| {
            env(key).map(PathBuf::from).or(from_file).unwrap_or(default)
        };

        let config = Self {
            gallery_dir: path_setting("LIKENESS_GALLERY_DIR", file.gallery_dir, data_dir.join("learned_faces")),
            ledger_path: path_setting(
                "LIKENESS_LEDGER_PATH",
                file.ledger_path,
                data_dir.join("recognized_faces.json"),
            ),
            staging_path: path_setting(
                "LIKENESS_STAGING_PATH",
                file.staging_path,
                data_dir.join("temp_faces").join("temp_face.jpg"),
            ),
            threshold: env_parse(&env, "LIKENESS_THRESHOLD")
                .or(file.threshold)
                .unwrap_or(likeness_core::resolver::DEFAULT_THRESHOLD),
            capture_timeout_secs: env_parse(&env, "LIKENESS_CAPTURE_TIMEOUT_SECS")
                .or(file.capture_timeout_secs)
                .unwrap_or(likeness_core::resolver::DEFAULT_CAPTURE_TIMEOUT.as_secs()),
            model_path: env("LIKENESS_MODEL_PATH").map(PathBuf::from).or(file.model_path),
            detector_model_path: env("LIKENESS_DETECTOR_MODEL_PATH")
                .map(PathBuf::from)
                .or(file.detector_model_path),
            on_comparison_failure: env("LIKENESS_ON_COMPARISON_FAILURE")
                .and_then(|v| parse_policy(&v))
                .or(file.on_comparison_failure)
                .unwrap_or_default(),
        };

        ensure!(
            config.threshold.is_finite() && config.threshold > 0.0 && config.threshold <= 1.0,
            "threshold must be in (0, 1], got {}",
            config.threshold
        );
        ensure!(config.capture_timeout_secs > 0, "capture timeout must be at least 1 second");

        Ok(config)
    }

    pub fn gallery(&self) -> GalleryStore {
        GalleryStore::new(&self.gallery_dir, &self.ledger_path)
    }

    pub fn staging(&self) -> StagingSlot {
        StagingSlot::new(&self.staging_path)
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            threshold: self.threshold,
            capture_timeout: Duration::from_secs(self.capture_timeout_secs),
            on_comparison_failure: self.on_comparison_failure,
        }
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("likeness")
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn parse_policy(raw: &str) -> Option<ComparisonPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "abort" => Some(ComparisonPolicy::Abort),
        "enroll" => Some(ComparisonPolicy::Enroll),
        other => {
            tracing::warn!(value = other, "unknown comparison failure policy");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_follow_xdg_data_home() {
        let config = Config::resolve(FileConfig::default(), env_from(&[("XDG_DATA_HOME", "/xdg")])).unwrap();
        assert_eq!(config.gallery_dir, PathBuf::from("/xdg/likeness/learned_faces"));
        assert_eq!(config.ledger_path, PathBuf::from("/xdg/likeness/recognized_faces.json"));
        assert_eq!(config.staging_path, PathBuf::from("/xdg/likeness/temp_faces/temp_face.jpg"));
        assert_eq!(config.threshold, 0.4);
        assert_eq!(config.capture_timeout_secs, 10);
        assert_eq!(config.on_comparison_failure, ComparisonPolicy::Abort);
        assert!(config.model_path.is_none());
        assert!(config.detector_model_path.is_none());
    }

    #[test]
    fn test_defaults_fall_back_to_home() {
        let config = Config::resolve(FileConfig::default(), env_from(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(config.gallery_dir, PathBuf::from("/home/u/.local/share/likeness/learned_faces"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            data_dir = "/srv/faces"
            threshold = 0.3
            on_comparison_failure = "enroll"
            "#,
        )
        .unwrap();
        let env = env_from(&[("LIKENESS_THRESHOLD", "0.25"), ("LIKENESS_LEDGER_PATH", "/var/ledger.json")]);
        let config = Config::resolve(file, env).unwrap();

        assert_eq!(config.threshold, 0.25);
        assert_eq!(config.gallery_dir, PathBuf::from("/srv/faces/learned_faces"));
        assert_eq!(config.ledger_path, PathBuf::from("/var/ledger.json"));
        assert_eq!(config.on_comparison_failure, ComparisonPolicy::Enroll);
    }

    #[test]
    fn test_detector_model_from_env() {
        let env = env_from(&[("HOME", "/h"), ("LIKENESS_DETECTOR_MODEL_PATH", "/models/det_10g.onnx")]);
        let config = Config::resolve(FileConfig::default(), env).unwrap();
        assert_eq!(config.detector_model_path, Some(PathBuf::from("/models/det_10g.onnx")));
    }

    #[test]
    fn test_load_reads_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("likeness.toml");
        let data_dir = tmp.path().join("data");
        std::fs::write(
            &path,
            format!(
                "data_dir = {:?}\nthreshold = 0.35\ndetector_model_path = \"/models/det.onnx\"\n",
                data_dir.display().to_string()
            ),
        )
        .unwrap();

        let file = Config::read_file(&path).unwrap();
        let config = Config::resolve(file, env_from(&[])).unwrap();

        assert_eq!(config.gallery_dir, data_dir.join("learned_faces"));
        assert_eq!(config.threshold, 0.35);
        assert_eq!(config.detector_model_path, Some(PathBuf::from("/models/det.onnx")));
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("likeness.toml");
        std::fs::write(&path, "threshold = [").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_unparsable_env_value_keeps_default() {
        let env = env_from(&[("HOME", "/h"), ("LIKENESS_THRESHOLD", "strict")]);
        let config = Config::resolve(FileConfig::default(), env).unwrap();
        assert_eq!(config.threshold, 0.4);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let env = env_from(&[("HOME", "/h"), ("LIKENESS_THRESHOLD", "1.5")]);
        assert!(Config::resolve(FileConfig::default(), env).is_err());
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("treshold = 0.3").is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(parse_policy("ENROLL"), Some(ComparisonPolicy::Enroll));
        assert_eq!(parse_policy(" abort "), Some(ComparisonPolicy::Abort));
        assert_eq!(parse_policy("retry"), None);
    }
}
