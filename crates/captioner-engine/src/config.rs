use captioner_core::CaptionPolicy;
use captioner_store::{StoreConfig, CAPTIONS_SCHEMA_VERSION, LANDMARKS_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Pipeline configuration.
///
/// Resolved in three layers: built-in defaults, an optional TOML file, then
/// `CAPTIONER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding both tables.
    pub data_dir: PathBuf,
    pub landmarks_file: String,
    pub captions_file: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Upper bound on concurrent model invocations.
    pub max_concurrent_jobs: usize,
    pub extract_timeout_ms: u64,
    pub generate_timeout_ms: u64,
    /// Maximum caption length in characters.
    pub max_caption_len: usize,
    pub landmarks_schema_version: String,
    pub captions_schema_version: String,
    /// `fsync` after every table append.
    pub durable_appends: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("captioner");

        Self {
            data_dir,
            landmarks_file: "landmarks.csv".to_string(),
            captions_file: "captions.csv".to_string(),
            model_dir: captioner_core::default_model_dir(),
            max_concurrent_jobs: 2,
            extract_timeout_ms: 10_000,
            generate_timeout_ms: 10_000,
            max_caption_len: 200,
            landmarks_schema_version: LANDMARKS_SCHEMA_VERSION.to_string(),
            captions_schema_version: CAPTIONS_SCHEMA_VERSION.to_string(),
            durable_appends: true,
        }
    }
}

impl Config {
    /// Defaults, then `path` (if given), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `CAPTIONER_*` variables found through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CAPTIONER_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAPTIONER_LANDMARKS_FILE") {
            self.landmarks_file = v;
        }
        if let Some(v) = lookup("CAPTIONER_CAPTIONS_FILE") {
            self.captions_file = v;
        }
        if let Some(v) = lookup("CAPTIONER_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAPTIONER_LANDMARKS_SCHEMA_VERSION") {
            self.landmarks_schema_version = v;
        }
        if let Some(v) = lookup("CAPTIONER_CAPTIONS_SCHEMA_VERSION") {
            self.captions_schema_version = v;
        }
        env_parse(&lookup, "CAPTIONER_MAX_CONCURRENT_JOBS", &mut self.max_concurrent_jobs);
        env_parse(&lookup, "CAPTIONER_EXTRACT_TIMEOUT_MS", &mut self.extract_timeout_ms);
        env_parse(&lookup, "CAPTIONER_GENERATE_TIMEOUT_MS", &mut self.generate_timeout_ms);
        env_parse(&lookup, "CAPTIONER_MAX_CAPTION_LEN", &mut self.max_caption_len);
        if let Some(v) = lookup("CAPTIONER_DURABLE_APPENDS") {
            self.durable_appends = v != "0";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.max_concurrent_jobs == 0 {
            return invalid("max_concurrent_jobs", "must be at least 1");
        }
        if self.max_concurrent_jobs > tokio::sync::Semaphore::MAX_PERMITS
            || u32::try_from(self.max_concurrent_jobs).is_err()
        {
            return invalid("max_concurrent_jobs", "exceeds the semaphore permit limit");
        }
        if self.extract_timeout_ms == 0 {
            return invalid("extract_timeout_ms", "must be greater than zero");
        }
        if self.generate_timeout_ms == 0 {
            return invalid("generate_timeout_ms", "must be greater than zero");
        }
        if self.max_caption_len == 0 {
            return invalid("max_caption_len", "must be at least 1");
        }
        for (field, value) in [
            ("landmarks_file", &self.landmarks_file),
            ("captions_file", &self.captions_file),
            ("landmarks_schema_version", &self.landmarks_schema_version),
            ("captions_schema_version", &self.captions_schema_version),
        ] {
            if value.trim().is_empty() {
                return invalid(field, "must not be empty");
            }
        }
        if self.landmarks_file == self.captions_file {
            return invalid("captions_file", "must differ from landmarks_file");
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_millis(self.generate_timeout_ms)
    }

    pub fn caption_policy(&self) -> CaptionPolicy {
        CaptionPolicy::new(self.max_caption_len)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            dir: self.data_dir.clone(),
            landmarks_file: self.landmarks_file.clone(),
            captions_file: self.captions_file.clone(),
            landmarks_version: self.landmarks_schema_version.clone(),
            captions_version: self.captions_schema_version.clone(),
            durable: self.durable_appends,
        }
    }

    /// Path to the SCRFD landmark model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(captioner_core::detector::SCRFD_MODEL_FILE)
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.extract_timeout(), Duration::from_secs(10));
        assert_eq!(config.captions_schema_version, CAPTIONS_SCHEMA_VERSION);
        assert!(config.data_dir.ends_with("captioner"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            data_dir = "/srv/captioner"
            max_concurrent_jobs = 8
            durable_appends = false
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/captioner"));
        assert_eq!(config.max_concurrent_jobs, 8);
        assert!(!config.durable_appends);
        assert_eq!(config.max_caption_len, 200);
        assert_eq!(config.landmarks_file, "landmarks.csv");
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(Config::from_toml("max_jobs = 3").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("CAPTIONER_DATA_DIR", "/var/lib/captioner"),
            ("CAPTIONER_MAX_CONCURRENT_JOBS", "4"),
            ("CAPTIONER_GENERATE_TIMEOUT_MS", "250"),
            ("CAPTIONER_MAX_CAPTION_LEN", "not-a-number"),
            ("CAPTIONER_DURABLE_APPENDS", "0"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/captioner"));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.generate_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_caption_len, 200);
        assert!(!config.durable_appends);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("captioner.toml");
        std::fs::write(&path, "max_caption_len = 80\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.caption_policy(), CaptionPolicy::new(80));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(Config::from_file(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases: [(&str, fn(&mut Config)); 6] = [
            ("max_concurrent_jobs", |c| c.max_concurrent_jobs = 0),
            ("max_concurrent_jobs", |c| c.max_concurrent_jobs = usize::MAX),
            ("extract_timeout_ms", |c| c.extract_timeout_ms = 0),
            ("max_caption_len", |c| c.max_caption_len = 0),
            ("captions_schema_version", |c| c.captions_schema_version = " ".into()),
            ("captions_file", |c| c.captions_file = c.landmarks_file.clone()),
        ];
        for (expected, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: expected Invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_store_config_mapping() {
        let config = Config {
            data_dir: PathBuf::from("/data"),
            durable_appends: false,
            ..Config::default()
        };
        let store = config.store_config();
        assert_eq!(store.dir, PathBuf::from("/data"));
        assert_eq!(store.captions_version, CAPTIONS_SCHEMA_VERSION);
        assert!(!store.durable);
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
    }
}
