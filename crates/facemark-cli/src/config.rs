use facemark_core::DEFAULT_SIMILARITY_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("similarity threshold must be in [0, 1), got {0}")]
    InvalidThreshold(f32),
}

/// CLI configuration: defaults, then an optional TOML file named by
/// `FACEMARK_CONFIG`, then `FACEMARK_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON file holding the enrolled gallery.
    pub gallery_path: PathBuf,
    /// Directory receiving one CSV record per attendance session.
    pub records_dir: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            gallery_path: data_dir.join("gallery.json"),
            records_dir: data_dir.join("attendance_logs"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to read variables.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("FACEMARK_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(path) = lookup("FACEMARK_GALLERY_PATH") {
            config.gallery_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("FACEMARK_RECORDS_DIR") {
            config.records_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = parse_var(&lookup, "FACEMARK_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = threshold;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let t = self.similarity_threshold;
        if !(0.0..1.0).contains(&t) {
            return Err(ConfigError::InvalidThreshold(t));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facemark")
}

/// Parse `key`, ignoring (with a warning) values that do not parse.
fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
