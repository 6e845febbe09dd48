//! Configuration loading from TOML files and environment overrides

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use toksharder_core::{EncoderSpec, PipelineConfig};

/// Global configuration for toksharder
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub encoder: EncoderSpec,
    pub input: InputConfig,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// JSON field or Parquet column holding record text
    pub text_field: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            text_field: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Seconds without data before a remote stream counts as stalled
    pub read_timeout: u64,
    pub max_retries: u32,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            read_timeout: 30,
            max_retries: 3,
        }
    }
}

/// Environment variables that override file settings
pub const ENV_OVERRIDES: &[&str] = &[
    "TOKSHARDER_SHARD_SIZE",
    "TOKSHARDER_OUTPUT_DIR",
    "TOKSHARDER_WORKERS",
    "TOKSHARDER_CHANNEL_CAPACITY",
    "TOKSHARDER_CHUNK_SIZE",
];

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {name}={value:?}: {e}"))
}

impl Config {
    /// Load configuration from default locations, then apply environment overrides
    ///
    /// Search order:
    /// 1. ./toksharder.toml (current directory)
    /// 2. ~/.config/toksharder/config.toml
    ///
    /// If no config file found, starts from defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::find_file()?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load a specific file, then apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn find_file() -> Result<Self> {
        let local_config = PathBuf::from("toksharder.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "toksharder") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `TOKSHARDER_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let p = &mut self.pipeline;
        if let Some(v) = lookup("TOKSHARDER_SHARD_SIZE") {
            p.shard_size = parse_env("TOKSHARDER_SHARD_SIZE", &v)?;
        }
        if let Some(v) = lookup("TOKSHARDER_OUTPUT_DIR") {
            p.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOKSHARDER_WORKERS") {
            p.workers = parse_env("TOKSHARDER_WORKERS", &v)?;
        }
        if let Some(v) = lookup("TOKSHARDER_CHANNEL_CAPACITY") {
            p.channel_capacity = parse_env("TOKSHARDER_CHANNEL_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("TOKSHARDER_CHUNK_SIZE") {
            p.chunk_size = parse_env("TOKSHARDER_CHUNK_SIZE", &v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use toksharder_core::ShardFormat;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.shard_size, 100_000_000);
        assert_eq!(config.pipeline.output_dir, PathBuf::from("shards"));
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.input.text_field, "text");
        assert_eq!(config.encoder, EncoderSpec::Bytes);
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[pipeline]
shard_size = 1000000
output_dir = "/tmp/shards"
shard_format = "bin"

[encoder]
kind = "tokenizer"
path = "gpt2/tokenizer.json"

[input]
text_field = "content"

[http]
max_retries = 5
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.pipeline.shard_size, 1_000_000);
        assert_eq!(config.pipeline.output_dir, PathBuf::from("/tmp/shards"));
        assert_eq!(config.pipeline.shard_format, ShardFormat::Bin);
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(
            config.encoder,
            EncoderSpec::Tokenizer {
                path: PathBuf::from("gpt2/tokenizer.json")
            }
        );
        assert_eq!(config.input.text_field, "content");
        assert_eq!(config.http.max_retries, 5);
        assert_eq!(config.http.read_timeout, 30);
    }

    #[test]
    fn env_overrides_file() {
        let mut config: Config = toml::from_str("[pipeline]\nworkers = 2\n").unwrap();
        config
            .apply_env(env(&[
                ("TOKSHARDER_WORKERS", "16"),
                ("TOKSHARDER_OUTPUT_DIR", "/data/out"),
                ("TOKSHARDER_CHUNK_SIZE", " 32 "),
            ]))
            .unwrap();
        assert_eq!(config.pipeline.workers, 16);
        assert_eq!(config.pipeline.output_dir, PathBuf::from("/data/out"));
        assert_eq!(config.pipeline.chunk_size, 32);
        assert_eq!(config.pipeline.channel_capacity, 100);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("TOKSHARDER_SHARD_SIZE", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("TOKSHARDER_SHARD_SIZE"));
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toksharder.toml");
        std::fs::write(&path, "[pipeline]\nshard_size = \"big\"\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("toksharder.toml"));
    }
}
