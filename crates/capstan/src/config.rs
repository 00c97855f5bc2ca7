//! Configuration loading.
//!
//! Compiled defaults are overlaid by an optional `capstan.toml` and then
//! by `CAPSTAN_*` environment variables. Paths are infrastructure: they
//! cannot change at runtime.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete capstan configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapstanConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Filter name → executable path. Filters are configured statically;
    /// converters are discovered from the converter directory.
    #[serde(default)]
    pub filters: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub pcap_dir: PathBuf,
    pub index_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub state_dir: PathBuf,
    pub converter_dir: PathBuf,
    pub filter_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = PathBuf::from("data");
        PathsConfig {
            pcap_dir: base.join("pcaps"),
            index_dir: base.join("indexes"),
            snapshot_dir: base.join("snapshots"),
            state_dir: base.join("state"),
            converter_dir: base.join("converters"),
            filter_dir: base.join("filters"),
        }
    }
}

impl PathsConfig {
    pub fn all(&self) -> [(&'static str, &Path); 6] {
        [
            ("pcap_dir", &self.pcap_dir),
            ("index_dir", &self.index_dir),
            ("snapshot_dir", &self.snapshot_dir),
            ("state_dir", &self.state_dir),
            ("converter_dir", &self.converter_dir),
            ("filter_dir", &self.filter_dir),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            log_level: "info,capstan=debug".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum subprocess instances per converter.
    pub converter_processes: usize,
    /// Capacity of each filter's input queue.
    pub filter_queue_depth: usize,
    /// Recent stderr lines retained per converter process.
    pub converter_stderr_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            converter_processes: 2,
            filter_queue_depth: 100,
            converter_stderr_lines: 512,
        }
    }
}

impl CapstanConfig {
    /// Loads defaults, then `config_path` (or `./capstan.toml` when it
    /// exists), then environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = CapstanConfig::default();

        let candidate = config_path
            .map(PathBuf::from)
            .or_else(|| {
                let local = PathBuf::from("capstan.toml");
                local.exists().then_some(local)
            });
        if let Some(path) = candidate {
            let raw = fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
                path: path.clone(),
                source,
            })?;
            config = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path,
                message: e.to_string(),
            })?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut PathBuf); 6] = [
            ("CAPSTAN_PCAP_DIR", &mut self.paths.pcap_dir),
            ("CAPSTAN_INDEX_DIR", &mut self.paths.index_dir),
            ("CAPSTAN_SNAPSHOT_DIR", &mut self.paths.snapshot_dir),
            ("CAPSTAN_STATE_DIR", &mut self.paths.state_dir),
            ("CAPSTAN_CONVERTER_DIR", &mut self.paths.converter_dir),
            ("CAPSTAN_FILTER_DIR", &mut self.paths.filter_dir),
        ];
        for (key, target) in overrides {
            if let Ok(value) = env::var(key) {
                *target = PathBuf::from(value);
            }
        }
        if let Ok(value) = env::var("CAPSTAN_LOG_LEVEL") {
            self.telemetry.log_level = value;
        }
    }
}

/// Creates `path` if missing and verifies the process can list, create and
/// remove entries in it.
pub fn assert_dir_rwx(label: &str, path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("{label}: failed to create {}", path.display()))?;
    fs::read_dir(path).with_context(|| format!("{label}: {} is not readable", path.display()))?;
    let probe = path.join(".capstan-probe");
    let mut f = fs::File::create(&probe)
        .with_context(|| format!("{label}: {} is not writable", path.display()))?;
    f.write_all(b"probe")
        .with_context(|| format!("{label}: {} is not writable", path.display()))?;
    drop(f);
    fs::remove_file(&probe)
        .with_context(|| format!("{label}: cannot remove entries in {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = CapstanConfig::default();
        assert_eq!(config.limits.filter_queue_depth, 100);
        assert!(config.filters.is_empty());
        assert_eq!(config.paths.pcap_dir, PathBuf::from("data/pcaps"));
    }

    #[test]
    fn loads_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capstan.toml");
        fs::write(
            &path,
            r#"
[paths]
pcap_dir = "/srv/pcaps"
index_dir = "/srv/indexes"
snapshot_dir = "/srv/snapshots"
state_dir = "/srv/state"
converter_dir = "/srv/converters"
filter_dir = "/srv/filters"

[limits]
converter_processes = 4
filter_queue_depth = 20
converter_stderr_lines = 64

[filters]
strip_tls = "/usr/local/bin/strip_tls"
"#,
        )
        .unwrap();

        let config = CapstanConfig::load(Some(&path)).unwrap();
        assert_eq!(config.paths.pcap_dir, PathBuf::from("/srv/pcaps"));
        assert_eq!(config.limits.converter_processes, 4);
        assert_eq!(
            config.filters.get("strip_tls"),
            Some(&PathBuf::from("/usr/local/bin/strip_tls"))
        );
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capstan.toml");
        fs::write(&path, "paths = 3").unwrap();
        assert!(matches!(
            CapstanConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn assert_dir_rwx_creates_and_probes() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("deep/nested");
        assert_dir_rwx("test_dir", &target).unwrap();
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }
}
