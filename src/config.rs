use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{AdaptorKind, EncodingFamily, Resolution, SourceKind};

/// Top-level configuration for both daemons and the worker processes.
///
/// A single file is shared by producerd and consumerd: each only reads the
/// sections relevant to its role, so an operator can keep one config per
/// host instead of two that must stay in sync.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub camera: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Overrides `$HOME`/`$USERPROFILE` resolution for the socket and shm
    /// namespace; mainly useful for running multiple instances in tests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_producer_sock")]
    pub producer_sock: String,

    #[serde(default = "default_consumer_sock")]
    pub consumer_sock: String,

    #[serde(default = "default_shm_prefix")]
    pub shm_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            dir: None,
            producer_sock: default_producer_sock(),
            consumer_sock: default_consumer_sock(),
            shm_prefix: default_shm_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: default_log_filter(),
        }
    }
}

/// One capture-device definition; `add_target` is what actually builds the
/// source branch, this just describes what producerd is allowed to build.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    pub node_id: u32,

    #[serde(default)]
    pub source_kind: SourceKind,

    pub device: String,

    #[serde(default)]
    pub encoding_family: EncodingFamily,

    #[serde(default = "default_resolution")]
    pub resolution: Resolution,

    #[serde(default = "default_fps")]
    pub framerate: i32,

    #[serde(default)]
    pub show_overlay: bool,

    #[serde(default)]
    pub adaptor_kind: AdaptorKind,
}

fn default_producer_sock() -> String {
    "streamgraph-producerd.sock".to_string()
}

fn default_consumer_sock() -> String {
    "streamgraph-consumerd.sock".to_string()
}

fn default_shm_prefix() -> String {
    "streamgraph".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_resolution() -> Resolution {
    Resolution::HD
}

fn default_fps() -> i32 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).context("failed to read config file")?;

        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Create default configuration: one test-pattern camera at node 1, no
    /// recording or live targets configured — those are added at runtime by
    /// consumerd requests.
    pub fn default() -> Self {
        Config {
            runtime: RuntimeConfig::default(),
            log: LogConfig::default(),
            camera: vec![CameraConfig {
                node_id: 1,
                source_kind: SourceKind::TestPattern,
                device: String::new(),
                encoding_family: EncodingFamily::General,
                resolution: default_resolution(),
                framerate: default_fps(),
                show_overlay: false,
                adaptor_kind: AdaptorKind::Null,
            }],
        }
    }

    pub fn camera(&self, node_id: u32) -> Option<&CameraConfig> {
        self.camera.iter().find(|c| c.node_id == node_id)
    }

    /// Resolve the runtime directory the way the original daemons did:
    /// `$HOME`, falling back to `$USERPROFILE` on platforms that set it
    /// instead, overridable by `runtime.dir` for test isolation.
    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.runtime.dir {
            return dir.clone();
        }
        env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    pub fn producer_sock_path(&self) -> PathBuf {
        self.runtime_dir().join(&self.runtime.producer_sock)
    }

    pub fn consumer_sock_path(&self) -> PathBuf {
        self.runtime_dir().join(&self.runtime.consumer_sock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.camera.len(), 1);
        assert_eq!(config.camera[0].node_id, 1);
        assert_eq!(config.runtime.shm_prefix, "streamgraph");
    }

    #[test]
    fn test_runtime_dir_override() {
        let mut config = Config::default();
        config.runtime.dir = Some(PathBuf::from("/tmp/streamgraph-test"));
        assert_eq!(config.runtime_dir(), PathBuf::from("/tmp/streamgraph-test"));
    }

    #[test]
    fn test_camera_lookup() {
        let config = Config::default();
        assert!(config.camera(1).is_some());
        assert!(config.camera(99).is_none());
    }
}
