//! Memory manager configuration
//!
//! Sources are layered: defaults, then an optional TOML file or string, then
//! `MIRROR_*` environment overrides. The debug address shift is enabled by the
//! mere presence of `MIRROR_XS`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::AddressShift;
use crate::device::host::DEFAULT_ALIGNMENT;
use crate::logging::LogConfig;

/// Environment variable prefix used by [`ConfigLoader::from_env`]
pub const ENV_PREFIX: &str = "MIRROR";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Which runtime backs device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Separate host heap standing in for device memory
    #[default]
    Host,
    /// NVIDIA CUDA (requires the `cuda` feature)
    Cuda,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "cuda" => Ok(Self::Cuda),
            _ => Err(ConfigError::EnvVar(format!("Invalid backend: {s}"))),
        }
    }
}

/// Stream used for asynchronous copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// The context's default stream
    #[default]
    Default,
    /// A stream created for the manager
    Dedicated,
}

impl FromStr for StreamKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "dedicated" => Ok(Self::Dedicated),
            _ => Err(ConfigError::EnvVar(format!("Invalid stream: {s}"))),
        }
    }
}

/// What the manager does when it detects an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the error to the caller
    #[default]
    Propagate,
    /// Panic with the error message
    Panic,
    /// Log and abort the process immediately (strict mode)
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "propagate" => Ok(Self::Propagate),
            "panic" => Ok(Self::Panic),
            "abort" | "strict" => Ok(Self::Abort),
            _ => Err(ConfigError::EnvVar(format!("Invalid failure policy: {s}"))),
        }
    }
}

/// Memory manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Mirror arrays into device memory on resolve
    pub accelerator: bool,

    /// Device runtime
    pub backend: BackendKind,

    /// Device ordinal
    pub device_id: usize,

    /// Copy stream
    pub stream: StreamKind,

    /// Offset every registered address by the debug shift
    pub address_shift: bool,

    /// Error handling
    pub failure_policy: FailurePolicy,

    /// Device allocation alignment (bytes, power of two)
    pub device_alignment: usize,

    /// Logging
    pub log: LogConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            accelerator: false,
            backend: BackendKind::Host,
            device_id: 0,
            stream: StreamKind::Default,
            address_shift: false,
            failure_policy: FailurePolicy::Propagate,
            device_alignment: DEFAULT_ALIGNMENT,
            log: LogConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Configuration with the accelerator enabled on the host backend
    pub fn accelerated() -> Self {
        Self {
            accelerator: true,
            ..Self::default()
        }
    }

    /// Set the accelerator flag
    #[must_use]
    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.accelerator = enabled;
        self
    }

    /// Enable or disable the debug address shift
    #[must_use]
    pub fn with_address_shift(mut self, enabled: bool) -> Self {
        self.address_shift = enabled;
        self
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Address shift derived from the flag
    pub fn shift(&self) -> AddressShift {
        AddressShift::from_flag(self.address_shift)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.device_alignment.is_power_of_two() {
            return Err(ConfigError::Validation(format!(
                "device_alignment must be a non-zero power of two, got {}",
                self.device_alignment
            )));
        }
        Ok(())
    }
}

/// Configuration source
#[derive(Debug, Clone)]
enum ConfigSource {
    File(PathBuf),
    Memory(String),
    Env,
}

/// Layered configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a loader starting from defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader reading only the `MIRROR_*` environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::new().with_env_prefix(ENV_PREFIX)
    }

    /// Add a TOML file source
    #[must_use]
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources.push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    #[must_use]
    pub fn with_toml(mut self, content: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(content.into()));
        self
    }

    /// Add environment overrides with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load from the process environment
    pub fn load(&self) -> Result<MirrorConfig> {
        self.load_with(|key| std::env::var_os(key).map(|v| v.to_string_lossy().into_owned()))
    }

    /// Load, reading environment variables through `lookup`
    pub fn load_with<F>(&self, lookup: F) -> Result<MirrorConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = MirrorConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix, &lookup)?;
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn parse(toml: &str) -> Result<MirrorConfig> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides<F>(mut config: MirrorConfig, prefix: &str, lookup: &F) -> Result<MirrorConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(&format!("{prefix}_ACCELERATOR")) {
            config.accelerator = parse_flag(&val)
                .ok_or_else(|| ConfigError::EnvVar(format!("Invalid accelerator value: {val}")))?;
        }
        if let Some(val) = lookup(&format!("{prefix}_BACKEND")) {
            config.backend = val.parse()?;
        }
        if let Some(val) = lookup(&format!("{prefix}_DEVICE_ID")) {
            config.device_id = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid device_id value: {val}")))?;
        }
        if let Some(val) = lookup(&format!("{prefix}_STREAM")) {
            config.stream = val.parse()?;
        }
        if let Some(val) = lookup(&format!("{prefix}_FAILURE_POLICY")) {
            config.failure_policy = val.parse()?;
        }
        if let Some(val) = lookup(&format!("{prefix}_DEVICE_ALIGNMENT")) {
            config.device_alignment = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid device_alignment value: {val}")))?;
        }
        // Presence alone enables the shift
        if lookup(&format!("{prefix}_XS")).is_some() {
            config.address_shift = true;
        }
        Ok(config)
    }
}

fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = MirrorConfig::default();
        assert!(!config.accelerator);
        assert!(!config.address_shift);
        assert_eq!(config.failure_policy, FailurePolicy::Propagate);
        assert_eq!(config.device_alignment, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigLoader::from_env()
            .load_with(env(&[
                ("MIRROR_ACCELERATOR", "true"),
                ("MIRROR_DEVICE_ID", "2"),
                ("MIRROR_STREAM", "dedicated"),
                ("MIRROR_FAILURE_POLICY", "strict"),
            ]))
            .unwrap();
        assert!(config.accelerator);
        assert_eq!(config.device_id, 2);
        assert_eq!(config.stream, StreamKind::Dedicated);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert!(!config.address_shift);
    }

    #[test]
    fn test_xs_presence_enables_shift() {
        let config = ConfigLoader::from_env().load_with(env(&[("MIRROR_XS", "")])).unwrap();
        assert!(config.address_shift);
        assert!(config.shift().is_enabled());

        let config = ConfigLoader::from_env().load_with(env(&[("MIRROR_XS", "0")])).unwrap();
        assert!(config.address_shift);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = ConfigLoader::from_env()
            .load_with(env(&[("MIRROR_ACCELERATOR", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar(_)));

        let err = ConfigLoader::from_env()
            .load_with(env(&[("MIRROR_BACKEND", "opencl")]))
            .unwrap_err();
        assert!(err.to_string().contains("opencl"));
    }

    #[test]
    fn test_toml_source_with_env_on_top() {
        let config = ConfigLoader::new()
            .with_toml("accelerator = true\nfailure_policy = \"panic\"\n")
            .with_env_prefix("TEST")
            .load_with(env(&[("TEST_ACCELERATOR", "0")]))
            .unwrap();
        assert!(!config.accelerator);
        assert_eq!(config.failure_policy, FailurePolicy::Panic);
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend = \"cuda\"\ndevice_id = 1\naddress_shift = true").unwrap();

        let config = ConfigLoader::new().with_file(file.path()).load_with(|_| None).unwrap();
        assert_eq!(config.backend, BackendKind::Cuda);
        assert_eq!(config.device_id, 1);
        assert!(config.address_shift);
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/warp-mirror.toml")
            .load_with(|_| None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validation_rejects_bad_alignment() {
        let err = ConfigLoader::new()
            .with_toml("device_alignment = 48")
            .load_with(|_| None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(ConfigLoader::parse("accelerator = ["), Err(ConfigError::Parse(_))));
    }
}
