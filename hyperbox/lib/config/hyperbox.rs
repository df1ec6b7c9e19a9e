//! Controller-wide configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::HyperboxResult;

use super::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_HYPERBOX_HOME, DEFAULT_MAX_NICS, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_RESPONSE_TIMEOUT_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings shared by every sandbox a controller manages.
///
/// All fields are optional in the TOML form:
///
/// ```toml
/// base_dir = "/var/run/hyper"
/// ping_interval_ms = 30000
/// response_timeout_ms = 60000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HyperboxConfig {
    /// The directory under which sandbox home directories are created.
    #[serde(default = "default_base_dir")]
    #[builder(default = default_base_dir(), setter(into))]
    base_dir: PathBuf,

    /// How long the guest agent may stay idle before it is probed.
    #[serde(default = "default_ping_interval_ms")]
    #[builder(default = DEFAULT_PING_INTERVAL_MS)]
    ping_interval_ms: u64,

    /// How long to wait for a connection or a probe reply.
    #[serde(default = "default_response_timeout_ms")]
    #[builder(default = DEFAULT_RESPONSE_TIMEOUT_MS)]
    response_timeout_ms: u64,

    /// How long a sandbox may take to shut down before it is powered off.
    #[serde(default = "default_shutdown_timeout_ms")]
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    shutdown_timeout_ms: u64,

    /// The capacity of event channels and response subscriber buffers.
    #[serde(default = "default_channel_capacity")]
    #[builder(default = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// The number of network interface slots per sandbox.
    #[serde(default = "default_max_nics")]
    #[builder(default = DEFAULT_MAX_NICS)]
    max_nics: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HyperboxConfig {
    /// Loads the configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> HyperboxResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Returns the home directory of the sandbox with the given id.
    pub fn sandbox_home(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Returns the keep-alive probe interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Returns the connection and probe reply timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Returns the shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for HyperboxConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_base_dir() -> PathBuf {
    DEFAULT_HYPERBOX_HOME.clone()
}

fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_max_nics() -> usize {
    DEFAULT_MAX_NICS
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_load_fills_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hyperbox.toml");
        tokio::fs::write(&path, "base_dir = \"/tmp/hyper\"\nping_interval_ms = 500\n").await?;

        let config = HyperboxConfig::load(&path).await?;
        assert_eq!(config.get_base_dir(), &PathBuf::from("/tmp/hyper"));
        assert_eq!(config.ping_interval(), Duration::from_millis(500));
        assert_eq!(
            config.response_timeout(),
            Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS)
        );
        assert_eq!(*config.get_max_nics(), DEFAULT_MAX_NICS);
        assert_eq!(
            config.sandbox_home("vm-1"),
            PathBuf::from("/tmp/hyper/vm-1")
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_config_load_rejects_bad_toml() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hyperbox.toml");
        tokio::fs::write(&path, "ping_interval_ms = \"soon\"").await?;

        let result = HyperboxConfig::load(&path).await;
        assert!(matches!(result, Err(crate::HyperboxError::ConfigParse(_))));

        Ok(())
    }
}
