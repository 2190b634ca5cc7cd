use crate::error::{EngineError, EngineResult, ErrorKind};
use quartz::time::NANOS_PER_MSEC;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Which packets a listening socket accepts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerRole {
    Auth,
    Acct,
    Proxy,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ListenerConfig {
    pub address: String,
    pub role: ListenerRole,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClientConfig {
    pub address: String,
    pub secret: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HomeServerConfig {
    pub address: String,
    pub secret: String,
}

/// The recognized engine options plus deployment shape. Durations are in milliseconds in the
/// file; accessors convert to the engine's nanosecond scale.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EngineConfig {
    pub max_requests: usize,
    pub max_request_time_ms: u64,
    pub cleanup_delay_ms: u64,
    pub reject_delay_ms: u64,
    pub proxy_retry_delay_ms: u64,
    pub proxy_retry_count: u32,
    pub proxy_dead_time_ms: u64,
    pub status_server: bool,
    pub allow_core_dumps: bool,
    pub wake_all_if_all_dead: bool,
    pub proxy_synchronous: bool,

    pub workers: usize,
    pub message_set_size: usize,
    pub ring_buffer_size: usize,

    pub listeners: Vec<ListenerConfig>,
    pub clients: Vec<ClientConfig>,
    pub home_servers: Vec<HomeServerConfig>,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            max_requests: 16384,
            max_request_time_ms: 30_000,
            cleanup_delay_ms: 5_000,
            reject_delay_ms: 1_000,
            proxy_retry_delay_ms: 5_000,
            proxy_retry_count: 3,
            proxy_dead_time_ms: 60_000,
            status_server: true,
            allow_core_dumps: false,
            wake_all_if_all_dead: false,
            proxy_synchronous: false,
            workers: 4,
            message_set_size: 1024,
            ring_buffer_size: 1 << 16,
            listeners: Vec::new(),
            clients: Vec::new(),
            home_servers: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<EngineConfig> {
        let config: EngineConfig =
            serdeconv::from_toml_file(path).map_err(|_| EngineError::Fatal(ErrorKind::Config))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.workers == 0
            || self.max_requests == 0
            || self.max_request_time_ms == 0
            || !self.message_set_size.is_power_of_two()
            || !self.ring_buffer_size.is_power_of_two()
        {
            return Err(EngineError::Fatal(ErrorKind::Config));
        }

        Ok(())
    }

    #[inline]
    pub fn max_request_time(&self) -> u64 {
        self.max_request_time_ms * NANOS_PER_MSEC
    }

    #[inline]
    pub fn cleanup_delay(&self) -> u64 {
        self.cleanup_delay_ms * NANOS_PER_MSEC
    }

    #[inline]
    pub fn reject_delay(&self) -> u64 {
        self.reject_delay_ms * NANOS_PER_MSEC
    }

    #[inline]
    pub fn proxy_retry_delay(&self) -> u64 {
        self.proxy_retry_delay_ms * NANOS_PER_MSEC
    }

    #[inline]
    pub fn proxy_dead_time(&self) -> u64 {
        self.proxy_dead_time_ms * NANOS_PER_MSEC
    }
}

/// A numbered configuration snapshot, optionally carrying a freshly compiled policy set.
/// Reload builds a new version and swaps it through the control plane; requests keep a
/// reference to the version they started under, so draining the old version needs no locks.
pub struct ConfigVersion {
    pub version: u64,
    pub config: EngineConfig,
    pub policies: Option<Arc<crate::policy::PolicySet>>,
}

impl ConfigVersion {
    pub fn new(version: u64, config: EngineConfig) -> Arc<ConfigVersion> {
        Arc::new(ConfigVersion {
            version,
            config,
            policies: None,
        })
    }

    pub fn with_policies(
        version: u64,
        config: EngineConfig,
        policies: Arc<crate::policy::PolicySet>,
    ) -> Arc<ConfigVersion> {
        Arc::new(ConfigVersion {
            version,
            config,
            policies: Some(policies),
        })
    }

    /// Packs a version for transport inside a `ConfigSwap` control frame.
    pub fn into_frame(version: Arc<ConfigVersion>) -> u64 {
        Arc::into_raw(version) as u64
    }

    /// Reconstitutes a version from a `ConfigSwap` frame. Must be called exactly once per
    /// frame; the value was produced by [`ConfigVersion::into_frame`].
    pub unsafe fn from_frame(raw: u64) -> Arc<ConfigVersion> {
        Arc::from_raw(raw as *const ConfigVersion)
    }
}
