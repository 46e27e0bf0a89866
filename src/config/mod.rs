//! Node configuration.
//!
//! `NodeSettings` is the typed, validated, immutable configuration a
//! node is constructed with. A YAML overlay (`Config`) loaded from the
//! standard search paths may override named settings at startup:
//!
//! 1. `/etc/diapeer/diapeer.yaml` (lowest priority)
//! 2. `~/.config/diapeer/diapeer.yaml`
//! 3. `./diapeer.yaml` (highest priority)
//!
//! Values from higher priority files override those from lower priority
//! files; the overlay is applied once, before `Node::start`.

use crate::capabilities::Capability;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "diapeer.yaml";

/// Default watchdog interval (RFC 3539 recommends 30 seconds).
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Default idle timeout before the node disconnects a silent peer.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Errors from building or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("host id must be a non-empty diameter identity")]
    EmptyHostId,

    #[error("realm must be non-empty")]
    EmptyRealm,

    #[error("watchdog interval must be at least 6 seconds (RFC 3539)")]
    WatchdogTooShort,

    #[error("port range start exceeds end")]
    BadPortRange,

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Whether a transport protocol must, may, or must not be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    /// Failure to initialize the driver is fatal on start.
    Required,
    /// The driver is never loaded.
    Disabled,
    /// The driver is tried; failure is logged and skipped.
    #[default]
    Optional,
}

/// Which PRNG feeds the watchdog jitter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPrng {
    /// Cryptographically seeded (RFC 3539 -> RFC 1750 compliant).
    #[default]
    Secure,
    /// Non-cryptographic fallback for entropy-starved hosts. Using this
    /// deviates from RFC 3539.
    Bogus,
}

/// Immutable node settings.
///
/// Built once, validated, then handed to `Node::new`. Nothing here
/// changes after the node starts.
#[derive(Clone, Debug)]
pub struct NodeSettings {
    host_id: String,
    realm: String,
    port: u16,
    vendor_id: u32,
    product_name: String,
    firmware_revision: u32,
    watchdog_interval: Duration,
    idle_timeout: Duration,
    capabilities: Capability,
    use_tcp: TransportPolicy,
    use_sctp: TransportPolicy,
    port_range: Option<RangeInclusive<u16>>,
    jitter_prng: JitterPrng,
}

impl NodeSettings {
    /// Create settings for a node.
    ///
    /// `port` is the listen port for inbound connections; 0 means the
    /// node accepts no inbound connections (client-only).
    pub fn new(
        host_id: &str,
        realm: &str,
        port: u16,
        vendor_id: u32,
        product_name: &str,
        capabilities: Capability,
    ) -> Result<Self, ConfigError> {
        if host_id.is_empty() {
            return Err(ConfigError::EmptyHostId);
        }
        if realm.is_empty() {
            return Err(ConfigError::EmptyRealm);
        }
        Ok(Self {
            host_id: host_id.to_string(),
            realm: realm.to_string(),
            port,
            vendor_id,
            product_name: product_name.to_string(),
            firmware_revision: 0,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            capabilities,
            use_tcp: TransportPolicy::Required,
            use_sctp: TransportPolicy::Optional,
            port_range: None,
            jitter_prng: JitterPrng::Secure,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn firmware_revision(&self) -> u32 {
        self.firmware_revision
    }

    pub fn watchdog_interval(&self) -> Duration {
        self.watchdog_interval
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn capabilities(&self) -> &Capability {
        &self.capabilities
    }

    pub fn use_tcp(&self) -> TransportPolicy {
        self.use_tcp
    }

    pub fn use_sctp(&self) -> TransportPolicy {
        self.use_sctp
    }

    pub fn port_range(&self) -> Option<&RangeInclusive<u16>> {
        self.port_range.as_ref()
    }

    pub fn jitter_prng(&self) -> JitterPrng {
        self.jitter_prng
    }

    pub fn set_firmware_revision(&mut self, revision: u32) {
        self.firmware_revision = revision;
    }

    pub fn set_watchdog_interval(&mut self, interval: Duration) -> Result<(), ConfigError> {
        if interval < Duration::from_secs(6) {
            return Err(ConfigError::WatchdogTooShort);
        }
        self.watchdog_interval = interval;
        Ok(())
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    pub fn set_use_tcp(&mut self, policy: TransportPolicy) {
        self.use_tcp = policy;
    }

    pub fn set_use_sctp(&mut self, policy: TransportPolicy) {
        self.use_sctp = policy;
    }

    /// Restrict outbound TCP sockets to source ports in the range.
    pub fn set_port_range(&mut self, range: RangeInclusive<u16>) -> Result<(), ConfigError> {
        if range.start() > range.end() {
            return Err(ConfigError::BadPortRange);
        }
        self.port_range = Some(range);
        Ok(())
    }

    pub fn set_jitter_prng(&mut self, prng: JitterPrng) {
        self.jitter_prng = prng;
    }

    /// Apply a loaded overlay. Only the settings named in the overlay
    /// change; everything else keeps its constructed value.
    pub fn apply_overlay(&mut self, overlay: &Config) -> Result<(), ConfigError> {
        if let Some(policy) = overlay.node.use_tcp {
            self.use_tcp = policy;
        }
        if let Some(policy) = overlay.node.use_sctp {
            self.use_sctp = policy;
        }
        if let Some(prng) = overlay.node.jitter_prng {
            self.jitter_prng = prng;
        }
        if let Some(ms) = overlay.node.watchdog_interval_ms {
            self.set_watchdog_interval(Duration::from_millis(ms))?;
        }
        if let Some(ms) = overlay.node.idle_timeout_ms {
            self.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(revision) = overlay.node.firmware_revision {
            self.firmware_revision = revision;
        }
        if let (Some(start), Some(end)) = (overlay.node.port_range_start, overlay.node.port_range_end) {
            self.set_port_range(start..=end)?;
        }
        Ok(())
    }
}

/// Overridable settings (`node.*` in the YAML overlay).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_tcp: Option<TransportPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_sctp: Option<TransportPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_prng: Option<JitterPrng>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_revision: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_start: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_end: Option<u16>,
}

/// Root of the YAML overlay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeOverlay,
}

impl Config {
    /// Load the overlay from the standard search paths, later paths
    /// overriding earlier ones. Returns the merged overlay and the list
    /// of paths actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load and merge the overlay from explicit paths.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded = Vec::new();
        for path in paths {
            if path.exists() {
                config.merge(Self::load_file(path)?);
                loaded.push(path.clone());
            }
        }
        Ok((config, loaded))
    }

    /// Load a single overlay file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Standard search paths, lowest priority first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/diapeer").join(CONFIG_FILENAME)];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".config/diapeer").join(CONFIG_FILENAME));
        }
        paths.push(PathBuf::from(CONFIG_FILENAME));
        paths
    }

    fn merge(&mut self, other: Config) {
        let o = other.node;
        let n = &mut self.node;
        n.use_tcp = o.use_tcp.or(n.use_tcp);
        n.use_sctp = o.use_sctp.or(n.use_sctp);
        n.jitter_prng = o.jitter_prng.or(n.jitter_prng);
        n.watchdog_interval_ms = o.watchdog_interval_ms.or(n.watchdog_interval_ms);
        n.idle_timeout_ms = o.idle_timeout_ms.or(n.idle_timeout_ms);
        n.firmware_revision = o.firmware_revision.or(n.firmware_revision);
        n.port_range_start = o.port_range_start.or(n.port_range_start);
        n.port_range_end = o.port_range_end.or(n.port_range_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NodeSettings {
        NodeSettings::new("a.example", "example", 3868, 0, "test", Capability::new()).unwrap()
    }

    #[test]
    fn defaults() {
        let s = settings();
        assert_eq!(s.use_tcp(), TransportPolicy::Required);
        assert_eq!(s.use_sctp(), TransportPolicy::Optional);
        assert_eq!(s.jitter_prng(), JitterPrng::Secure);
        assert_eq!(s.watchdog_interval(), DEFAULT_WATCHDOG_INTERVAL);
        assert_eq!(s.firmware_revision(), 0);
    }

    #[test]
    fn rejects_empty_identity() {
        assert!(matches!(
            NodeSettings::new("", "example", 0, 0, "t", Capability::new()),
            Err(ConfigError::EmptyHostId)
        ));
        assert!(matches!(
            NodeSettings::new("a.example", "", 0, 0, "t", Capability::new()),
            Err(ConfigError::EmptyRealm)
        ));
    }

    #[test]
    fn rejects_short_watchdog() {
        let mut s = settings();
        assert!(s.set_watchdog_interval(Duration::from_secs(5)).is_err());
        assert!(s.set_watchdog_interval(Duration::from_secs(6)).is_ok());
    }

    #[test]
    fn overlay_overrides_named_settings_only() {
        let mut s = settings();
        let yaml = "node:\n  use_sctp: disabled\n  jitter_prng: bogus\n  watchdog_interval_ms: 12000\n";
        let overlay: Config = serde_yaml::from_str(yaml).unwrap();
        s.apply_overlay(&overlay).unwrap();
        assert_eq!(s.use_sctp(), TransportPolicy::Disabled);
        assert_eq!(s.use_tcp(), TransportPolicy::Required);
        assert_eq!(s.jitter_prng(), JitterPrng::Bogus);
        assert_eq!(s.watchdog_interval(), Duration::from_millis(12000));
        assert_eq!(s.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn merge_prefers_later_files() {
        let mut base: Config =
            serde_yaml::from_str("node:\n  use_tcp: optional\n  firmware_revision: 1\n").unwrap();
        let over: Config = serde_yaml::from_str("node:\n  firmware_revision: 2\n").unwrap();
        base.merge(over);
        assert_eq!(base.node.firmware_revision, Some(2));
        assert_eq!(base.node.use_tcp, Some(TransportPolicy::Optional));
    }

    #[test]
    fn port_range_validation() {
        let mut s = settings();
        assert!(s.set_port_range(5000..=4000).is_err());
        assert!(s.set_port_range(5000..=5100).is_ok());
        assert_eq!(s.port_range(), Some(&(5000..=5100)));
    }
}
