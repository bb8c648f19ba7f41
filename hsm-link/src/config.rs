//! Configuration management for hsm-link.
//!
//! Configuration comes from an optional JSON file named by `HSM_CONFIG`,
//! with individual environment variables layered on top. Line settings and
//! frame sizes are fixed by the device and live in [`crate::protocol`]
//! instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "HSM_CONFIG";

/// Environment override for [`HsmConfig::exchange_timeout_ms`].
pub const EXCHANGE_TIMEOUT_ENV: &str = "HSM_EXCHANGE_TIMEOUT_MS";

/// Environment override for [`HsmConfig::probe_timeout_ms`].
pub const PROBE_TIMEOUT_ENV: &str = "HSM_PROBE_TIMEOUT_MS";

/// Environment override for [`HsmConfig::port`].
pub const PORT_ENV: &str = "HSM_PORT";

/// USB vendor and product IDs identifying an HSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

impl FromStr for UsbId {
    type Err = Error;

    /// Parse `vvvv:pppp` (hex).
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Config(format!("invalid USB id '{}', expected vvvv:pppp", s));
        let (vid, pid) = s.split_once(':').ok_or_else(bad)?;
        Ok(Self {
            vid: u16::from_str_radix(vid, 16).map_err(|_| bad())?,
            pid: u16::from_str_radix(pid, 16).map_err(|_| bad())?,
        })
    }
}

// Serialized as the "vvvv:pppp" string form so config files stay readable.
impl Serialize for UsbId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UsbId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HsmConfig {
    /// Overall deadline for one exchange, from open to last byte
    pub exchange_timeout_ms: u64,

    /// Deadline for probing a single port during discovery
    pub probe_timeout_ms: u64,

    /// USB VID:PID pairs accepted as an HSM; empty accepts any USB port
    pub usb_ids: Vec<UsbId>,

    /// Only probe ports whose name matches this regex
    pub port_pattern: Option<String>,

    /// Open the port during probing to check it is usable
    pub open_check: bool,

    /// Use this port and skip discovery entirely
    pub port: Option<String>,

    /// Keep the discovered port for later operations
    pub cache_transport: bool,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_ms: 3000,
            probe_timeout_ms: 2000,
            usb_ids: Vec::new(),
            port_pattern: None,
            open_check: true,
            port: None,
            cache_transport: false,
        }
    }
}

impl HsmConfig {
    /// Load configuration from `HSM_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_u64(EXCHANGE_TIMEOUT_ENV)? {
            self.exchange_timeout_ms = ms;
        }
        if let Some(ms) = env_u64(PROBE_TIMEOUT_ENV)? {
            self.probe_timeout_ms = ms;
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            if !port.is_empty() {
                self.port = Some(port);
            }
        }
        Ok(())
    }

    /// Check values that would otherwise fail late.
    pub fn validate(&self) -> Result<()> {
        if self.exchange_timeout_ms == 0 {
            return Err(Error::Config("exchange_timeout_ms must be non-zero".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::Config("probe_timeout_ms must be non-zero".into()));
        }
        self.port_regex()?;
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Compiled `port_pattern`, if any.
    pub fn port_regex(&self) -> Result<Option<regex::Regex>> {
        self.port_pattern
            .as_deref()
            .map(|p| {
                regex::Regex::new(p)
                    .map_err(|e| Error::Config(format!("invalid port_pattern '{}': {}", p, e)))
            })
            .transpose()
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be an integer, got '{}'", name, s))),
        Err(_) => Ok(None),
    }
}
