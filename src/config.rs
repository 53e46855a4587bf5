use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pattern::Pattern;
use crate::protocol::Transport;
use crate::session::ServiceId;
use crate::session::pipeline::Timeouts;

/// Runtime configuration, read from a TOML file.
///
/// ```toml
/// local_ip = "10.60.1.2"
/// decrypt_tls = true
/// keys_dir = "/etc/packwatch/keys"
///
/// [[services]]
/// id = 1
/// name = "shop"
/// port = 443
///
/// [[patterns]]
/// id = 1
/// name = "flag"
/// value = "[A-Z0-9]{31}="
/// kind = "regex"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the monitored host; decides packet direction.
    pub local_ip: IpAddr,
    /// Capture interface when no pcap file is given.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub ignore_empty_packets: bool,
    #[serde(default = "default_true")]
    pub decrypt_tls: bool,
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Directory of PEM RSA private keys for TLS decryption.
    #[serde(default)]
    pub keys_dir: Option<PathBuf>,
    /// JSON-lines file receiving every stored session.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub id: ServiceId,
    #[serde(default)]
    pub name: String,
    pub port: u16,
    /// Restrict the service to one transport; both when absent.
    #[serde(default)]
    pub protocol: Option<Transport>,
}

fn default_true() -> bool {
    true
}

fn default_tcp_timeout() -> u64 {
    600
}

fn default_udp_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_max_sessions() -> usize {
    10_000
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

    pub fn from_file(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .context(format!("Failed to stat config: {}", path.display()))?;
        if meta.len() > Self::MAX_CONFIG_SIZE {
            anyhow::bail!(
                "Config file too large ({} bytes, max {}): {}",
                meta.len(),
                Self::MAX_CONFIG_SIZE,
                path.display()
            );
        }
        let text = std::fs::read_to_string(path)
            .context(format!("Failed to read config: {}", path.display()))?;
        Self::parse(&text).context(format!("Invalid config: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for service in &self.services {
            if !ids.insert(service.id) {
                anyhow::bail!("Duplicate service id {}", service.id.0);
            }
            if let Some(t) = service.protocol {
                if !t.is_session_transport() {
                    anyhow::bail!("Service {} must use tcp or udp, not {}", service.id.0, t);
                }
            }
        }

        let mut ids = HashSet::new();
        for pattern in &self.patterns {
            if !ids.insert(pattern.id) {
                anyhow::bail!("Duplicate pattern id {}", pattern.id);
            }
            pattern.validate()?;
        }

        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            tcp: Duration::from_secs(self.tcp_timeout_secs),
            udp: Duration::from_secs(self.udp_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{PatternId, SearchKind};

    const FULL: &str = r#"
local_ip = "10.60.1.2"
interface = "eth0"
ignore_empty_packets = true
decrypt_tls = false
tcp_timeout_secs = 120
keys_dir = "/etc/packwatch/keys"
output = "sessions.jsonl"

[[services]]
id = 1
name = "shop"
port = 443
protocol = "tcp"

[[services]]
id = 2
port = 53

[[patterns]]
id = 1
name = "flag"
value = "[A-Z0-9]{31}="
kind = "regex"

[[patterns]]
id = 2
value = "de ad be ef"
kind = "subbytes"
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.local_ip, "10.60.1.2".parse::<IpAddr>().unwrap());
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert!(config.ignore_empty_packets);
        assert!(!config.decrypt_tls);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].protocol, Some(Transport::Tcp));
        assert_eq!(config.services[1].protocol, None);
        assert_eq!(config.patterns[1].id, PatternId(2));
        assert_eq!(config.patterns[1].kind, SearchKind::Subbytes);

        let t = config.timeouts();
        assert_eq!(t.tcp, Duration::from_secs(120));
        assert_eq!(t.udp, Duration::from_secs(60));
    }

    #[test]
    fn defaults_apply() {
        let config = Config::parse("local_ip = \"::1\"").unwrap();
        assert!(config.decrypt_tls);
        assert!(!config.ignore_empty_packets);
        assert_eq!(config.tcp_timeout_secs, 600);
        assert_eq!(config.sweep_interval_secs, 10);
        assert_eq!(config.max_sessions, 10_000);
        assert!(config.services.is_empty());
        assert!(config.keys_dir.is_none());
    }

    #[test]
    fn rejects_invalid_pattern() {
        let text = r#"
local_ip = "10.0.0.1"
[[patterns]]
id = 1
value = "(unclosed"
kind = "regex"
"#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn rejects_duplicate_service_ids() {
        let text = r#"
local_ip = "10.0.0.1"
[[services]]
id = 1
port = 80
[[services]]
id = 1
port = 81
"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("Duplicate service id"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::parse("local_ip = \"10.0.0.1\"\nlocal_port = 3").is_err());
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packwatch.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.output, Some(PathBuf::from("sessions.jsonl")));

        let missing = Config::from_file(&dir.path().join("nope.toml"));
        assert!(missing.is_err());
    }
}
