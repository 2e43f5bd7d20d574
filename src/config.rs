use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::RetryPolicy;
use crate::filter::FlowFilter;

/// Top-level configuration for the accounting agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Length of one output interval. Whole seconds, at least 2s.
    /// Default: 15s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Sample open connections at each boundary and emit them as an extra
    /// column.
    #[serde(default)]
    pub track_open_connections: bool,

    /// Which flows take part in accounting.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Address masks applied when building aggregation keys.
    #[serde(default)]
    pub grouping: GroupingConfig,

    /// Port-interest file configuration.
    #[serde(default)]
    pub ports: PortsConfig,

    /// Output targets.
    #[serde(default)]
    pub output: OutputConfig,

    /// conntrack-tools settings.
    #[serde(default)]
    pub conntrack: ConntrackConfig,

    /// Dump retry behaviour.
    #[serde(default)]
    pub dump: DumpConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Flow filter settings. Empty strings disable the corresponding check.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    /// IPv4 CIDR the original source must lie in.
    #[serde(default)]
    pub source: String,

    /// IPv4 CIDR the original destination must lie in.
    #[serde(default)]
    pub destination: String,

    /// Single IPv4 address excluded at either end.
    #[serde(default)]
    pub exclude_ip: String,

    #[serde(default)]
    pub include_icmp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupingConfig {
    /// Default: 255.255.255.255 (no grouping).
    #[serde(default = "default_mask")]
    pub source_mask: String,

    /// Default: 255.255.255.255 (no grouping).
    #[serde(default = "default_mask")]
    pub destination_mask: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    /// `protocol:port` lines. None means every port is interesting.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// How often the file is checked for changes. Default: 1s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Wait between noticing a change and reading the file. Default: 250ms.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Named pipe to write to. None means stdout.
    #[serde(default)]
    pub pipe: Option<PathBuf>,

    /// Pipe buffer requested for newly created pipes. Default: 32MiB.
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,

    /// Folder receiving one archive file per interval.
    #[serde(default)]
    pub folder: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConntrackConfig {
    /// conntrack-tools executable. Default: "conntrack".
    #[serde(default = "default_conntrack_binary")]
    pub binary: PathBuf,

    /// Capacity of the parsed-event channel. Default: 65536.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Netlink receive buffer for the event socket; 0 leaves the tool's
    /// default. Default: 26MiB.
    #[serde(default = "default_socket_buffer_size")]
    pub socket_buffer_size: usize,

    /// Turn on kernel flow accounting at startup. Default: true.
    #[serde(default = "default_true")]
    pub enable_accounting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    /// Attempts per dump, the first included. Default: 3.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First retry delay; doubled after each failure. Default: 250ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_mask() -> String {
    "255.255.255.255".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_pipe_buffer_size() -> usize {
    32 * 1024 * 1024 // 32MB
}

fn default_conntrack_binary() -> PathBuf {
    PathBuf::from("conntrack")
}

fn default_event_buffer() -> usize {
    65_536
}

fn default_socket_buffer_size() -> usize {
    212_992 * 128
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            track_open_connections: false,
            filter: FilterConfig::default(),
            grouping: GroupingConfig::default(),
            ports: PortsConfig::default(),
            output: OutputConfig::default(),
            conntrack: ConntrackConfig::default(),
            dump: DumpConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            source_mask: default_mask(),
            destination_mask: default_mask(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            file: None,
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pipe: None,
            pipe_buffer_size: default_pipe_buffer_size(),
            folder: None,
        }
    }
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            binary: default_conntrack_binary(),
            event_buffer: default_event_buffer(),
            socket_buffer_size: default_socket_buffer_size(),
            enable_accounting: true,
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

impl DumpConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: self.retry_backoff,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval < Duration::from_secs(2) {
            bail!("interval must be at least 2s, got {:?}", self.interval);
        }

        if self.interval.subsec_nanos() != 0 {
            bail!(
                "interval must be a whole number of seconds, got {:?}",
                self.interval
            );
        }

        self.flow_filter()?;
        self.group_masks()?;

        if self.ports.poll_interval.is_zero() {
            bail!("ports.poll_interval must be positive");
        }

        if self.conntrack.binary.as_os_str().is_empty() {
            bail!("conntrack.binary is required");
        }

        if self.conntrack.event_buffer == 0 {
            bail!("conntrack.event_buffer must be positive");
        }

        if self.dump.retry_attempts == 0 {
            bail!("dump.retry_attempts must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }

    /// Build the flow filter described by the `filter` section.
    pub fn flow_filter(&self) -> Result<FlowFilter> {
        Ok(FlowFilter {
            source: parse_optional(&self.filter.source, "filter.source")?,
            destination: parse_optional(&self.filter.destination, "filter.destination")?,
            exclude_ip: parse_optional(&self.filter.exclude_ip, "filter.exclude_ip")?,
            include_icmp: self.filter.include_icmp,
        })
    }

    /// Source and destination masks from the `grouping` section.
    pub fn group_masks(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let source: Ipv4Addr = self
            .grouping
            .source_mask
            .trim()
            .parse()
            .with_context(|| format!("grouping.source_mask: {:?}", self.grouping.source_mask))?;
        let destination: Ipv4Addr = self
            .grouping
            .destination_mask
            .trim()
            .parse()
            .with_context(|| {
                format!(
                    "grouping.destination_mask: {:?}",
                    self.grouping.destination_mask
                )
            })?;

        Ok((source, destination))
    }
}

fn parse_optional<T>(value: &str, field: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    value
        .parse()
        .map(Some)
        .with_context(|| format!("{field}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            filter: FilterConfig {
                source: "10.0.0.0/8".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.interval, Duration::from_secs(15));
        assert!(!cfg.track_open_connections);
        assert_eq!(cfg.grouping.source_mask, "255.255.255.255");
        assert_eq!(cfg.ports.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.ports.settle_delay, Duration::from_millis(250));
        assert_eq!(cfg.output.pipe_buffer_size, 33_554_432);
        assert_eq!(cfg.conntrack.binary, PathBuf::from("conntrack"));
        assert_eq!(cfg.conntrack.event_buffer, 65_536);
        assert_eq!(cfg.conntrack.socket_buffer_size, 27_262_976);
        assert!(cfg.conntrack.enable_accounting);
        assert_eq!(cfg.dump.retry_policy(), RetryPolicy::default());
        assert!(!cfg.health.enabled);
        assert_eq!(cfg.health.addr, ":9090");
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
interval: 30s
track_open_connections: true
filter:
  source: 192.168.0.0/16
  exclude_ip: 192.168.1.1
  include_icmp: true
grouping:
  source_mask: 255.255.255.0
ports:
  file: /etc/accounting/ports
  settle_delay: 1s
output:
  pipe: /run/traffic.pipe
  folder: /var/lib/traffic
conntrack:
  binary: /usr/sbin/conntrack
dump:
  retry_attempts: 5
  retry_backoff: 100ms
health:
  enabled: true
  addr: 127.0.0.1:9100
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.interval, Duration::from_secs(30));
        assert!(cfg.track_open_connections);
        assert_eq!(cfg.ports.file, Some(PathBuf::from("/etc/accounting/ports")));
        assert_eq!(cfg.ports.settle_delay, Duration::from_secs(1));
        assert_eq!(cfg.ports.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.output.pipe, Some(PathBuf::from("/run/traffic.pipe")));
        assert_eq!(cfg.conntrack.event_buffer, 65_536);
        assert_eq!(
            cfg.dump.retry_policy(),
            RetryPolicy {
                attempts: 5,
                backoff: Duration::from_millis(100),
            }
        );

        let filter = cfg.flow_filter().expect("filter");
        assert_eq!(filter.source, Some("192.168.0.0/16".parse().expect("net")));
        assert_eq!(filter.destination, None);
        assert_eq!(filter.exclude_ip, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(filter.include_icmp);

        let (src_mask, dst_mask) = cfg.group_masks().expect("masks");
        assert_eq!(src_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(dst_mask, Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn test_validate_interval() {
        let mut cfg = valid_config();
        cfg.interval = Duration::from_secs(1);
        let err = cfg.validate().expect_err("too short");
        assert!(err.to_string().contains("at least 2s"));

        cfg.interval = Duration::from_millis(2500);
        let err = cfg.validate().expect_err("fractional");
        assert!(err.to_string().contains("whole number of seconds"));

        cfg.interval = Duration::from_secs(2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_values() {
        let mut cfg = valid_config();
        cfg.filter.destination = "not-a-cidr".to_string();
        let err = cfg.validate().expect_err("bad cidr");
        assert!(err.to_string().contains("filter.destination"));

        let mut cfg = valid_config();
        cfg.filter.source = "fd00::/8".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.filter.exclude_ip = "10.0.0".to_string();
        let err = cfg.validate().expect_err("bad ip");
        assert!(err.to_string().contains("filter.exclude_ip"));
    }

    #[test]
    fn test_validate_masks() {
        let mut cfg = valid_config();
        cfg.grouping.destination_mask = "255.255.0".to_string();
        let err = cfg.validate().expect_err("bad mask");
        assert!(err.to_string().contains("grouping.destination_mask"));
    }

    #[test]
    fn test_validate_positive_fields() {
        let mut cfg = valid_config();
        cfg.conntrack.event_buffer = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.dump.retry_attempts = 0;
        let err = cfg.validate().expect_err("zero attempts");
        assert!(err.to_string().contains("dump.retry_attempts"));

        let mut cfg = valid_config();
        cfg.ports.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.health.enabled = true;
        cfg.health.addr = String::new();
        let err = cfg.validate().expect_err("missing addr");
        assert!(err.to_string().contains("health.addr"));
    }

    #[test]
    fn test_empty_filter_means_no_filter() {
        let cfg = Config::default();
        assert_eq!(cfg.flow_filter().expect("filter"), FlowFilter::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "interval: 10s\nfilter:\n  include_icmp: true\n").expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert!(cfg.filter.include_icmp);

        std::fs::write(&path, "interval: 1s\n").expect("write");
        assert!(Config::load(&path).is_err());

        let err = Config::load(&dir.path().join("missing.yaml")).expect_err("missing file");
        assert!(err.to_string().contains("reading config file"));
    }
}
