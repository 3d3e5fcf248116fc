use crate::endpoint::TransportFilter;
use crate::error::MonitorError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_millis(800);

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub monitoring: MonitoringConfig,
    pub output: OutputConfig,
    pub dns: DnsConfig,
    pub markers: MarkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_secs: f64,
    pub transport: TransportFilter,
    pub log_duplicates: bool,
    pub close_events: bool,
    pub process_cache_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// `None` picks a timestamped file in the working directory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub timeout_secs: f64,
    /// Maximum number of cached addresses. `None` keeps every answer for the whole run.
    pub cache_capacity: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MarkerConfig {
    pub enabled: bool,
    pub marker1: String,
    pub marker2: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<String>,
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            interval_secs: DEFAULT_INTERVAL.as_secs_f64(),
            transport: TransportFilter::All,
            log_duplicates: false,
            close_events: true,
            process_cache_seconds: 60,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            enabled: true,
            timeout_secs: DEFAULT_DNS_TIMEOUT.as_secs_f64(),
            cache_capacity: None,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        MarkerConfig {
            enabled: false,
            marker1: "matchmaking_start".to_string(),
            marker2: "issue_observed".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: Some("net-monitor.log".to_string()),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        let contents = fs::read_to_string(path).map_err(|source| MonitorError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, MonitorError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        check_seconds("monitoring.interval_secs", self.monitoring.interval_secs)?;
        check_seconds("dns.timeout_secs", self.dns.timeout_secs)?;
        if self.dns.cache_capacity == Some(0) {
            return Err(MonitorError::ConfigInvalid(
                "dns.cache_capacity must be at least 1 (omit it for an unbounded cache)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        seconds(self.monitoring.interval_secs).unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn dns_timeout(&self) -> Duration {
        seconds(self.dns.timeout_secs).unwrap_or(DEFAULT_DNS_TIMEOUT)
    }

    /// Configured event log path, or `netlog_YYYYmmdd_HHMMSS.jsonl` stamped with the current UTC time.
    pub fn output_path(&self) -> PathBuf {
        match &self.output.path {
            Some(path) => path.clone(),
            None => PathBuf::from(format!(
                "netlog_{}.jsonl",
                chrono::Utc::now().format("%Y%m%d_%H%M%S")
            )),
        }
    }
}

/// A strictly positive span that fits in a `Duration`.
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|span| !span.is_zero())
}

fn check_seconds(field: &str, value: f64) -> Result<(), MonitorError> {
    match seconds(value) {
        Some(_) => Ok(()),
        None => Err(MonitorError::ConfigInvalid(format!(
            "{} must be a positive number of seconds, got {}",
            field, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.dns_timeout(), Duration::from_millis(800));
        assert!(config.dns.enabled);
        assert!(config.monitoring.close_events);
        assert!(!config.monitoring.log_duplicates);
        assert_eq!(config.monitoring.transport, TransportFilter::All);
        assert!(!config.markers.enabled);
        assert_eq!(config.markers.marker1, "matchmaking_start");
        assert_eq!(config.markers.marker2, "issue_observed");
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let yaml = "
monitoring:
  interval_secs: 0.25
  transport: udp
dns:
  enabled: false
markers:
  enabled: true
  marker2: lag_spike
";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.interval(), Duration::from_millis(250));
        assert_eq!(config.monitoring.transport, TransportFilter::Udp);
        assert!(config.monitoring.close_events);
        assert!(!config.dns.enabled);
        assert!(config.markers.enabled);
        assert_eq!(config.markers.marker1, "matchmaking_start");
        assert_eq!(config.markers.marker2, "lag_spike");
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let err = Config::from_yaml("monitoring:\n  interval_secs: 0\n").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_rejects_seconds_beyond_duration_range() {
        let err = Config::from_yaml("monitoring:\n  interval_secs: 1e20\n").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
        assert!(err.to_string().contains("interval_secs"));

        let err = Config::from_yaml("dns:\n  timeout_secs: 1e20\n").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_rejects_interval_that_rounds_to_zero() {
        let err = Config::from_yaml("monitoring:\n  interval_secs: 1e-12\n").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
    }

    #[test]
    fn test_rejects_zero_cache_capacity() {
        let err = Config::from_yaml("dns:\n  cache_capacity: 0\n").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let err = Config::from_yaml("monitoring:\n  transport: sctp\n").unwrap_err();
        assert!(matches!(err, MonitorError::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output:\n  path: capture.jsonl").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.output_path(), PathBuf::from("capture.jsonl"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigRead { .. }));
    }

    #[test]
    fn test_default_output_path_is_timestamped() {
        let name = Config::default().output_path();
        let name = name.to_string_lossy();
        assert!(name.starts_with("netlog_"));
        assert!(name.ends_with(".jsonl"));
        assert_eq!(name.len(), "netlog_20240101_000000.jsonl".len());
    }
}
