// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file and validating
//! its contents, including threshold ordering and directory bootstrap with
//! a non-root fallback.

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<()> {
    if config.interfaces.upstream.is_empty() {
        anyhow::bail!("interfaces.upstream cannot be empty");
    }
    if config.interfaces.downstream.is_empty() {
        anyhow::bail!("interfaces.downstream cannot be empty");
    }
    if config.interfaces.mgmt_ip.parse::<std::net::Ipv4Addr>().is_err() {
        anyhow::bail!("interfaces.mgmt_ip must be a valid IPv4 address");
    }

    let sm = &config.state_machine;
    if !(sm.normal_threshold < sm.degrade_threshold && sm.degrade_threshold < sm.contain_threshold)
    {
        anyhow::bail!(
            "state_machine thresholds must satisfy normal_threshold < degrade_threshold < contain_threshold (got {}, {}, {})",
            sm.normal_threshold,
            sm.degrade_threshold,
            sm.contain_threshold
        );
    }
    if sm.decay_per_sec <= 0.0 {
        anyhow::bail!("state_machine.decay_per_sec must be > 0");
    }

    if !config.probes.dns_compare.enabled && config.probes.tls.is_empty() {
        anyhow::bail!(
            "at least one of probes.tls or probes.dns_compare.enabled must be configured"
        );
    }

    Ok(())
}

/// Directories the controller needs at runtime, resolved from configuration
/// with a repo-local fallback when the preferred system paths aren't
/// writable (e.g. running as a non-root user during development).
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub runtime_dir: PathBuf,
    pub log_dir: PathBuf,
    pub pid_file: PathBuf,
    pub dns_log: PathBuf,
}

impl RuntimePaths {
    pub fn resolve(config: &Config) -> Self {
        let runtime_dir = config
            .paths
            .runtime_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/azazel-zero"));
        let log_dir = config
            .paths
            .log_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/log/azazel-zero"));
        let pid_file = config
            .paths
            .pid_file
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime_dir.join("first_minute.pid"));
        let dns_log = config
            .paths
            .dns_log
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/log/azazel-dnsmasq.log"));

        let mut paths = Self {
            runtime_dir,
            log_dir,
            pid_file,
            dns_log,
        };
        paths.ensure_dirs();
        paths
    }

    /// Try to create the preferred runtime/log directories; fall back to a
    /// repo-local `.azazel-zero/{run,log}` tree if that fails (e.g. no root).
    fn ensure_dirs(&mut self) {
        if fs::create_dir_all(&self.runtime_dir).is_ok() && fs::create_dir_all(&self.log_dir).is_ok()
        {
            return;
        }

        log::warn!(
            "Could not create {} or {}; falling back to a repo-local .azazel-zero tree",
            self.runtime_dir.display(),
            self.log_dir.display()
        );

        let fallback_base = PathBuf::from(".azazel-zero");
        let fallback_runtime = fallback_base.join("run");
        let fallback_log = fallback_base.join("log");
        let _ = fs::create_dir_all(&fallback_runtime);
        let _ = fs::create_dir_all(&fallback_log);

        self.pid_file = fallback_runtime.join("first_minute.pid");
        self.dns_log = fallback_log.join("azazel-dnsmasq.log");
        self.runtime_dir = fallback_runtime;
        self.log_dir = fallback_log;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn base_config() -> Config {
        Config {
            interfaces: InterfacesConfig {
                upstream: "wlan0".to_string(),
                downstream: "usb0".to_string(),
                mgmt_ip: "192.168.7.1".to_string(),
                mgmt_subnet: "192.168.7.0/24".to_string(),
                gateway_ip: None,
            },
            paths: PathsConfig::default(),
            dnsmasq: DnsmasqConfig::default(),
            state_machine: StageMachineConfig::default(),
            probes: ProbesConfig {
                tls: vec![TlsPinConfig {
                    host: "example.com".to_string(),
                    port: 443,
                    fingerprint_sha256: String::new(),
                    timeout_secs: 5,
                }],
                ..ProbesConfig::default()
            },
            policy: PolicyConfig::default(),
            status_api: StatusApiConfig::default(),
            suricata: SuricataConfig::default(),
            deception: DeceptionConfig::default(),
        }
    }

    #[test]
    fn test_validate_config_ok() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_validate_config_empty_upstream() {
        let mut cfg = base_config();
        cfg.interfaces.upstream = String::new();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_config_bad_mgmt_ip() {
        let mut cfg = base_config();
        cfg.interfaces.mgmt_ip = "not-an-ip".to_string();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_config_threshold_ordering() {
        let mut cfg = base_config();
        cfg.state_machine.normal_threshold = 50.0;
        cfg.state_machine.degrade_threshold = 30.0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_config_zero_decay() {
        let mut cfg = base_config();
        cfg.state_machine.decay_per_sec = 0.0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_config_rejects_no_probe_dimension_configured() {
        let mut cfg = base_config();
        cfg.probes.tls.clear();
        cfg.probes.dns_compare.enabled = false;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_load_config_roundtrip() {
        let toml_text = r#"
            [interfaces]
            upstream = "wlan0"
            downstream = "usb0"
            mgmt_ip = "192.168.7.1"
            mgmt_subnet = "192.168.7.0/24"

            [[probes.tls]]
            host = "example.com"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, toml_text).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.interfaces.upstream, "wlan0");
        assert_eq!(cfg.state_machine.degrade_threshold, 30.0);
    }

    #[test]
    fn test_runtime_paths_uses_configured_values() {
        let mut cfg = base_config();
        cfg.paths.runtime_dir = Some("/tmp/fmcd-test-runtime".to_string());
        cfg.paths.log_dir = Some("/tmp/fmcd-test-log".to_string());
        let paths = RuntimePaths::resolve(&cfg);
        assert_eq!(paths.runtime_dir, PathBuf::from("/tmp/fmcd-test-runtime"));
        assert_eq!(paths.pid_file, PathBuf::from("/tmp/fmcd-test-runtime/first_minute.pid"));
    }
}
