// Shared data structures for the first-minute controller

//! Shared data structures
//!
//! This module defines the stage enum, the signal record fed to the state
//! machine each tick, the probe/sensor output records, and the TOML
//! configuration structures.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Stage of the first-minute state machine.
///
/// `INIT` is the boot/no-link state. `DECEPTION` is a specialization of
/// `CONTAIN` applied by the controller when an external honeypot
/// configuration is present and enabled; the state machine itself never
/// produces `DECEPTION` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Probe,
    Degraded,
    Normal,
    Contain,
    Deception,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Probe => "PROBE",
            Stage::Degraded => "DEGRADED",
            Stage::Normal => "NORMAL",
            Stage::Contain => "CONTAIN",
            Stage::Deception => "DECEPTION",
        }
    }

    /// Connection-mark value used by the packet-filter `stage_switch` chain.
    pub fn mark(&self) -> u8 {
        match self {
            Stage::Probe => 1,
            Stage::Degraded => 2,
            Stage::Normal => 3,
            Stage::Contain => 4,
            Stage::Deception => 5,
            // INIT never drives enforcement directly; default to the most
            // restrictive mark if ever asked.
            Stage::Init => 1,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INIT" => Ok(Stage::Init),
            "PROBE" => Ok(Stage::Probe),
            "DEGRADED" => Ok(Stage::Degraded),
            "NORMAL" => Ok(Stage::Normal),
            "CONTAIN" => Ok(Stage::Contain),
            "DECEPTION" => Ok(Stage::Deception),
            other => anyhow::bail!("unknown stage '{other}'"),
        }
    }
}

/// Signals collected in a single controller tick and fed to the state
/// machine. All fields are optional/default-false/default-zero, replacing
/// the dynamic signal dict described by the original implementation.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub link_up: bool,
    pub bssid: Option<String>,
    pub wifi_tags: bool,
    pub probe_fail: bool,
    pub probe_fail_count: u32,
    pub dns_mismatch: u32,
    pub cert_mismatch: bool,
    pub route_anomaly: bool,
    pub suricata_alert: bool,
    pub allow_recover: bool,
}

/// Outcome of one probe-engine run. Produced once per `PROBE` entry; never
/// mutated afterward.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub captive_portal: bool,
    pub tls_mismatch: bool,
    pub dns_mismatch: u32,
    pub route_anomaly: bool,
    pub details: serde_json::Value,
}

/// Upstream Wi-Fi link state as reported by `iw dev <iface> link`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkState {
    pub connected: bool,
    pub ssid: String,
    pub bssid: String,
}

/// Output of one Wi-Fi safety sensor poll. Produced per poll; never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct WifiSafety {
    #[serde(rename = "wifi_tags")]
    pub tags: Vec<String>,
    pub link: LinkState,
    pub capture_bytes: usize,
}

/// Known-good AP fingerprints: SSID -> allowed BSSID set (lowercase hex).
pub type KnownDb = HashMap<String, KnownApProfile>;

#[derive(Debug, Clone, Deserialize)]
pub struct KnownApProfile {
    #[serde(default)]
    pub bssids: HashSet<String>,
}

/// Closed tag vocabulary for the Wi-Fi safety sensor (§4.3).
pub const WIFI_TAG_VOCABULARY: &[&str] = &[
    "evil_ap",
    "suspicious_ap",
    "mitm",
    "arp_spoof",
    "dhcp_spoof",
    "dns_spoof",
    "tls_downgrade",
    "captive_portal",
    "phish",
    "sslstrip",
];

// ---------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub interfaces: InterfacesConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dnsmasq: DnsmasqConfig,
    #[serde(default)]
    pub state_machine: StageMachineConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub status_api: StatusApiConfig,
    #[serde(default)]
    pub suricata: SuricataConfig,
    #[serde(default)]
    pub deception: DeceptionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InterfacesConfig {
    pub upstream: String,
    pub downstream: String,
    pub mgmt_ip: String,
    pub mgmt_subnet: String,
    #[serde(default)]
    pub gateway_ip: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    #[serde(default)]
    pub runtime_dir: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub pid_file: Option<String>,
    #[serde(default)]
    pub dns_log: Option<String>,
    #[serde(default)]
    pub nft_template: Option<String>,
    #[serde(default)]
    pub known_db: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsmasqConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub conf_path: Option<String>,
}

impl Default for DnsmasqConfig {
    fn default() -> Self {
        Self {
            enable: true,
            conf_path: None,
        }
    }
}

/// Tunables for the stage state machine (§4.1). Field names and defaults
/// match the specification exactly.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct StageMachineConfig {
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: f64,
    #[serde(default = "default_normal_threshold")]
    pub normal_threshold: f64,
    #[serde(default = "default_contain_threshold")]
    pub contain_threshold: f64,
    #[serde(default = "default_stable_normal_sec")]
    pub stable_normal_sec: f64,
    #[serde(default = "default_stable_probe_sec")]
    pub stable_probe_sec: f64,
    #[serde(default = "default_probe_window_sec")]
    pub probe_window_sec: f64,
    #[serde(default = "default_decay_per_sec")]
    pub decay_per_sec: f64,
}

impl Default for StageMachineConfig {
    fn default() -> Self {
        Self {
            degrade_threshold: default_degrade_threshold(),
            normal_threshold: default_normal_threshold(),
            contain_threshold: default_contain_threshold(),
            stable_normal_sec: default_stable_normal_sec(),
            stable_probe_sec: default_stable_probe_sec(),
            probe_window_sec: default_probe_window_sec(),
            decay_per_sec: default_decay_per_sec(),
        }
    }
}

fn default_degrade_threshold() -> f64 {
    30.0
}
fn default_normal_threshold() -> f64 {
    8.0
}
fn default_contain_threshold() -> f64 {
    65.0
}
fn default_stable_normal_sec() -> f64 {
    20.0
}
fn default_stable_probe_sec() -> f64 {
    10.0
}
fn default_probe_window_sec() -> f64 {
    20.0
}
fn default_decay_per_sec() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProbesConfig {
    #[serde(default)]
    pub captive_portal: CaptivePortalConfig,
    #[serde(default)]
    pub tls: Vec<TlsPinConfig>,
    #[serde(default)]
    pub dns_compare: DnsCompareConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptivePortalConfig {
    #[serde(default = "default_captive_url")]
    pub url: String,
    #[serde(default = "default_captive_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_captive_retries")]
    pub retries: u32,
}

impl Default for CaptivePortalConfig {
    fn default() -> Self {
        Self {
            url: default_captive_url(),
            timeout_secs: default_captive_timeout(),
            retries: default_captive_retries(),
        }
    }
}

fn default_captive_url() -> String {
    "http://connectivitycheck.gstatic.com/generate_204".to_string()
}
fn default_captive_timeout() -> u64 {
    4
}
fn default_captive_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsPinConfig {
    pub host: String,
    #[serde(default = "default_tls_port")]
    pub port: u16,
    #[serde(default)]
    pub fingerprint_sha256: String,
    #[serde(default = "default_tls_timeout")]
    pub timeout_secs: u64,
}

fn default_tls_port() -> u16 {
    443
}
fn default_tls_timeout() -> u64 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsCompareConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sample_names")]
    pub sample_names: Vec<String>,
    #[serde(default = "default_reference_resolver")]
    pub reference_resolver: String,
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,
}

impl Default for DnsCompareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_names: default_sample_names(),
            reference_resolver: default_reference_resolver(),
            timeout_secs: default_dns_timeout(),
        }
    }
}

fn default_sample_names() -> Vec<String> {
    vec!["example.com".to_string()]
}
fn default_reference_resolver() -> String {
    "9.9.9.9".to_string()
}
fn default_dns_timeout() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_probe_ttl")]
    pub probe_allow_ttl: u32,
    #[serde(default = "default_dynamic_ttl")]
    pub dynamic_allow_ttl: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            probe_allow_ttl: default_probe_ttl(),
            dynamic_allow_ttl: default_dynamic_ttl(),
        }
    }
}

fn default_probe_ttl() -> u32 {
    120
}
fn default_dynamic_ttl() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusApiConfig {
    #[serde(default = "default_status_host")]
    pub host: String,
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl Default for StatusApiConfig {
    fn default() -> Self {
        Self {
            host: default_status_host(),
            port: default_status_port(),
        }
    }
}

fn default_status_host() -> String {
    "192.168.7.1".to_string()
}
fn default_status_port() -> u16 {
    8081
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SuricataConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub eve_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeceptionConfig {
    #[serde(default = "default_true")]
    pub enable_if_opencanary_present: bool,
    #[serde(default = "default_opencanary_cfg")]
    pub opencanary_cfg: String,
}

impl Default for DeceptionConfig {
    fn default() -> Self {
        Self {
            enable_if_opencanary_present: true,
            opencanary_cfg: default_opencanary_cfg(),
        }
    }
}

fn default_opencanary_cfg() -> String {
    "/etc/opencanaryd/opencanary.conf".to_string()
}
