// Wi-Fi safety sensor

//! Wi-Fi safety sensor
//!
//! Combines AP fingerprint checking against a known-good database with a
//! short `tcpdump` capture window used to heuristically flag ARP spoofing,
//! rogue DHCP servers, and DNS reply anomalies on the upstream link.

use crate::types::{KnownDb, LinkState, WifiSafety, WIFI_TAG_VOCABULARY};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([0-9a-f]{2}:){5}[0-9a-f]{2}").expect("static MAC regex is valid")
});

/// Poll the upstream link state via `iw dev <iface> link`.
pub async fn get_link_state(iface: &str) -> LinkState {
    let output = Command::new("iw").args(["dev", iface, "link"]).output().await;
    let text = match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).to_string(),
        _ => return LinkState::default(),
    };

    if text.contains("Not connected") {
        return LinkState::default();
    }

    let mut link = LinkState {
        connected: true,
        ..Default::default()
    };
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Connected to") {
            if let Some(m) = MAC_RE.find(rest) {
                link.bssid = m.as_str().to_ascii_lowercase();
            }
        } else if let Some(rest) = line.strip_prefix("SSID:") {
            link.ssid = rest.trim().to_string();
        }
    }
    link
}

/// Load the known-AP fingerprint database, tolerating a missing or
/// unreadable file (treated as "no known APs").
pub fn load_known_db(path: &str) -> KnownDb {
    if path.is_empty() {
        return KnownDb::new();
    }
    let p = Path::new(path);
    if !p.is_file() {
        return KnownDb::new();
    }
    std::fs::read_to_string(p)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

/// Flag `evil_ap` when the connected SSID is known but the BSSID is not in
/// its allow-list. Unknown SSIDs are left to other sensors — an unfamiliar
/// network is not itself suspicious.
pub fn check_ap_fingerprint(link: &LinkState, known_db: &KnownDb) -> Vec<String> {
    if !link.connected || link.ssid.is_empty() {
        return Vec::new();
    }
    let Some(profile) = known_db.get(&link.ssid) else {
        return Vec::new();
    };
    if !profile.bssids.is_empty() && !link.bssid.is_empty() && !profile.bssids.contains(&link.bssid) {
        vec!["evil_ap".to_string()]
    } else {
        Vec::new()
    }
}

/// Capture ARP/DHCP/DNS traffic on `iface` for `duration` and return the raw
/// `tcpdump` output, or an empty string if `tcpdump` isn't available.
pub async fn tcpdump_watch(iface: &str, duration: Duration) -> String {
    if which("tcpdump").is_none() {
        return String::new();
    }

    let mut child = match Command::new("tcpdump")
        .args([
            "-l",
            "-n",
            "-i",
            iface,
            "arp or (udp and (port 67 or 68)) or (udp and port 53)",
        ])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(_) => return String::new(),
    };

    let stdout = match child.stdout.take() {
        Some(s) => s,
        None => return String::new(),
    };
    let mut lines = BufReader::new(stdout).lines();
    let mut buf = Vec::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(l)) => buf.push(l),
                    _ => break,
                }
            }
            _ = &mut deadline => break,
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
    buf.join("\n")
}

fn which(bin: &str) -> Option<std::path::PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(bin))
            .find(|p| p.is_file())
    })
}

/// Two or more distinct MACs claiming `gateway_ip` via ARP within the
/// capture window indicates a spoofed gateway.
pub fn detect_arp_spoof(capture: &str, gateway_ip: Option<&str>) -> Vec<String> {
    let Some(gateway_ip) = gateway_ip else {
        return Vec::new();
    };
    let mut macs = HashSet::new();
    for line in capture.lines() {
        if line.contains("ARP") && line.contains(gateway_ip) && line.contains("is-at") {
            if let Some(m) = MAC_RE.find(line) {
                macs.insert(m.as_str().to_ascii_lowercase());
            }
        }
    }
    if macs.len() >= 2 {
        vec!["arp_spoof".to_string(), "mitm".to_string()]
    } else {
        Vec::new()
    }
}

/// Two or more distinct DHCP Offer/Ack senders in the capture window
/// indicates a rogue DHCP server on the segment.
pub fn detect_rogue_dhcp(capture: &str) -> Vec<String> {
    let mut servers = HashSet::new();
    for line in capture.lines() {
        if line.contains("DHCP") && (line.contains("Offer") || line.contains("Ack") || line.contains("ACK")) {
            if let Some(m) = MAC_RE.find(line) {
                servers.insert(m.as_str().to_ascii_lowercase());
            }
        }
    }
    if servers.len() >= 2 {
        vec!["dhcp_spoof".to_string(), "mitm".to_string()]
    } else {
        Vec::new()
    }
}

/// A single answer IP appearing in 8+ DNS replies across the capture window
/// (regardless of queried name) looks like DNS poisoning toward one host.
pub fn detect_dns_anomaly(capture: &str) -> Vec<String> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for line in capture.lines() {
        if line.contains(" A ") && line.contains('>') {
            let parts: Vec<&str> = line.split_whitespace().collect();
            for (i, tok) in parts.iter().enumerate() {
                if *tok == "A" {
                    if let Some(ip) = parts.get(i + 1) {
                        *counts.entry(ip.to_string()).or_insert(0) += 1;
                    }
                }
            }
        }
    }
    if counts.values().any(|&v| v >= 8) {
        vec!["dns_spoof".to_string()]
    } else {
        Vec::new()
    }
}

/// Run the full sensor pass: fingerprint check plus a short capture-based
/// heuristic sweep, deduplicated against the closed tag vocabulary.
pub async fn evaluate(
    iface: &str,
    known_db: &KnownDb,
    gateway_ip: Option<&str>,
    capture_duration: Duration,
) -> WifiSafety {
    let link = get_link_state(iface).await;

    let mut tags: HashSet<String> = check_ap_fingerprint(&link, known_db).into_iter().collect();

    let capture = tcpdump_watch(iface, capture_duration).await;
    tags.extend(detect_arp_spoof(&capture, gateway_ip));
    tags.extend(detect_rogue_dhcp(&capture));
    tags.extend(detect_dns_anomaly(&capture));

    tags.retain(|t| WIFI_TAG_VOCABULARY.contains(&t.as_str()));
    let mut tags: Vec<String> = tags.into_iter().collect();
    tags.sort();

    WifiSafety {
        tags,
        capture_bytes: capture.len(),
        link,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KnownApProfile;

    fn db_with(ssid: &str, bssids: &[&str]) -> KnownDb {
        let mut db = KnownDb::new();
        db.insert(
            ssid.to_string(),
            KnownApProfile {
                bssids: bssids.iter().map(|s| s.to_string()).collect(),
            },
        );
        db
    }

    #[test]
    fn test_check_ap_fingerprint_unknown_ssid_is_silent() {
        let link = LinkState {
            connected: true,
            ssid: "CoffeeShopWifi".to_string(),
            bssid: "aa:bb:cc:dd:ee:ff".to_string(),
        };
        let tags = check_ap_fingerprint(&link, &KnownDb::new());
        assert!(tags.is_empty());
    }

    #[test]
    fn test_check_ap_fingerprint_known_ssid_wrong_bssid_flags_evil_ap() {
        let link = LinkState {
            connected: true,
            ssid: "HomeNet".to_string(),
            bssid: "11:22:33:44:55:66".to_string(),
        };
        let db = db_with("HomeNet", &["aa:bb:cc:dd:ee:ff"]);
        let tags = check_ap_fingerprint(&link, &db);
        assert_eq!(tags, vec!["evil_ap".to_string()]);
    }

    #[test]
    fn test_check_ap_fingerprint_known_ssid_correct_bssid_is_silent() {
        let link = LinkState {
            connected: true,
            ssid: "HomeNet".to_string(),
            bssid: "AA:BB:CC:DD:EE:FF".to_string(),
        };
        let db = db_with("HomeNet", &["aa:bb:cc:dd:ee:ff"]);
        let tags = check_ap_fingerprint(&link, &db);
        assert!(tags.is_empty());
    }

    #[test]
    fn test_check_ap_fingerprint_not_connected_is_silent() {
        let link = LinkState::default();
        let db = db_with("HomeNet", &["aa:bb:cc:dd:ee:ff"]);
        assert!(check_ap_fingerprint(&link, &db).is_empty());
    }

    #[test]
    fn test_detect_arp_spoof_needs_two_distinct_macs() {
        let capture = "ARP, Reply 10.0.0.1 is-at aa:aa:aa:aa:aa:aa\n\
                        ARP, Reply 10.0.0.1 is-at bb:bb:bb:bb:bb:bb";
        let tags = detect_arp_spoof(capture, Some("10.0.0.1"));
        assert!(tags.contains(&"arp_spoof".to_string()));
        assert!(tags.contains(&"mitm".to_string()));
    }

    #[test]
    fn test_detect_arp_spoof_single_mac_is_silent() {
        let capture = "ARP, Reply 10.0.0.1 is-at aa:aa:aa:aa:aa:aa";
        assert!(detect_arp_spoof(capture, Some("10.0.0.1")).is_empty());
    }

    #[test]
    fn test_detect_arp_spoof_no_gateway_configured_is_silent() {
        let capture = "ARP, Reply 10.0.0.1 is-at aa:aa:aa:aa:aa:aa\n\
                        ARP, Reply 10.0.0.1 is-at bb:bb:bb:bb:bb:bb";
        assert!(detect_arp_spoof(capture, None).is_empty());
    }

    #[test]
    fn test_detect_rogue_dhcp_needs_two_servers() {
        let capture = "DHCP-Message (Offer), from aa:aa:aa:aa:aa:aa\n\
                        DHCP-Message (Ack), from bb:bb:bb:bb:bb:bb";
        let tags = detect_rogue_dhcp(capture);
        assert!(tags.contains(&"dhcp_spoof".to_string()));
    }

    #[test]
    fn test_detect_dns_anomaly_threshold() {
        let mut lines = Vec::new();
        for _ in 0..8 {
            lines.push("IP 1.1.1.1.53 > 10.0.0.5.12345: 1234 A 93.184.216.34".to_string());
        }
        let capture = lines.join("\n");
        let tags = detect_dns_anomaly(&capture);
        assert_eq!(tags, vec!["dns_spoof".to_string()]);
    }

    #[test]
    fn test_detect_dns_anomaly_below_threshold_is_silent() {
        let capture = "IP 1.1.1.1.53 > 10.0.0.5.12345: 1234 A 93.184.216.34";
        assert!(detect_dns_anomaly(capture).is_empty());
    }

    #[test]
    fn test_load_known_db_missing_file_returns_empty() {
        let db = load_known_db("/nonexistent/path/known.json");
        assert!(db.is_empty());
    }

    #[test]
    fn test_load_known_db_empty_path_returns_empty() {
        assert!(load_known_db("").is_empty());
    }
}
