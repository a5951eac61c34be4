// DNS-answer observer

//! DNS-answer observer
//!
//! Tails the DNS server's query log from end-of-file and feeds every
//! IPv4 literal it sees into the packet-filter manager's dynamic
//! allow-set. Runs as a long-lived background task; survives a
//! not-yet-existing log file and file truncation/rotation by re-seeking
//! when a read comes back short.

use crate::nft::NftManager;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::watch;

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\d{1,3}\.){3}\d{1,3}").expect("static IPv4 regex is valid"));

/// Extract every dotted-quad IPv4 literal in `line`, delimiter-bounded so
/// it doesn't match inside a longer digit run (e.g. a port number glued to
/// the address with no separator).
fn extract_ipv4(line: &str) -> Vec<String> {
    let bytes = line.as_bytes();
    IPV4_RE
        .find_iter(line)
        .filter(|m| {
            let before_ok = m.start() == 0 || !bytes[m.start() - 1].is_ascii_digit();
            let after_ok = m.end() == bytes.len() || !bytes[m.end()].is_ascii_digit();
            before_ok && after_ok
        })
        .map(|m| m.as_str().to_string())
        .collect()
}

async fn open_at_eof(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    OpenOptions::new().create(true).read(true).write(true).open(path).await
}

/// Run the observer loop until `stop` fires. Intended to be spawned as a
/// background task by the controller.
pub async fn run(log_path: PathBuf, nft: Arc<NftManager>, set_name: &'static str, mut stop: watch::Receiver<bool>) {
    let mut file = match open_at_eof(&log_path).await {
        Ok(f) => f,
        Err(err) => {
            log::error!("DNS observer could not open {}: {err}", log_path.display());
            return;
        }
    };
    if let Err(err) = file.seek(SeekFrom::End(0)).await {
        log::warn!("DNS observer seek failed: {err}");
    }

    let mut buf = [0u8; 4096];
    let mut pending = String::new();

    loop {
        if *stop.borrow() {
            return;
        }
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
            n = file.read(&mut buf) => {
                match n {
                    Ok(0) => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Ok(n) => {
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(idx) = pending.find('\n') {
                            let line: String = pending.drain(..=idx).collect();
                            for ip in extract_ipv4(&line) {
                                nft.add_ip(&ip, set_name, None).await;
                            }
                        }
                    }
                    Err(err) => {
                        log::warn!("DNS observer read error, reopening: {err}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        if let Ok(f) = open_at_eof(&log_path).await {
                            file = f;
                        }
                    }
                }
            }
        }
    }
}

/// Seed the probe allow-set with the resolved addresses of the configured
/// TLS and captive-portal hosts.
pub async fn seed_probe_ips(nft: &NftManager, hosts: &[String]) {
    for ip in hosts {
        if ip.contains(':') {
            continue;
        }
        nft.add_ip(ip, "allow_probe_v4", None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_ipv4_single() {
        let ips = extract_ipv4("query A 93.184.216.34 answer");
        assert_eq!(ips, vec!["93.184.216.34".to_string()]);
    }

    #[test]
    fn test_extract_ipv4_multiple() {
        let ips = extract_ipv4("1.2.3.4 then 5.6.7.8 and 9.9.9.9");
        assert_eq!(ips, vec!["1.2.3.4", "5.6.7.8", "9.9.9.9"]);
    }

    #[test]
    fn test_extract_ipv4_no_match_in_longer_digit_run() {
        let ips = extract_ipv4("port 1234567890 has no ip");
        assert!(ips.is_empty());
    }

    #[test]
    fn test_extract_ipv4_ignores_plain_text() {
        assert!(extract_ipv4("no addresses here").is_empty());
    }
}
