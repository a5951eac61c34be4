// Network probe engine

//! Network probe engine
//!
//! Four independent probes that run once per `PROBE` entry and whenever the
//! controller wants a fresh read of upstream trustworthiness: a
//! captive-portal check, a TLS certificate pin, a DNS cross-resolver
//! comparison, and a default-route sanity check.

use crate::types::{Config, ProbeOutcome};
use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// `true` if the upstream looks captive-portal-gated, along with the detail
/// blob to embed in the outcome. Builds its own client scoped to this run's
/// configured timeout rather than sharing a fixed global, since the timeout
/// is per-probe-run configurable.
async fn probe_captive_portal(url: &str, timeout_secs: u64, retries: u32) -> (bool, serde_json::Value) {
    let mut detail = json!({ "url": url, "status": serde_json::Value::Null });
    let attempts = retries.max(0) + 1;

    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            detail["error"] = json!(err.to_string());
            return (true, detail);
        }
    };

    for attempt in 0..attempts {
        match timeout(Duration::from_secs(timeout_secs), client.get(url).send()).await {
            Ok(Ok(resp)) => {
                let status = resp.status();
                detail["status"] = json!(status.as_u16());
                let body = resp.bytes().await.unwrap_or_default();
                let small_body = body.len() < 50;
                if (status == 200 || status == 204) && small_body {
                    return (false, detail);
                }
                return (true, detail);
            }
            Ok(Err(err)) => {
                if let Some(status) = err.status() {
                    detail["status"] = json!(status.as_u16());
                    return (true, detail);
                }
                detail["error"] = json!(err.to_string());
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            Err(_) => {
                detail["error"] = json!("timed out");
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
    (true, detail)
}

/// `true` on fingerprint mismatch (or any handshake failure), along with the
/// detail blob. Performs a raw TLS handshake rather than going through
/// `reqwest` so the leaf certificate DER is available for pinning.
async fn probe_tls_endpoint(
    host: &str,
    port: u16,
    fingerprint: &str,
    timeout_secs: u64,
) -> (bool, serde_json::Value) {
    let mut detail = json!({ "host": host, "port": port });

    let attempt = async {
        let mut root_store = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().context("loading native CA roots")? {
            let _ = root_store.add(cert);
        }
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let connector = tokio_rustls::TlsConnector::from(tls_config);

        let addr = format!("{host}:{port}")
            .to_socket_addrs()
            .context("resolving TLS endpoint address")?
            .next()
            .context("no address found for TLS endpoint")?;
        let tcp = tokio::net::TcpStream::connect(addr)
            .await
            .context("connecting to TLS endpoint")?;
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .context("invalid SNI hostname")?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .context("TLS handshake failed")?;

        let (_, session) = tls_stream.get_ref();
        let der = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .context("no peer certificate presented")?;
        let fp = to_hex(&Sha256::digest(der.as_ref()));
        Ok::<String, anyhow::Error>(fp)
    };

    match timeout(Duration::from_secs(timeout_secs), attempt).await {
        Ok(Ok(fp)) => {
            detail["fingerprint"] = json!(fp);
            let mismatch = if fingerprint.is_empty() {
                false
            } else {
                !fp.eq_ignore_ascii_case(fingerprint)
            };
            (mismatch, detail)
        }
        Ok(Err(err)) => {
            detail["error"] = json!(err.to_string());
            (true, detail)
        }
        Err(_) => {
            detail["error"] = json!("timed out");
            (true, detail)
        }
    }
}

/// Number of sampled names whose system-resolver answer disagrees with the
/// configured reference resolver, along with the detail blob.
async fn probe_dns_compare(
    sample_names: &[String],
    reference: &str,
    timeout_secs: u64,
) -> (u32, serde_json::Value) {
    let mut mismatches = 0u32;
    let mut results = Vec::new();

    let resolver_opts = {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(timeout_secs);
        opts
    };
    let reference_ip: std::net::IpAddr = reference
        .parse()
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::new(9, 9, 9, 9)));
    let reference_config = ResolverConfig::from_parts(
        None,
        vec![],
        NameServerConfigGroup::from_ips_clear(&[reference_ip], 53, true),
    );
    let reference_resolver = TokioAsyncResolver::tokio(reference_config, resolver_opts.clone());
    let system_resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(err) => {
            log::warn!("could not read system resolver config, falling back to a public resolver: {err}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), resolver_opts)
        }
    };

    for name in sample_names {
        let default_ips: std::collections::BTreeSet<String> =
            match timeout(Duration::from_secs(timeout_secs), system_resolver.lookup_ip(name.as_str())).await {
                Ok(Ok(lookup)) => lookup.iter().map(|ip| ip.to_string()).collect(),
                Ok(Err(err)) => {
                    results.push(json!({ "name": name, "error": err.to_string() }));
                    mismatches += 1;
                    continue;
                }
                Err(_) => {
                    results.push(json!({ "name": name, "error": "timed out" }));
                    mismatches += 1;
                    continue;
                }
            };

        let ref_ips: std::collections::BTreeSet<String> =
            match timeout(Duration::from_secs(timeout_secs), reference_resolver.lookup_ip(name.as_str())).await {
                Ok(Ok(lookup)) => lookup.iter().map(|ip| ip.to_string()).collect(),
                _ => default_ips.clone(),
            };

        if default_ips != ref_ips {
            mismatches += 1;
        }
        results.push(json!({
            "name": name,
            "default": default_ips.iter().collect::<Vec<_>>(),
            "ref": ref_ips.iter().collect::<Vec<_>>(),
        }));
    }

    (mismatches, json!({ "reference": reference, "results": results, "mismatches": mismatches }))
}

/// `true` if the default route does not egress via `upstream`.
async fn probe_route(upstream: &str) -> (bool, serde_json::Value) {
    let mut detail = json!({ "upstream": upstream });
    let output = match Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await
    {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            detail["error"] = json!(String::from_utf8_lossy(&out.stderr).to_string());
            return (true, detail);
        }
        Err(err) => {
            detail["error"] = json!(err.to_string());
            return (true, detail);
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    detail["routes"] = json!(lines);
    let dev_token = format!("dev {upstream}");
    let anomaly = !lines.iter().any(|line| line.contains(&dev_token));
    (anomaly, detail)
}

/// Run every configured TLS pin concurrently, folding the per-pin mismatch
/// flags with a logical OR.
async fn probe_all_tls_pins(cfg: &Config) -> (bool, Vec<serde_json::Value>) {
    let futures = cfg
        .probes
        .tls
        .iter()
        .map(|entry| probe_tls_endpoint(&entry.host, entry.port, &entry.fingerprint_sha256, entry.timeout_secs));
    let results = futures::future::join_all(futures).await;
    results.into_iter().fold((false, Vec::new()), |(mismatch, mut details), (m, detail)| {
        details.push(detail);
        (mismatch || m, details)
    })
}

/// Run all four probes concurrently inside one `PROBE`-entry run, each
/// independently timed out, and the whole run additionally bounded by the
/// configured probe window so a single stuck probe cannot stall a tick.
pub async fn run_all(cfg: &Config, upstream: &str) -> Result<ProbeOutcome> {
    let captive_cfg = &cfg.probes.captive_portal;
    let dns_cfg = &cfg.probes.dns_compare;
    let window = Duration::from_secs_f64(cfg.state_machine.probe_window_sec.max(1.0));

    let run = async {
        let captive_fut = probe_captive_portal(&captive_cfg.url, captive_cfg.timeout_secs, captive_cfg.retries);
        let tls_fut = probe_all_tls_pins(cfg);
        let dns_fut = async {
            if dns_cfg.enabled {
                probe_dns_compare(&dns_cfg.sample_names, &dns_cfg.reference_resolver, dns_cfg.timeout_secs).await
            } else {
                (0, json!({}))
            }
        };
        let route_fut = probe_route(upstream);
        tokio::join!(captive_fut, tls_fut, dns_fut, route_fut)
    };

    let ((captive, captive_detail), (tls_mismatch, tls_details), (dns_mismatch, dns_detail), (route_anomaly, route_detail)) =
        timeout(window, run)
            .await
            .unwrap_or_else(|_| ((true, json!({"error": "probe window elapsed"})), (false, Vec::new()), (0, json!({})), (false, json!({}))));

    Ok(ProbeOutcome {
        captive_portal: captive,
        tls_mismatch,
        dns_mismatch,
        route_anomaly,
        details: json!({
            "captive": captive_detail,
            "tls": tls_details,
            "dns": dns_detail,
            "route": route_detail,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_route_no_default_route() {
        // "upstream999" never matches any real interface name, so this
        // exercises the anomaly=true path without touching the network.
        let (anomaly, detail) = probe_route("upstream999-does-not-exist").await;
        assert!(anomaly);
        assert_eq!(detail["upstream"], "upstream999-does-not-exist");
    }

    #[tokio::test]
    async fn test_probe_dns_compare_disabled_path_not_invoked() {
        // run_all should skip DNS compare entirely when disabled; this is
        // covered indirectly via the Config default in types.rs tests.
        let cfg = crate::types::DnsCompareConfig::default();
        assert!(!cfg.enabled);
    }

    #[tokio::test]
    async fn test_probe_tls_endpoint_empty_fingerprint_never_mismatches_on_success() {
        // Without a reachable TLS endpoint this exercises only the
        // connection-failure branch, which always reports a mismatch; a
        // genuine handshake test belongs in integration tests with network
        // access.
        let (mismatch, detail) = probe_tls_endpoint("198.51.100.1", 443, "", 1).await;
        assert!(mismatch);
        assert!(detail.get("error").is_some());
    }

    #[tokio::test]
    async fn test_run_all_completes_within_probe_window_with_no_tls_pins() {
        // No TLS pins configured and DNS compare disabled by default, so this
        // exercises the tokio::join! wiring without needing network access
        // for anything but the captive-portal GET and the default-route check.
        let mut cfg = crate::types::Config {
            interfaces: crate::types::InterfacesConfig {
                upstream: "upstream999-does-not-exist".to_string(),
                downstream: "eth1".to_string(),
                mgmt_ip: "10.0.0.1".to_string(),
                mgmt_subnet: "10.0.0.0/24".to_string(),
                gateway_ip: None,
            },
            paths: Default::default(),
            dnsmasq: Default::default(),
            state_machine: Default::default(),
            probes: Default::default(),
            policy: Default::default(),
            status_api: Default::default(),
            suricata: Default::default(),
            deception: Default::default(),
        };
        cfg.state_machine.probe_window_sec = 2.0;
        cfg.probes.captive_portal.timeout_secs = 1;
        cfg.probes.captive_portal.retries = 0;
        cfg.probes.captive_portal.url = "http://198.51.100.1/".to_string();
        let outcome = run_all(&cfg, "upstream999-does-not-exist").await.unwrap();
        assert!(outcome.route_anomaly);
    }
}
