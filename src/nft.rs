// Packet-filter manager

//! Packet-filter manager
//!
//! Owns the base `nftables` ruleset, the stage-switch connection-mark
//! chain, and the two timed allow-sets (`allow_probe_v4` for seeded probe
//! hosts, `allow_dyn_v4` for DNS-observed destinations). All mutation goes
//! through `nft` subprocess invocations, matching how the reference
//! implementation drives the kernel's packet filter.

use crate::types::Stage;
use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const FALLBACK_TEMPLATE: &str = include_str!("../templates/first_minute.nft");

pub struct NftManager {
    template_path: Option<String>,
    upstream: String,
    downstream: String,
    mgmt_ip: String,
    mgmt_subnet: String,
    probe_ttl: u32,
    dynamic_ttl: u32,
}

impl NftManager {
    pub fn new(
        template_path: Option<String>,
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        mgmt_ip: impl Into<String>,
        mgmt_subnet: impl Into<String>,
        probe_ttl: u32,
        dynamic_ttl: u32,
    ) -> Self {
        Self {
            template_path,
            upstream: upstream.into(),
            downstream: downstream.into(),
            mgmt_ip: mgmt_ip.into(),
            mgmt_subnet: mgmt_subnet.into(),
            probe_ttl,
            dynamic_ttl,
        }
    }

    fn raw_template(&self) -> Result<String> {
        match &self.template_path {
            Some(path) if std::path::Path::new(path).is_file() => {
                std::fs::read_to_string(path).context("reading packet-filter template")
            }
            _ => Ok(FALLBACK_TEMPLATE.to_string()),
        }
    }

    /// Substitute all `@TOKEN@` placeholders and return the rendered
    /// ruleset text.
    pub fn render_preview(&self) -> Result<String> {
        let mut text = self.raw_template()?;
        for (token, value) in [
            ("@UPSTREAM@", self.upstream.clone()),
            ("@DOWNSTREAM@", self.downstream.clone()),
            ("@MGMT_IP@", self.mgmt_ip.clone()),
            ("@MGMT_SUBNET@", self.mgmt_subnet.clone()),
            ("@PROBE_TTL@", format!("{}s", self.probe_ttl)),
            ("@DYNAMIC_TTL@", format!("{}s", self.dynamic_ttl)),
        ] {
            text = text.replace(token, &value);
        }
        Ok(text)
    }

    /// Load the rendered ruleset as a single atomic `nft -f -` transaction.
    pub async fn apply_base(&self) -> Result<()> {
        let rendered = self.render_preview()?;
        let mut child = Command::new("nft")
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning nft")?;

        child
            .stdin
            .take()
            .context("nft stdin unavailable")?
            .write_all(rendered.as_bytes())
            .await
            .context("writing ruleset to nft")?;

        let output = child.wait_with_output().await.context("waiting for nft")?;
        anyhow::ensure!(
            output.status.success(),
            "nft -f - failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(())
    }

    /// Flush and re-append the single `ct mark set N` rule for `stage`.
    /// Reentrant: if the chain is missing (e.g. after an external flush),
    /// the caller should `apply_base` and retry.
    pub async fn set_stage(&self, stage: Stage) -> Result<()> {
        let _ = Command::new("nft")
            .args(["flush", "chain", "inet", "azazel_fmc", "stage_switch"])
            .status()
            .await;

        let mark = stage.mark().to_string();
        let status = Command::new("nft")
            .args([
                "add", "rule", "inet", "azazel_fmc", "stage_switch", "ct", "mark", "set", &mark,
            ])
            .status()
            .await
            .context("running nft add rule")?;
        anyhow::ensure!(status.success(), "nft add rule (stage_switch) failed");
        Ok(())
    }

    /// Add `ip` to `set_name` with an optional timeout (seconds). IPv6
    /// addresses are dropped silently — the allow-sets are v4-only.
    pub async fn add_ip(&self, ip: &str, set_name: &str, ttl_secs: Option<u32>) {
        if ip.contains(':') {
            return;
        }
        let element = match ttl_secs {
            Some(ttl) => format!("{{ {ip} timeout {ttl}s }}"),
            None => format!("{{ {ip} }}"),
        };
        let _ = Command::new("nft")
            .args(["add", "element", "inet", "azazel_fmc", set_name, &element])
            .status()
            .await;
    }

    /// Flush both tables. Best-effort: errors are swallowed, matching the
    /// reference implementation's shutdown behavior.
    pub async fn clear(&self) {
        let _ = Command::new("nft")
            .args(["flush", "table", "inet", "azazel_fmc"])
            .status()
            .await;
        let _ = Command::new("nft")
            .args(["flush", "table", "ip", "nat_azazel_fmc"])
            .status()
            .await;
    }
}
