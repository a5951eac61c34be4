// Controller loop orchestration

//! Controller loop
//!
//! Ties together the Wi-Fi safety sensor, the probe engine, the stage
//! state machine, and the two enforcement managers into the per-tick
//! control loop described by the reference design: poll -> signals -> step
//! -> apply -> publish, once every 2 seconds.

use crate::config::RuntimePaths;
use crate::dns_observer;
use crate::nft::NftManager;
use crate::probes;
use crate::state_machine::StateMachine;
use crate::status_server::{self, SharedStatus, StatusSnapshot};
use crate::tc::TcManager;
use crate::types::{Config, ProbeOutcome, Signals, Stage};
use crate::wifi_safety;
use anyhow::{Context, Result};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};

const TICK_PERIOD: Duration = Duration::from_secs(2);
const WIFI_CAPTURE_DURATION: Duration = Duration::from_secs(3);
const SURICATA_FRESHNESS: Duration = Duration::from_secs(30);

pub struct Controller {
    cfg: Config,
    dry_run: bool,
    no_dns_start: bool,
    pretty_console: bool,
    state_machine: StateMachine,
    current_stage: Stage,
    last_probe: Option<ProbeOutcome>,
    nft: Arc<NftManager>,
    tc: TcManager,
    status: SharedStatus,
    paths: RuntimePaths,
    dnsmasq_child: Option<tokio::process::Child>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    dns_observer_handle: Option<tokio::task::JoinHandle<()>>,
    status_server_handle: Option<tokio::task::JoinHandle<()>>,
    last_console: Instant,
}

impl Controller {
    pub fn new(cfg: Config, paths: RuntimePaths, dry_run: bool, no_dns_start: bool, pretty_console: bool) -> Self {
        let nft = Arc::new(NftManager::new(
            cfg.paths.nft_template.clone(),
            cfg.interfaces.upstream.clone(),
            cfg.interfaces.downstream.clone(),
            cfg.interfaces.mgmt_ip.clone(),
            cfg.interfaces.mgmt_subnet.clone(),
            cfg.policy.probe_allow_ttl,
            cfg.policy.dynamic_allow_ttl,
        ));
        let tc = TcManager::new(cfg.interfaces.downstream.clone(), cfg.interfaces.upstream.clone());
        let state_machine = StateMachine::new(cfg.state_machine);
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            state_machine,
            current_stage: Stage::Init,
            last_probe: None,
            nft,
            tc,
            status: Arc::new(RwLock::new(StatusSnapshot::default())),
            paths,
            dnsmasq_child: None,
            stop_tx,
            stop_rx,
            dns_observer_handle: None,
            status_server_handle: None,
            last_console: Instant::now(),
            cfg,
            dry_run,
            no_dns_start,
            pretty_console,
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Require root and the three system tools the enforcement layer
    /// shells out to.
    pub async fn preflight(&self) -> Result<()> {
        if !self.dry_run {
            anyhow::ensure!(is_root(), "preflight: requires root");
        }
        for bin in ["nft", "tc", "ip"] {
            anyhow::ensure!(which(bin), "preflight: missing tool {bin}");
        }
        Ok(())
    }

    async fn apply_sysctl(&self) {
        let cmds: [&[&str]; 3] = [
            &["-w", "net.ipv4.ip_forward=1"],
            &["-w", "net.ipv4.conf.all.rp_filter=1"],
            &["-w", "net.ipv4.conf.default.rp_filter=1"],
        ];
        for args in cmds {
            let _ = Command::new("sysctl").args(args).status().await;
        }
    }

    async fn start_dnsmasq(&mut self) {
        if self.no_dns_start || !self.cfg.dnsmasq.enable {
            return;
        }
        let conf_path = self
            .cfg
            .dnsmasq
            .conf_path
            .clone()
            .unwrap_or_else(|| "/etc/dnsmasq.d/first-minute.conf".to_string());
        match Command::new("dnsmasq")
            .arg(format!("--conf-file={conf_path}"))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => self.dnsmasq_child = Some(child),
            Err(err) => log::warn!("failed to start dnsmasq: {err}"),
        }
    }

    async fn stop_dnsmasq(&mut self) {
        if let Some(mut child) = self.dnsmasq_child.take() {
            let _ = child.start_kill();
            let waited = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
            if waited.is_err() {
                let _ = child.kill().await;
            }
        }
    }

    fn start_dns_observer(&mut self) {
        let nft = self.nft.clone();
        let log_path = self.paths.dns_log.clone();
        let stop_rx = self.stop_rx.clone();
        self.dns_observer_handle = Some(tokio::spawn(async move {
            dns_observer::run(log_path, nft, "allow_dyn_v4", stop_rx).await;
        }));
    }

    fn start_status_api(&mut self) {
        match status_server::spawn(&self.cfg.status_api.host, self.cfg.status_api.port, self.status.clone()) {
            Ok(handle) => self.status_server_handle = Some(handle),
            Err(err) => log::error!("failed to start status API: {err}"),
        }
    }

    async fn apply_stage(&self, stage: Stage) {
        if self.dry_run {
            log::info!("dry-run stage change -> {}", stage.as_str());
            return;
        }
        if self.nft.set_stage(stage).await.is_err() {
            log::warn!("set_stage failed, re-applying base ruleset and retrying");
            if let Err(err) = self.nft.apply_base().await {
                log::error!("apply_base failed during recovery: {err}");
                return;
            }
            let _ = self.nft.set_stage(stage).await;
        }
        self.tc.apply(stage).await;
    }

    async fn seed_probe_destinations(&self) {
        let mut hosts = Vec::new();
        for entry in &self.cfg.probes.tls {
            hosts.push(entry.host.clone());
        }
        if let Ok(url) = reqwest::Url::parse(&self.cfg.probes.captive_portal.url) {
            if let Some(host) = url.host_str() {
                hosts.push(host.to_string());
            }
        }

        let mut ips = Vec::new();
        for host in hosts {
            if let Ok(addrs) = (host.as_str(), 0u16).to_socket_addrs() {
                for addr in addrs {
                    ips.push(addr.ip().to_string());
                }
            }
        }
        dns_observer::seed_probe_ips(&self.nft, &ips).await;
    }

    pub async fn start(mut self) -> Result<()> {
        self.preflight().await?;
        if !self.dry_run {
            self.apply_sysctl().await;
            self.nft.apply_base().await.context("applying base ruleset")?;
            self.apply_stage(Stage::Probe).await;
            self.start_dnsmasq().await;
            self.start_dns_observer();
            self.start_status_api();
            self.seed_probe_destinations().await;
        }
        self.run_loop().await
    }

    async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        self.stop_dnsmasq().await;
        if let Some(handle) = self.status_server_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.dns_observer_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
        }
        if !self.dry_run {
            self.tc.clear().await;
            self.nft.clear().await;
        }
    }

    fn suricata_bumped(&self) -> bool {
        if !self.cfg.suricata.enabled {
            return false;
        }
        let Some(path) = &self.cfg.suricata.eve_path else {
            return false;
        };
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        modified.elapsed().map(|age| age < SURICATA_FRESHNESS).unwrap_or(false)
    }

    /// Poll the Wi-Fi sensor and, if the BSSID changed, reset the machine
    /// onto a fresh PROBE run.
    async fn poll_wifi(&mut self, now: Instant) -> (crate::types::WifiSafety, bool) {
        let known_db = wifi_safety::load_known_db(self.cfg.paths.known_db.as_deref().unwrap_or(""));
        let safety = wifi_safety::evaluate(
            &self.cfg.interfaces.upstream,
            &known_db,
            self.cfg.interfaces.gateway_ip.as_deref(),
            WIFI_CAPTURE_DURATION,
        )
        .await;

        let mut new_link = false;
        if safety.link.connected
            && !safety.link.bssid.is_empty()
            && safety.link.bssid != self.state_machine.last_link_bssid()
        {
            self.state_machine.reset_for_new_link(safety.link.bssid.clone(), now);
            self.current_stage = Stage::Probe;
            new_link = true;
        }
        (safety, new_link)
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut probe_done = false;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

        loop {
            let dns_observer_died = async {
                match self.dns_observer_handle.as_mut() {
                    Some(handle) => {
                        let _ = handle.await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    log::info!("received SIGTERM");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("received SIGINT");
                    break;
                }
                _ = dns_observer_died => {
                    log::error!("DNS observer task exited unexpectedly, shutting down");
                    self.dns_observer_handle = None;
                    break;
                }
                _ = tokio::time::sleep(TICK_PERIOD) => {}
            }

            let now = Instant::now();
            let (safety, new_link) = self.poll_wifi(now).await;
            if new_link {
                probe_done = false;
            }

            let mut signals = Signals {
                link_up: safety.link.connected,
                bssid: if safety.link.bssid.is_empty() {
                    None
                } else {
                    Some(safety.link.bssid.clone())
                },
                wifi_tags: !safety.tags.is_empty(),
                ..Default::default()
            };

            if self.current_stage == Stage::Probe && safety.link.connected && !probe_done {
                match probes::run_all(&self.cfg, &self.cfg.interfaces.upstream).await {
                    Ok(outcome) => {
                        signals.probe_fail = outcome.captive_portal || outcome.tls_mismatch;
                        signals.probe_fail_count = 1 + outcome.dns_mismatch;
                        signals.dns_mismatch = outcome.dns_mismatch;
                        signals.cert_mismatch = outcome.tls_mismatch;
                        signals.route_anomaly = outcome.route_anomaly;
                        self.last_probe = Some(outcome);
                    }
                    Err(err) => log::warn!("probe run failed: {err}"),
                }
                probe_done = true;
            }

            if self.suricata_bumped() {
                signals.suricata_alert = true;
            }

            let (mut state, summary) = self.state_machine.step(&signals, now);
            if state == Stage::Contain
                && self.cfg.deception.enable_if_opencanary_present
                && std::path::Path::new(&self.cfg.deception.opencanary_cfg).exists()
            {
                state = Stage::Deception;
            }

            if state != self.current_stage {
                self.current_stage = state;
                probe_done = state != Stage::Probe;
                self.apply_stage(state).await;
            }

            let snapshot_json = {
                let mut snapshot = self.status.write().await;
                snapshot.state = state.as_str().to_string();
                snapshot.suspicion = summary.suspicion;
                snapshot.reason = summary.reason.clone();
                snapshot.wifi = serde_json::to_value(&safety).unwrap_or_default();
                snapshot.last_probe = self.last_probe.as_ref().map(|p| p.details.clone());
                serde_json::to_string(&*snapshot).unwrap_or_default()
            };

            if self.pretty_console {
                self.render_console(state, &summary, &safety);
            }
            log::info!("{snapshot_json}");
        }

        self.stop().await;
        Ok(())
    }

    fn render_console(&mut self, state: Stage, summary: &crate::state_machine::StepSummary, safety: &crate::types::WifiSafety) {
        if self.last_console.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.last_console = Instant::now();
        let bar_len = ((summary.suspicion / 5.0) as usize).min(20);
        let bar: String = "#".repeat(bar_len) + &".".repeat(20 - bar_len);
        print!("\x1b[2J\x1b[H");
        println!("First-Minute Control");
        println!("State: {:<8}  Suspicion: {:>5.1} [{bar}]", state.as_str(), summary.suspicion);
        println!("Reason: {}", summary.reason);
        println!("Wi-Fi: ssid={} bssid={}", safety.link.ssid, safety.link.bssid);
        if !safety.tags.is_empty() {
            println!("Wi-Fi tags: {}", safety.tags.join(","));
        }
        if let Some(probe) = &self.last_probe {
            println!(
                "Probe: captive={} tls_mismatch={} dns_mismatch={}",
                probe.captive_portal, probe.tls_mismatch, probe.dns_mismatch
            );
        }
    }
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn which(bin: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file()))
        .unwrap_or(false)
}
