// First-minute network defense controller entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fmc::config::{load_config, RuntimePaths};
use fmc::controller::Controller;
use fmc::nft::NftManager;
use fmc::state_file;
use fmc::probes;
use fmc::tc::TcManager;
use fmc::types::Stage;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_CONFIG_PATH: &str = "/etc/azazel-zero/first_minute.toml";

#[derive(Parser)]
#[command(name = "fmcd")]
#[command(about = "First-minute network defense controller for untrusted upstream Wi-Fi links")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller loop
    Start {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_dns_start: bool,
        #[arg(long, conflicts_with = "foreground")]
        daemonize: bool,
        #[arg(long)]
        foreground: bool,
        #[arg(long)]
        pretty_console: bool,
    },
    /// SIGTERM the process recorded in the PID file
    Stop,
    /// Print the PID and GET the status endpoint
    Status,
    /// Run probes once and dump JSON
    ProbeNow,
    /// Apply enforcement for a stage without running the state machine
    ForceState {
        /// PROBE | DEGRADED | NORMAL | CONTAIN | DECEPTION
        stage: String,
    },
    /// Render the packet-filter template and list per-stage shaping
    DryRun,
    /// Flush tables, qdiscs, and optionally kill the DNS child
    Cleanup {
        #[arg(long)]
        kill_dnsmasq: bool,
    },
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("fmcd")
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;
    let paths = RuntimePaths::resolve(&cfg);

    match args.command {
        Commands::Start {
            dry_run,
            no_dns_start,
            daemonize: _,
            foreground: _,
            pretty_console,
        } => {
            log::info!("starting first-minute controller");
            log::info!(
                "upstream={} downstream={} mgmt={}",
                cfg.interfaces.upstream,
                cfg.interfaces.downstream,
                cfg.interfaces.mgmt_ip
            );
            log::info!(
                "stage thresholds: normal<={} degrade>={} contain>={} decay={}/s",
                cfg.state_machine.normal_threshold,
                cfg.state_machine.degrade_threshold,
                cfg.state_machine.contain_threshold,
                cfg.state_machine.decay_per_sec
            );
            log::info!(
                "probe targets: captive={} tls_pins={} dns_compare={}",
                cfg.probes.captive_portal.url,
                cfg.probes.tls.len(),
                cfg.probes.dns_compare.enabled
            );
            let controller = Controller::new(cfg, paths.clone(), dry_run, no_dns_start, pretty_console);
            if let Err(err) = controller.preflight().await {
                let msg = err.to_string();
                eprintln!("{msg}");
                if msg.contains("requires root") {
                    std::process::exit(1);
                }
                std::process::exit(2);
            }
            if let Err(err) = state_file::write_pid_file(&paths.pid_file) {
                log::warn!("could not write pid file: {err}");
            }
            let result = controller.start().await;
            state_file::cleanup(&paths.pid_file);
            result
        }
        Commands::Stop => {
            let Some(pid) = state_file::read_pid(&paths.pid_file) else {
                eprintln!("no pid file at {}", paths.pid_file.display());
                std::process::exit(2);
            };
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            )
            .context("sending SIGTERM")?;
            println!("sent SIGTERM to pid {pid}");
            Ok(())
        }
        Commands::Status => {
            match state_file::read_pid(&paths.pid_file) {
                Some(pid) => println!("pid: {pid}"),
                None => println!("pid: (not running)"),
            }
            let url = format!("http://{}:{}/", cfg.status_api.host, cfg.status_api.port);
            match reqwest::get(&url).await {
                Ok(resp) => {
                    let body = resp.text().await.unwrap_or_default();
                    println!("{body}");
                }
                Err(err) => {
                    eprintln!("status endpoint unreachable: {err}");
                    std::process::exit(2);
                }
            }
            Ok(())
        }
        Commands::ProbeNow => {
            let outcome = probes::run_all(&cfg, &cfg.interfaces.upstream).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::ForceState { stage } => {
            let stage = Stage::from_str(&stage)?;
            let nft = NftManager::new(
                cfg.paths.nft_template.clone(),
                cfg.interfaces.upstream.clone(),
                cfg.interfaces.downstream.clone(),
                cfg.interfaces.mgmt_ip.clone(),
                cfg.interfaces.mgmt_subnet.clone(),
                cfg.policy.probe_allow_ttl,
                cfg.policy.dynamic_allow_ttl,
            );
            let tc = TcManager::new(cfg.interfaces.downstream.clone(), cfg.interfaces.upstream.clone());
            nft.set_stage(stage).await?;
            tc.apply(stage).await;
            println!("forced stage -> {}", stage.as_str());
            Ok(())
        }
        Commands::DryRun => {
            let nft = NftManager::new(
                cfg.paths.nft_template.clone(),
                cfg.interfaces.upstream.clone(),
                cfg.interfaces.downstream.clone(),
                cfg.interfaces.mgmt_ip.clone(),
                cfg.interfaces.mgmt_subnet.clone(),
                cfg.policy.probe_allow_ttl,
                cfg.policy.dynamic_allow_ttl,
            );
            println!("{}", nft.render_preview()?);
            println!("--- per-stage shaping ---");
            for stage in [Stage::Probe, Stage::Degraded, Stage::Contain] {
                println!("{}: see src/tc.rs::apply", stage.as_str());
            }
            Ok(())
        }
        Commands::Cleanup { kill_dnsmasq } => {
            let nft = NftManager::new(
                cfg.paths.nft_template.clone(),
                cfg.interfaces.upstream.clone(),
                cfg.interfaces.downstream.clone(),
                cfg.interfaces.mgmt_ip.clone(),
                cfg.interfaces.mgmt_subnet.clone(),
                cfg.policy.probe_allow_ttl,
                cfg.policy.dynamic_allow_ttl,
            );
            let tc = TcManager::new(cfg.interfaces.downstream.clone(), cfg.interfaces.upstream.clone());
            tc.clear().await;
            nft.clear().await;
            if kill_dnsmasq {
                let _ = tokio::process::Command::new("pkill").arg("dnsmasq").status().await;
            }
            state_file::cleanup(&paths.pid_file);
            println!("cleared packet-filter tables and qdiscs");
            Ok(())
        }
    }
}
