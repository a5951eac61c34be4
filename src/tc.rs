// Traffic-shaping manager

//! Traffic-shaping manager
//!
//! Applies a per-stage `tc` qdisc discipline to the downstream (client-
//! facing) and upstream (Internet-facing) interfaces. `qdisc replace` keeps
//! re-application idempotent; nothing accumulates.

use crate::types::Stage;
use tokio::process::Command;

pub struct TcManager {
    downstream: String,
    upstream: String,
}

impl TcManager {
    pub fn new(downstream: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            downstream: downstream.into(),
            upstream: upstream.into(),
        }
    }

    async fn run(&self, args: &[&str]) {
        let _ = Command::new("tc").args(args).status().await;
    }

    /// Apply the discipline for `stage`. `NORMAL`, `INIT`, and `DECEPTION`
    /// clear any existing shaping (Pi-class hardware can't sustain heavy
    /// queuing, so keep it lightweight everywhere else too).
    pub async fn apply(&self, stage: Stage) {
        match stage {
            Stage::Probe => {
                self.run(&[
                    "qdisc", "replace", "dev", &self.downstream, "root", "handle", "1:", "netem",
                    "delay", "220ms", "100ms",
                ])
                .await;
                self.run(&[
                    "qdisc", "replace", "dev", &self.upstream, "root", "handle", "2:", "tbf",
                    "rate", "1mbit", "burst", "16kbit", "latency", "400ms",
                ])
                .await;
            }
            Stage::Degraded => {
                self.run(&[
                    "qdisc", "replace", "dev", &self.downstream, "root", "handle", "1:", "netem",
                    "delay", "150ms", "50ms", "distribution", "normal",
                ])
                .await;
                self.run(&[
                    "qdisc", "replace", "dev", &self.upstream, "root", "handle", "2:", "tbf",
                    "rate", "2mbit", "burst", "32kbit", "latency", "400ms",
                ])
                .await;
            }
            Stage::Contain => {
                self.run(&[
                    "qdisc", "replace", "dev", &self.downstream, "root", "handle", "1:", "netem",
                    "delay", "400ms", "200ms", "loss", "5%",
                ])
                .await;
                self.run(&[
                    "qdisc", "replace", "dev", &self.upstream, "root", "handle", "2:", "tbf",
                    "rate", "512kbit", "burst", "8kbit", "latency", "600ms",
                ])
                .await;
            }
            Stage::Normal | Stage::Init | Stage::Deception => {
                self.clear().await;
            }
        }
    }

    /// Remove root qdiscs on both interfaces. Best-effort: failures (e.g.
    /// no qdisc present) are non-fatal.
    pub async fn clear(&self) {
        self.run(&["qdisc", "del", "dev", &self.downstream, "root"]).await;
        self.run(&["qdisc", "del", "dev", &self.upstream, "root"]).await;
    }
}
