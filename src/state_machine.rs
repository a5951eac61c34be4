// Stage state machine for the first-minute controller

//! Suspicion-driven stage state machine
//!
//! This module implements the state machine that mediates transitions
//! between `INIT`, `PROBE`, `DEGRADED`, `NORMAL`, and `CONTAIN` based on a
//! continuous suspicion score accumulated from signals observed each tick.
//! `DECEPTION` is a `CONTAIN`-equivalent effective stage applied by the
//! controller, never produced by this machine directly (see
//! [`crate::controller`]).

use crate::types::{Signals, Stage, StageMachineConfig};
use serde::Serialize;
use std::time::Instant;

/// Internal mutable context for the running machine.
#[derive(Debug, Clone)]
struct StageContext {
    state: Stage,
    suspicion: f64,
    last_transition: Instant,
    stable_since: Instant,
    probe_started: Instant,
    last_link_bssid: String,
    last_reason: String,
}

impl StageContext {
    fn new(now: Instant) -> Self {
        Self {
            state: Stage::Init,
            suspicion: 0.0,
            last_transition: now,
            stable_since: now,
            probe_started: now,
            last_link_bssid: String::new(),
            last_reason: "init".to_string(),
        }
    }
}

/// Per-step output: effective state, rounded suspicion, and the comma-joined
/// list of reasons that fired this step (or the last stored reason if none
/// fired).
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub state: String,
    pub suspicion: f64,
    pub reason: String,
}

pub struct StateMachine {
    ctx: StageContext,
    cfg: StageMachineConfig,
}

impl StateMachine {
    pub fn new(cfg: StageMachineConfig) -> Self {
        Self::with_clock(cfg, Instant::now())
    }

    /// Construct with an explicit starting instant, so tests can drive
    /// `step` with fully deterministic elapsed durations.
    pub fn with_clock(cfg: StageMachineConfig, now: Instant) -> Self {
        Self {
            ctx: StageContext::new(now),
            cfg,
        }
    }

    pub fn state(&self) -> Stage {
        self.ctx.state
    }

    pub fn suspicion(&self) -> f64 {
        self.ctx.suspicion
    }

    pub fn last_link_bssid(&self) -> &str {
        &self.ctx.last_link_bssid
    }

    /// Reset the machine for a newly observed BSSID: `PROBE`, suspicion
    /// zeroed, all timestamps rebased to `now`.
    pub fn reset_for_new_link(&mut self, bssid: impl Into<String>, now: Instant) {
        self.ctx.state = Stage::Probe;
        self.ctx.suspicion = 0.0;
        self.ctx.last_transition = now;
        self.ctx.probe_started = now;
        self.ctx.stable_since = now;
        self.ctx.last_link_bssid = bssid.into();
        self.ctx.last_reason = "new_link".to_string();
    }

    /// Force the machine directly into `stage`, bypassing signal-driven
    /// transitions. Used by the `force-state` CLI subcommand.
    pub fn force_state(&mut self, stage: Stage, reason: &str, now: Instant) -> Stage {
        self.ctx.state = stage;
        self.ctx.last_transition = now;
        self.ctx.stable_since = now;
        self.ctx.last_reason = reason.to_string();
        stage
    }

    fn decay(&mut self, now: Instant) {
        let dt = now
            .saturating_duration_since(self.ctx.last_transition)
            .as_secs_f64();
        self.ctx.suspicion = (self.ctx.suspicion - self.cfg.decay_per_sec * dt).max(0.0);
        self.ctx.last_transition = now;
    }

    fn apply_signals(&mut self, signals: &Signals, reasons: &mut Vec<&'static str>) {
        let mut add = 0.0;
        if signals.probe_fail {
            add += 15.0 * signals.probe_fail_count.max(1) as f64;
            reasons.push("probe_fail");
        }
        if signals.dns_mismatch > 0 {
            add += 10.0 * signals.dns_mismatch as f64;
            reasons.push("dns_mismatch");
        }
        if signals.cert_mismatch {
            add += 25.0;
            reasons.push("cert_mismatch");
        }
        if signals.wifi_tags {
            add += 20.0;
            reasons.push("wifi_tags");
        }
        if signals.route_anomaly {
            add += 10.0;
            reasons.push("route_anomaly");
        }
        if signals.suricata_alert {
            add += 15.0;
            reasons.push("suricata_alert");
        }
        self.ctx.suspicion = (self.ctx.suspicion + add).min(100.0);
    }

    /// Step the machine forward with the given tick signals at `now`.
    ///
    /// Decay and signal weighting apply unconditionally (even on a
    /// `link_up=false` tick); the link-down transition then overrides the
    /// resulting suspicion back to zero. This mirrors the reference
    /// implementation exactly.
    pub fn step(&mut self, signals: &Signals, now: Instant) -> (Stage, StepSummary) {
        let mut reasons: Vec<&'static str> = Vec::new();
        self.decay(now);
        self.apply_signals(signals, &mut reasons);

        if !signals.link_up && self.ctx.state != Stage::Init {
            self.ctx.state = Stage::Init;
            self.ctx.suspicion = 0.0;
            self.ctx.last_reason = "link_down".to_string();
            self.ctx.last_transition = now;
            return (
                Stage::Init,
                StepSummary {
                    state: Stage::Init.as_str().to_string(),
                    suspicion: 0.0,
                    reason: "link_down".to_string(),
                },
            );
        }

        let cfg = self.cfg;
        let elapsed_probe = now
            .saturating_duration_since(self.ctx.probe_started)
            .as_secs_f64();
        let mut state = self.ctx.state;
        let mut changed = false;

        match state {
            Stage::Init if signals.link_up => {
                let bssid = signals.bssid.clone().unwrap_or_default();
                self.reset_for_new_link(bssid, now);
                state = self.ctx.state;
                changed = true;
            }
            Stage::Probe => {
                if self.ctx.suspicion >= cfg.contain_threshold {
                    state = Stage::Contain;
                    changed = true;
                    self.ctx.last_reason = "probe->contain".to_string();
                } else if self.ctx.suspicion >= cfg.degrade_threshold
                    && elapsed_probe >= cfg.stable_probe_sec
                {
                    state = Stage::Degraded;
                    changed = true;
                    self.ctx.last_reason = "probe->degraded".to_string();
                    self.ctx.stable_since = now;
                } else if elapsed_probe >= cfg.probe_window_sec
                    && self.ctx.suspicion <= cfg.normal_threshold
                {
                    state = Stage::Normal;
                    changed = true;
                    self.ctx.last_reason = "probe->normal".to_string();
                    self.ctx.stable_since = now;
                }
            }
            Stage::Degraded => {
                if self.ctx.suspicion >= cfg.contain_threshold {
                    state = Stage::Contain;
                    changed = true;
                    self.ctx.last_reason = "degraded->contain".to_string();
                } else if self.ctx.suspicion <= cfg.normal_threshold {
                    if now
                        .saturating_duration_since(self.ctx.stable_since)
                        .as_secs_f64()
                        >= cfg.stable_normal_sec
                    {
                        state = Stage::Normal;
                        changed = true;
                        self.ctx.last_reason = "degraded->normal".to_string();
                    }
                } else {
                    // Noise between normal_threshold and degrade_threshold
                    // restarts the "normal" stability window. Preserved
                    // intentionally; see DESIGN.md.
                    self.ctx.stable_since = now;
                }
            }
            Stage::Normal => {
                if self.ctx.suspicion >= cfg.contain_threshold {
                    state = Stage::Contain;
                    changed = true;
                    self.ctx.last_reason = "normal->contain".to_string();
                } else if self.ctx.suspicion >= cfg.degrade_threshold {
                    state = Stage::Degraded;
                    changed = true;
                    self.ctx.last_reason = "normal->degraded".to_string();
                    self.ctx.stable_since = now;
                }
            }
            Stage::Contain if signals.allow_recover => {
                if self.ctx.suspicion <= cfg.degrade_threshold {
                    state = Stage::Degraded;
                    changed = true;
                    self.ctx.last_reason = "contain->degraded".to_string();
                }
            }
            _ => {}
        }

        if changed {
            self.ctx.state = state;
            self.ctx.last_transition = now;
        }

        let reason = if reasons.is_empty() {
            self.ctx.last_reason.clone()
        } else {
            reasons.join(",")
        };

        let summary = StepSummary {
            state: self.ctx.state.as_str().to_string(),
            suspicion: round2(self.ctx.suspicion),
            reason,
        };
        (self.ctx.state, summary)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg() -> StageMachineConfig {
        StageMachineConfig::default()
    }

    fn signals_link_up() -> Signals {
        Signals {
            link_up: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_state_is_init() {
        let sm = StateMachine::new(cfg());
        assert_eq!(sm.state(), Stage::Init);
        assert_eq!(sm.suspicion(), 0.0);
    }

    #[test]
    fn test_link_up_from_init_enters_probe() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        let mut sig = signals_link_up();
        sig.bssid = Some("AA:BB".to_string());
        let (state, _summary) = sm.step(&sig, t0);
        assert_eq!(state, Stage::Probe);
        assert_eq!(sm.suspicion(), 0.0);
        assert_eq!(sm.last_link_bssid(), "AA:BB");
    }

    #[test]
    fn test_reset_for_new_link_invariants() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.reset_for_new_link("11:22:33", t0 + Duration::from_secs(5));
        assert_eq!(sm.state(), Stage::Probe);
        assert_eq!(sm.suspicion(), 0.0);
        assert_eq!(sm.last_link_bssid(), "11:22:33");
    }

    #[test]
    fn test_scenario_clean_wifi_reaches_normal() {
        // End-to-end scenario 1: clean Wi-Fi, all probes negative.
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        let mut sig = signals_link_up();
        sig.bssid = Some("AA:BB".to_string());
        let (state, _) = sm.step(&sig, t0);
        assert_eq!(state, Stage::Probe);

        // Advance past the probe window with no adverse signals.
        let quiet = Signals {
            link_up: true,
            ..Default::default()
        };
        let (state, summary) = sm.step(&quiet, t0 + Duration::from_secs(21));
        assert_eq!(state, Stage::Normal);
        assert!(summary.suspicion <= 8.0);
    }

    #[test]
    fn test_scenario_captive_portal_reaches_degraded() {
        // End-to-end scenario 2.
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        let mut link = signals_link_up();
        link.bssid = Some("AA:BB".to_string());
        sm.step(&link, t0);

        let mut sig = signals_link_up();
        sig.probe_fail = true;
        sig.probe_fail_count = 3;
        sig.dns_mismatch = 1;
        let (state, summary) = sm.step(&sig, t0 + Duration::from_millis(100));
        // 15*3 + 10*1 = 55, still below contain (65) and below
        // stable_probe_sec elapsed, so we stay in PROBE this tick.
        assert_eq!(state, Stage::Probe);
        assert_eq!(summary.suspicion, 55.0);

        // After stable_probe_sec has elapsed, decay has eaten into the
        // score but enough survives above degrade_threshold.
        let (state, summary) = sm.step(&signals_link_up(), t0 + Duration::from_secs(10));
        assert_eq!(state, Stage::Degraded);
        assert!(summary.suspicion >= 30.0);
    }

    #[test]
    fn test_scenario_evil_twin_escalates_to_contain() {
        // End-to-end scenario 3.
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        let mut link = signals_link_up();
        link.bssid = Some("aa:bb:cc:dd:ee:ff".to_string());
        sm.step(&link, t0);

        let mut sig = signals_link_up();
        sig.wifi_tags = true; // evil_ap, mitm
        sig.cert_mismatch = true;
        let (_, summary) = sm.step(&sig, t0 + Duration::from_millis(1));
        assert_eq!(summary.suspicion, 45.0);

        let mut sig2 = signals_link_up();
        sig2.probe_fail = true;
        sig2.probe_fail_count = 1;
        let (_, summary) = sm.step(&sig2, t0 + Duration::from_millis(2));
        assert_eq!(summary.suspicion, 60.0);

        let mut sig3 = signals_link_up();
        sig3.wifi_tags = true;
        sig3.suricata_alert = true;
        let (state, summary) = sm.step(&sig3, t0 + Duration::from_millis(3));
        assert_eq!(summary.suspicion, 95.0);
        assert_eq!(state, Stage::Contain);
    }

    #[test]
    fn test_scenario_recovery_requires_explicit_signal() {
        // End-to-end scenario 4.
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Contain, "manual", t0);
        // Manually set suspicion via a cert-mismatch tick then decay it away.
        let mut bump = Signals {
            link_up: true,
            cert_mismatch: true,
            ..Default::default()
        };
        bump.probe_fail = true;
        bump.probe_fail_count = 3; // 25 + 45 = 70, saturates toward 70
        let (_, summary) = sm.step(&bump, t0);
        assert!(summary.suspicion >= 65.0);

        let (state, summary) = sm.step(
            &Signals {
                link_up: true,
                ..Default::default()
            },
            t0 + Duration::from_secs(60),
        );
        assert_eq!(state, Stage::Contain);
        assert_eq!(summary.suspicion, 0.0);

        let (state, _) = sm.step(
            &Signals {
                link_up: true,
                allow_recover: true,
                ..Default::default()
            },
            t0 + Duration::from_secs(61),
        );
        assert_eq!(state, Stage::Degraded);
    }

    #[test]
    fn test_no_recovery_from_contain_without_signal() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Contain, "manual", t0);
        for i in 1..20 {
            let (state, _) = sm.step(
                &Signals {
                    link_up: true,
                    ..Default::default()
                },
                t0 + Duration::from_secs(i * 10),
            );
            assert_eq!(state, Stage::Contain);
        }
    }

    #[test]
    fn test_scenario_link_flap() {
        // End-to-end scenario 5.
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Normal, "manual", t0);

        let (state, summary) = sm.step(
            &Signals {
                link_up: false,
                ..Default::default()
            },
            t0 + Duration::from_secs(1),
        );
        assert_eq!(state, Stage::Init);
        assert_eq!(summary.suspicion, 0.0);
        assert_eq!(summary.reason, "link_down");

        let (state, _) = sm.step(
            &Signals {
                link_up: true,
                bssid: Some("XX".to_string()),
                ..Default::default()
            },
            t0 + Duration::from_secs(2),
        );
        assert_eq!(state, Stage::Probe);
    }

    #[test]
    fn test_decay_over_15_seconds_reaches_exactly_zero() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Normal, "manual", t0);
        // Bump suspicion to exactly 30 via a direct decay-free tick.
        let sig = Signals {
            link_up: true,
            wifi_tags: true,
            route_anomaly: true,
            ..Default::default()
        };
        let (_, summary) = sm.step(&sig, t0); // +20 +10 = 30
        assert_eq!(summary.suspicion, 30.0);

        let (_, summary) = sm.step(
            &Signals {
                link_up: true,
                ..Default::default()
            },
            t0 + Duration::from_secs(15),
        );
        assert_eq!(summary.suspicion, 0.0);
    }

    #[test]
    fn test_suspicion_saturates_at_100() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Normal, "manual", t0);
        for i in 0..10 {
            let sig = Signals {
                link_up: true,
                cert_mismatch: true,
                ..Default::default()
            };
            let now = t0 + Duration::from_nanos(i);
            let (_, summary) = sm.step(&sig, now);
            assert!(summary.suspicion <= 100.0);
        }
        assert_eq!(sm.suspicion(), 100.0);
    }

    #[test]
    fn test_suspicion_never_negative() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Normal, "manual", t0);
        let (_, summary) = sm.step(
            &Signals {
                link_up: true,
                ..Default::default()
            },
            t0 + Duration::from_secs(1000),
        );
        assert_eq!(summary.suspicion, 0.0);
    }

    #[test]
    fn test_quiet_ticks_are_monotone_non_increasing() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Normal, "manual", t0);
        sm.step(
            &Signals {
                link_up: true,
                cert_mismatch: true,
                ..Default::default()
            },
            t0,
        );
        let mut last = sm.suspicion();
        for i in 1..10 {
            let (_, summary) = sm.step(
                &Signals {
                    link_up: true,
                    ..Default::default()
                },
                t0 + Duration::from_secs(i),
            );
            assert!(summary.suspicion <= last);
            last = summary.suspicion;
        }
    }

    #[test]
    fn test_force_state_sets_stage_directly() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        let stage = sm.force_state(Stage::Contain, "manual", t0);
        assert_eq!(stage, Stage::Contain);
        assert_eq!(sm.state(), Stage::Contain);
    }

    #[test]
    fn test_degraded_noise_resets_stable_window() {
        let t0 = Instant::now();
        let mut sm = StateMachine::with_clock(cfg(), t0);
        sm.force_state(Stage::Degraded, "manual", t0);
        // Suspicion between normal_threshold (8) and degrade_threshold (30):
        // route_anomaly alone adds 10.
        for i in 1..5 {
            let (state, summary) = sm.step(
                &Signals {
                    link_up: true,
                    route_anomaly: true,
                    ..Default::default()
                },
                t0 + Duration::from_secs(i * 25),
            );
            assert_eq!(state, Stage::Degraded);
            assert!(summary.suspicion > 8.0);
        }
    }
}
