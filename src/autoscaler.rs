//! Ticker-driven autoscaling
//!
//! Two independent loops mutate the pool through the cluster's serialized
//! scale operations: the request-rate scaler reacts to short traffic spikes
//! by counting requests per window, while the pressure scaler reacts to
//! sustained backend load by sampling per-container CPU and memory.
//! Keeping them separate avoids conflating the two symptoms.

use crate::cluster::Cluster;
use crate::config::{PressureConfig, ScalingConfig};
use crate::docker::ReplicaStats;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Direction a scaler tick settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Up,
    Down,
}

/// Decide from one window's request count whether the pool should change.
pub fn rate_decision(count: i64, replicas: usize, cfg: &ScalingConfig) -> Option<ScaleAction> {
    if count > cfg.scale_up_threshold && replicas < cfg.max_replicas {
        Some(ScaleAction::Up)
    } else if count < cfg.scale_down_threshold && replicas > cfg.min_replicas {
        Some(ScaleAction::Down)
    } else {
        None
    }
}

/// Tally of one pressure sampling round.
#[derive(Debug, Default, Clone, Copy)]
pub struct PressureTally {
    pub over: usize,
    pub under: usize,
    pub valid: usize,
}

impl PressureTally {
    pub fn add(&mut self, sample: &ReplicaStats, cfg: &PressureConfig) {
        self.valid += 1;
        if sample.cpu_percent > cfg.cpu_high || sample.memory_percent > cfg.mem_high {
            self.over += 1;
        }
        if sample.cpu_percent < cfg.cpu_low && sample.memory_percent < cfg.mem_low {
            self.under += 1;
        }
    }
}

/// Decide from a sampling round whether the pool should change. A round
/// with no valid samples never scales.
pub fn pressure_decision(
    tally: PressureTally,
    replicas: usize,
    pressure: &PressureConfig,
    scaling: &ScalingConfig,
) -> Option<ScaleAction> {
    if tally.valid == 0 {
        return None;
    }

    let up_ratio = tally.over as f64 / tally.valid as f64;
    let down_ratio = tally.under as f64 / tally.valid as f64;

    if up_ratio > pressure.up_ratio && replicas < scaling.max_replicas {
        Some(ScaleAction::Up)
    } else if down_ratio > pressure.down_ratio && replicas > scaling.min_replicas {
        Some(ScaleAction::Down)
    } else {
        None
    }
}

/// Worker loop: every scale interval, compare the request window against
/// the thresholds and grow or shrink by one replica.
pub async fn run_rate_scaler(cluster: Arc<Cluster>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = cluster.config().scaling.scale_interval();
    info!(interval_secs = interval.as_secs(), "Request-rate scaler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let count = cluster.take_request_window();
                let replicas = cluster.pool().active_len();
                debug!(count, replicas, "request window closed");

                match rate_decision(count, replicas, &cluster.config().scaling) {
                    Some(ScaleAction::Up) => {
                        info!(count, replicas, "request volume high, growing pool");
                        if let Err(e) = cluster.scale_up().await {
                            error!(error = %e, "scale up failed");
                        }
                    }
                    Some(ScaleAction::Down) => {
                        info!(count, replicas, "request volume low, shrinking pool");
                        if let Err(e) = cluster.scale_down().await {
                            error!(error = %e, "scale down failed");
                        }
                    }
                    None => {}
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Request-rate scaler shutting down");
                    break;
                }
            }
        }
    }
}

/// Worker loop: every pressure interval, sample CPU/memory for each active
/// replica and scale when a clear majority is over- or under-pressured.
pub async fn run_pressure_scaler(cluster: Arc<Cluster>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = cluster.config().scaling.pressure_interval();
    info!(interval_secs = interval.as_secs(), "Pressure scaler started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                pressure_tick(&cluster).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Pressure scaler shutting down");
                    break;
                }
            }
        }
    }
}

async fn pressure_tick(cluster: &Arc<Cluster>) {
    // Snapshot under the pool mutex, sample without it.
    let container_ids = cluster.pool().active_container_ids();
    if container_ids.is_empty() {
        debug!("no containers to monitor");
        return;
    }
    let replicas = container_ids.len();

    let pressure = cluster.config().pressure.clone();
    let mut tally = PressureTally::default();

    for id in &container_ids {
        if id.is_empty() {
            warn!("skipping backend with empty container id");
            continue;
        }
        match cluster.runtime().container_stats(id).await {
            Ok(sample) => {
                debug!(
                    container_id = id.as_str(),
                    cpu_pct = sample.cpu_percent,
                    mem_pct = sample.memory_percent,
                    "sampled replica"
                );
                tally.add(&sample, &pressure);
            }
            Err(e) => {
                warn!(container_id = id.as_str(), error = %e, "failed to sample replica stats");
            }
        }
    }

    if tally.valid == 0 {
        warn!("no valid pressure samples this round");
        return;
    }

    match pressure_decision(tally, replicas, &pressure, &cluster.config().scaling) {
        Some(ScaleAction::Up) => {
            info!(
                over = tally.over,
                valid = tally.valid,
                "sustained pressure high, growing pool"
            );
            if let Err(e) = cluster.scale_up().await {
                error!(error = %e, "scale up failed");
            }
        }
        Some(ScaleAction::Down) => {
            info!(
                under = tally.under,
                valid = tally.valid,
                "sustained pressure low, shrinking pool"
            );
            if let Err(e) = cluster.scale_down().await {
                error!(error = %e, "scale down failed");
            }
        }
        None => {}
    }
}
