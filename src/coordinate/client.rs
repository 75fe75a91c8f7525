//! Vivaldi network coordinate estimator.
//!
//! Each probe result moves the local coordinate a damped step toward or away
//! from the probed peer so that coordinate distance tracks observed RTT. The
//! client also caches the latest coordinate reported by every peer.

use super::types::{Coordinate, CoordinateConfig, ZERO_THRESHOLD};
use crate::error::CoordinateError;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// RTT samples beyond this are assumed to be measurement errors.
const MAX_RTT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClientStats {
    pub updates: u64,
    pub resets: u64,
}

#[derive(Debug)]
struct ClientState {
    coord: Coordinate,
    origin: Coordinate,
    adjustment_index: usize,
    adjustment_samples: Vec<f64>,
    latency_filter_samples: HashMap<String, Vec<f64>>,
    peers: HashMap<String, Coordinate>,
    stats: ClientStats,
}

#[derive(Debug)]
pub struct CoordinateClient {
    config: CoordinateConfig,
    state: Mutex<ClientState>,
}

impl CoordinateClient {
    pub fn new(config: CoordinateConfig) -> Self {
        let state = ClientState {
            coord: Coordinate::new(&config),
            origin: Coordinate::new(&config),
            adjustment_index: 0,
            adjustment_samples: vec![0.0; config.adjustment_window_size],
            latency_filter_samples: HashMap::new(),
            peers: HashMap::new(),
            stats: ClientStats::default(),
        };

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &CoordinateConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_coordinate(&self) -> Coordinate {
        self.lock().coord.clone()
    }

    pub fn set_coordinate(&self, coord: Coordinate) -> Result<(), CoordinateError> {
        self.check_coordinate(&coord)?;
        self.lock().coord = coord;
        Ok(())
    }

    /// Latest coordinate reported by `node`.
    pub fn cached_coordinate(&self, node: &str) -> Option<Coordinate> {
        self.lock().peers.get(node).cloned()
    }

    /// Estimated RTT from the local node to `node`, if its coordinate is known.
    pub fn estimate_rtt(&self, node: &str) -> Option<Duration> {
        let state = self.lock();
        state
            .peers
            .get(node)
            .map(|other| state.coord.distance_to(other))
    }

    /// Drops everything known about a node that left the cluster.
    pub fn forget_node(&self, node: &str) {
        let mut state = self.lock();
        state.latency_filter_samples.remove(node);
        state.peers.remove(node);
    }

    pub fn stats(&self) -> ClientStats {
        self.lock().stats
    }

    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        self.lock().coord.distance_to(other)
    }

    fn check_coordinate(&self, coord: &Coordinate) -> Result<(), CoordinateError> {
        if coord.vec.len() != self.config.dimensionality {
            return Err(CoordinateError::DimensionalityMismatch {
                expected: self.config.dimensionality,
                got: coord.vec.len(),
            });
        }
        Ok(())
    }

    /// Feeds one RTT observation of `node` at coordinate `other` and returns
    /// the new local coordinate.
    pub fn update(
        &self,
        node: &str,
        other: &Coordinate,
        rtt: Duration,
    ) -> Result<Coordinate, CoordinateError> {
        self.check_coordinate(other)?;
        if rtt.is_zero() || rtt > MAX_RTT {
            return Err(CoordinateError::RttOutOfRange(rtt));
        }

        let mut state = self.lock();
        let rtt_seconds = self.latency_filter(&mut state, node, rtt.as_secs_f64());
        self.update_vivaldi(&mut state, other, rtt_seconds);
        self.update_adjustment(&mut state, other, rtt_seconds);
        self.update_gravity(&mut state);

        if !state.coord.is_valid() {
            state.stats.resets += 1;
            state.coord = Coordinate::new(&self.config);
            return Err(CoordinateError::Reset);
        }

        state.stats.updates += 1;
        state.peers.insert(node.to_string(), other.clone());
        Ok(state.coord.clone())
    }

    /// Median of the last few samples for `node`, to shed one-off spikes.
    fn latency_filter(&self, state: &mut ClientState, node: &str, rtt_seconds: f64) -> f64 {
        let size = self.config.latency_filter_size.max(1);
        let samples = state
            .latency_filter_samples
            .entry(node.to_string())
            .or_default();

        samples.push(rtt_seconds);
        if samples.len() > size {
            samples.remove(0);
        }

        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[sorted.len() / 2]
    }

    fn update_vivaldi(&self, state: &mut ClientState, other: &Coordinate, rtt_seconds: f64) {
        let rtt_seconds = rtt_seconds.max(ZERO_THRESHOLD);
        let dist = state.coord.distance_to(other).as_secs_f64();

        let wrongness = (dist - rtt_seconds).abs() / rtt_seconds;

        let total_error = (state.coord.error + other.error).max(ZERO_THRESHOLD);
        let weight = state.coord.error / total_error;

        let ce = self.config.vivaldi_ce;
        state.coord.error = (ce * weight * wrongness + state.coord.error * (1.0 - ce * weight))
            .min(self.config.vivaldi_error_max);

        let force = self.config.vivaldi_cc * weight * (rtt_seconds - dist);
        state.coord = state.coord.apply_force(&self.config, force, other);
    }

    fn update_adjustment(&self, state: &mut ClientState, other: &Coordinate, rtt_seconds: f64) {
        let window = self.config.adjustment_window_size;
        if window == 0 {
            return;
        }

        let dist = state.coord.raw_distance_to(other);
        let index = state.adjustment_index;
        state.adjustment_samples[index] = rtt_seconds - dist;
        state.adjustment_index = (index + 1) % window;

        let sum: f64 = state.adjustment_samples.iter().sum();
        state.coord.adjustment = sum / (2.0 * window as f64);
    }

    /// Pulls the coordinate back toward the origin so the whole cluster does
    /// not drift away over time.
    fn update_gravity(&self, state: &mut ClientState) {
        let dist = state.origin.distance_to(&state.coord).as_secs_f64();
        let force = -(dist / self.config.gravity_rho).powi(2);
        let origin = state.origin.clone();
        state.coord = state.coord.apply_force(&self.config, force, &origin);
    }
}

/// Estimated RTT between two coordinates, for callers holding both.
pub fn estimate_rtt(a: &Coordinate, b: &Coordinate) -> Option<Duration> {
    a.is_compatible_with(b).then(|| a.distance_to(b))
}
