use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Distances below this are treated as zero to avoid dividing by noise.
pub(crate) const ZERO_THRESHOLD: f64 = 1.0e-6;

/// Tuning of the Vivaldi estimator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinateConfig {
    /// Number of Euclidean dimensions; the height term comes on top.
    pub dimensionality: usize,
    /// Ceiling and starting value of the error estimate.
    pub vivaldi_error_max: f64,
    /// Weight of a new sample in the error estimate.
    pub vivaldi_ce: f64,
    /// Damping of the coordinate movement per sample.
    pub vivaldi_cc: f64,
    /// Residual samples averaged into the adjustment term; 0 disables it.
    pub adjustment_window_size: usize,
    /// Floor for the height term (seconds).
    pub height_min: f64,
    /// Per-peer RTT samples fed to the median filter.
    pub latency_filter_size: usize,
    /// Distance (seconds) at which the pull back toward the origin becomes strong.
    pub gravity_rho: f64,
}

impl Default for CoordinateConfig {
    fn default() -> Self {
        Self {
            dimensionality: 8,
            vivaldi_error_max: 1.5,
            vivaldi_ce: 0.25,
            vivaldi_cc: 0.25,
            adjustment_window_size: 20,
            height_min: 10.0e-6,
            latency_filter_size: 3,
            gravity_rho: 150.0,
        }
    }
}

/// A position in the virtual network space.
///
/// Distances between coordinates estimate round trip times in seconds. The
/// `height` models the access link that every path out of a node crosses, and
/// `adjustment` absorbs a node-wide bias the Euclidean part cannot express.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

impl Coordinate {
    /// A coordinate at the origin with maximum uncertainty.
    pub fn new(config: &CoordinateConfig) -> Self {
        Self {
            vec: vec![0.0; config.dimensionality],
            error: config.vivaldi_error_max,
            adjustment: 0.0,
            height: config.height_min,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.vec.iter().all(|v| v.is_finite())
            && self.error.is_finite()
            && self.adjustment.is_finite()
            && self.height.is_finite()
    }

    pub fn is_compatible_with(&self, other: &Coordinate) -> bool {
        self.vec.len() == other.vec.len()
    }

    /// Estimated round trip time to `other`.
    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        let dist = self.raw_distance_to(other);
        let adjusted = dist + self.adjustment + other.adjustment;
        let seconds = if adjusted > 0.0 { adjusted } else { dist };
        duration_from_secs(seconds)
    }

    /// Distance in seconds without the adjustment terms.
    pub(crate) fn raw_distance_to(&self, other: &Coordinate) -> f64 {
        magnitude(&diff(&self.vec, &other.vec)) + self.height + other.height
    }

    /// Moves this coordinate by `force` seconds along the line to `other`.
    /// Positive force pushes away from `other`, negative pulls toward it.
    pub(crate) fn apply_force(
        &self,
        config: &CoordinateConfig,
        force: f64,
        other: &Coordinate,
    ) -> Coordinate {
        let mut ret = self.clone();
        let (unit, mag) = unit_vector_at(&self.vec, &other.vec);
        ret.vec = add(&ret.vec, &mul(&unit, force));
        if mag > ZERO_THRESHOLD {
            ret.height = (ret.height + other.height) * force / mag + ret.height;
            ret.height = ret.height.max(config.height_min);
        }
        ret
    }
}

pub(crate) fn duration_from_secs(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

fn diff(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}

fn mul(v: &[f64], factor: f64) -> Vec<f64> {
    v.iter().map(|x| x * factor).collect()
}

fn magnitude(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Unit vector pointing from `b` to `a`, plus the distance between them.
///
/// Coincident points get a random direction so two nodes starting at the
/// origin can still push each other apart.
fn unit_vector_at(a: &[f64], b: &[f64]) -> (Vec<f64>, f64) {
    let ret = diff(a, b);
    let mag = magnitude(&ret);
    if mag > ZERO_THRESHOLD {
        return (mul(&ret, 1.0 / mag), mag);
    }

    let mut rng = rand::thread_rng();
    let random: Vec<f64> = ret.iter().map(|_| rng.gen_range(-0.5..0.5)).collect();
    let mag = magnitude(&random);
    if mag > ZERO_THRESHOLD {
        return (mul(&random, 1.0 / mag), 0.0);
    }

    let mut fallback = vec![0.0; ret.len()];
    if let Some(first) = fallback.first_mut() {
        *first = 1.0;
    }
    (fallback, 0.0)
}
