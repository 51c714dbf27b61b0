//! Name-based lookup of latency models and node layouts.
//!
//! Protocol parameter records reference models by string so runs can be
//! described as flat key/value maps. Unknown names are fatal at
//! construction time.

use thiserror::Error;

use crate::latency::{DistanceLatency, FixedLatency, LatencyModel};
use crate::layout::{NodeLayout, RandomLayout};

/// Lookup failure for a pluggable component.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown latency model: {0:?}")]
    UnknownLatency(String),
    #[error("unknown node layout: {0:?}")]
    UnknownLayout(String),
}

/// Resolve a latency model by name.
///
/// Known names: `"distance"` (distance-proportional with jitter) and
/// `"fixed"` (constant 10 ms).
pub fn latency_by_name(name: &str) -> Result<Box<dyn LatencyModel>, RegistryError> {
    match name {
        "distance" => Ok(Box::new(DistanceLatency::default())),
        "fixed" => Ok(Box::new(FixedLatency(10))),
        other => Err(RegistryError::UnknownLatency(other.to_string())),
    }
}

/// Resolve a node layout by name.
///
/// Known names: `"random"` (uniform positions, constant speed) and
/// `"random_speed"` (uniform positions, speed ratio in [0.5, 2.0)).
pub fn layout_by_name(name: &str) -> Result<Box<dyn NodeLayout>, RegistryError> {
    match name {
        "random" => Ok(Box::new(RandomLayout {
            heterogeneous_speed: false,
        })),
        "random_speed" => Ok(Box::new(RandomLayout {
            heterogeneous_speed: true,
        })),
        other => Err(RegistryError::UnknownLayout(other.to_string())),
    }
}
