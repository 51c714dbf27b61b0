//! Node placement and speed assignment.

use std::fmt;

use meshsim_types::{Position, MAP_HEIGHT, MAP_WIDTH};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Produces the geography and CPU profile of freshly created nodes.
///
/// Layouts draw from the network RNG so node placement is part of the
/// seeded, reproducible state of a run.
pub trait NodeLayout: fmt::Debug {
    fn position(&self, rng: &mut ChaCha8Rng) -> Position;
    fn speed_ratio(&self, rng: &mut ChaCha8Rng) -> f64;
}

/// Uniform random positions over the whole map.
///
/// With `heterogeneous_speed`, speed ratios are drawn uniformly from
/// [0.5, 2.0); otherwise every node runs at ratio 1.0.
#[derive(Debug, Clone)]
pub struct RandomLayout {
    pub heterogeneous_speed: bool,
}

impl NodeLayout for RandomLayout {
    fn position(&self, rng: &mut ChaCha8Rng) -> Position {
        Position {
            x: rng.gen_range(0..MAP_WIDTH),
            y: rng.gen_range(0..MAP_HEIGHT),
        }
    }

    fn speed_ratio(&self, rng: &mut ChaCha8Rng) -> f64 {
        if self.heterogeneous_speed {
            rng.gen_range(0.5..2.0)
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_positions_are_seeded() {
        let layout = RandomLayout {
            heterogeneous_speed: false,
        };
        let mut r1 = ChaCha8Rng::seed_from_u64(9);
        let mut r2 = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..50 {
            assert_eq!(layout.position(&mut r1), layout.position(&mut r2));
        }
    }

    #[test]
    fn test_speed_ratio_range() {
        let layout = RandomLayout {
            heterogeneous_speed: true,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..100 {
            let s = layout.speed_ratio(&mut rng);
            assert!((0.5..2.0).contains(&s));
        }
    }
}
