//! Synthetic occupancy feed used when no MQTT endpoint is configured.
//!
//! Every tick flips occupancy and draws a distance from the band matching the
//! new state, then goes through the same merge path as live data:
//!
//! | Variant | Tick | Occupied    | Free         | Extra fields        |
//! |---------|------|-------------|--------------|---------------------|
//! | single  | 5 s  | 20 - 28 cm  | 80 - 120 cm  | rssi, uptime        |
//! | multi   | 4 s  | 12 - 16 cm  | 40 - 100 cm  | online              |

use std::ops::Range;
use std::time::Duration;

use rand::prelude::*;
use rand::rngs::StdRng;

use crate::config::Variant;
use crate::store::{Fragment, SlotStatus};

pub struct DemoSimulator {
    variant: Variant,
    occupied: bool,
    uptime_s: f64,
    seed: u64,
    rng: StdRng,
}

impl DemoSimulator {
    /// A seed of 0 draws from entropy; anything else replays the same sequence.
    pub fn new(variant: Variant, seed: u64) -> Self {
        DemoSimulator {
            variant,
            occupied: Self::initial_occupancy(variant),
            uptime_s: 0.0,
            seed,
            rng: Self::rng(seed),
        }
    }

    fn rng(seed: u64) -> StdRng {
        if seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed)
        }
    }

    // Single starts free on its first tick, multi starts occupied.
    fn initial_occupancy(variant: Variant) -> bool {
        variant == Variant::Single
    }

    pub fn tick_interval(&self) -> Duration {
        match self.variant {
            Variant::Single => Duration::from_secs(5),
            Variant::Multi => Duration::from_secs(4),
        }
    }

    /// Starts the sequence over, as if freshly created.
    pub fn restart(&mut self) {
        *self = Self::new(self.variant, self.seed);
    }

    pub fn next_fragment(&mut self) -> Fragment {
        self.occupied = !self.occupied;
        let status = if self.occupied {
            SlotStatus::Occupied
        } else {
            SlotStatus::Free
        };
        let band = self.band();
        let distance = round_tenth(self.rng.gen_range(band));

        match self.variant {
            Variant::Single => {
                self.uptime_s += self.tick_interval().as_secs_f64();
                Fragment {
                    status: Some(status),
                    distance: Some(distance),
                    rssi: Some(-45.0 - f64::from(self.rng.gen_range(0..=15_i32))),
                    uptime: Some(self.uptime_s.round()),
                    online: None,
                }
            }
            Variant::Multi => Fragment {
                status: Some(status),
                distance: Some(distance),
                online: Some(true),
                ..Fragment::default()
            },
        }
    }

    fn band(&self) -> Range<f64> {
        match (self.variant, self.occupied) {
            (Variant::Single, true) => 20.0..28.0,
            (Variant::Single, false) => 80.0..120.0,
            (Variant::Multi, true) => 12.0..16.0,
            (Variant::Multi, false) => 40.0..100.0,
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
