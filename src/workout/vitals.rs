use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::WorkoutSettings;

/// Source of the randomness behind simulated vitals.
///
/// Kept behind a trait so tests can drive the engine deterministically.
pub trait VitalsSource: Send {
    /// Jitter added to each heart-rate step, in beats per minute.
    fn heart_rate_jitter(&mut self) -> f64;

    /// Jitter added on top of the category intensity baseline.
    fn intensity_jitter(&mut self) -> f64;

    /// Uniform draw in `[0, 1)` used for probabilistic achievements.
    fn roll(&mut self) -> f64;
}

const HEART_RATE_JITTER: f64 = 3.0;
const INTENSITY_JITTER: f64 = 5.0;

/// Random-walk source used outside of tests.
pub struct RandomWalkVitals {
    rng: StdRng,
}

impl RandomWalkVitals {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomWalkVitals {
    fn default() -> Self {
        Self::new()
    }
}

impl VitalsSource for RandomWalkVitals {
    fn heart_rate_jitter(&mut self) -> f64 {
        self.rng.gen_range(-HEART_RATE_JITTER..=HEART_RATE_JITTER)
    }

    fn intensity_jitter(&mut self) -> f64 {
        self.rng.gen_range(-INTENSITY_JITTER..=INTENSITY_JITTER)
    }

    fn roll(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// No jitter and no luck: heart rate follows its drift exactly and
/// probabilistic achievements never fire.
#[derive(Debug, Default, Clone, Copy)]
pub struct SteadyVitals;

impl VitalsSource for SteadyVitals {
    fn heart_rate_jitter(&mut self) -> f64 {
        0.0
    }

    fn intensity_jitter(&mut self) -> f64 {
        0.0
    }

    fn roll(&mut self) -> f64 {
        1.0
    }
}

/// One step of the heart-rate walk: a tenth of the gap to the target plus
/// bounded jitter.
pub(crate) fn heart_rate_step(current: f64, target: f64, jitter: f64) -> f64 {
    (target - current) * 0.1 + jitter.clamp(-HEART_RATE_JITTER, HEART_RATE_JITTER)
}

pub(crate) fn clamp_intensity(value: f64) -> f64 {
    value.clamp(30.0, 100.0)
}

/// Make the heart-rate band usable for `f64::clamp`: non-finite bounds fall
/// back to the defaults, inverted bounds are swapped, and the resting rate
/// is pulled inside the band.
pub(crate) fn normalize_heart_rate_bounds(tuning: &mut WorkoutSettings) {
    let defaults = WorkoutSettings::default();
    if !tuning.min_heart_rate.is_finite() {
        tuning.min_heart_rate = defaults.min_heart_rate;
    }
    if !tuning.max_heart_rate.is_finite() {
        tuning.max_heart_rate = defaults.max_heart_rate;
    }
    if tuning.min_heart_rate > tuning.max_heart_rate {
        std::mem::swap(&mut tuning.min_heart_rate, &mut tuning.max_heart_rate);
    }
    tuning.resting_heart_rate = if tuning.resting_heart_rate.is_finite() {
        tuning
            .resting_heart_rate
            .clamp(tuning.min_heart_rate, tuning.max_heart_rate)
    } else {
        tuning.min_heart_rate
    };
}
