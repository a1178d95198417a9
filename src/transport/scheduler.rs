use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::{IntervalRange, TransportSettings};

/// Kinds of event the simulated server pushes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    Chat,
    Typing,
    Reaction,
    Participants,
}

/// Randomness behind the simulated server, replaceable in tests.
pub trait PushScheduler: Send {
    /// Wait before the next autonomous push of `kind`.
    fn next_delay(&mut self, kind: PushKind) -> Duration;

    /// Index into a non-empty list of `len` choices.
    fn pick(&mut self, len: usize) -> usize;

    /// True with probability `p`.
    fn chance(&mut self, p: f64) -> bool;
}

pub struct RandomScheduler {
    rng: StdRng,
    chat: IntervalRange,
    typing: IntervalRange,
    reaction: IntervalRange,
    participants: IntervalRange,
}

impl RandomScheduler {
    pub fn new(settings: &TransportSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn seeded(settings: &TransportSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: &TransportSettings, rng: StdRng) -> Self {
        Self {
            rng,
            chat: settings.chat_interval,
            typing: settings.typing_interval,
            reaction: settings.reaction_interval,
            participants: settings.participant_interval,
        }
    }
}

impl PushScheduler for RandomScheduler {
    fn next_delay(&mut self, kind: PushKind) -> Duration {
        let range = match kind {
            PushKind::Chat => self.chat,
            PushKind::Typing => self.typing,
            PushKind::Reaction => self.reaction,
            PushKind::Participants => self.participants,
        };
        let low = range.min_ms.min(range.max_ms);
        let high = range.min_ms.max(range.max_ms);
        Duration::from_millis(self.rng.gen_range(low..=high))
    }

    fn pick(&mut self, len: usize) -> usize {
        if len <= 1 {
            0
        } else {
            self.rng.gen_range(0..len)
        }
    }

    fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p.clamp(0.0, 1.0))
    }
}

/// Fixed delays per kind, always picks the first choice, never rolls true.
/// A kind mapped to `None` never fires.
#[derive(Debug, Clone, Default)]
pub struct FixedScheduler {
    pub chat: Option<Duration>,
    pub typing: Option<Duration>,
    pub reaction: Option<Duration>,
    pub participants: Option<Duration>,
}

const NEVER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

impl PushScheduler for FixedScheduler {
    fn next_delay(&mut self, kind: PushKind) -> Duration {
        let delay = match kind {
            PushKind::Chat => self.chat,
            PushKind::Typing => self.typing,
            PushKind::Reaction => self.reaction,
            PushKind::Participants => self.participants,
        };
        delay.unwrap_or(NEVER)
    }

    fn pick(&mut self, _len: usize) -> usize {
        0
    }

    fn chance(&mut self, _p: f64) -> bool {
        false
    }
}
