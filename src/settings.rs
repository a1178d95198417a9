use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use crate::workout::{default_routine, ExerciseStep};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u32,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2,
            max_backoff_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Pause between releasing one grant and requesting the next.
    pub settle_delay_ms: u64,
    pub retry: RetrySettings,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 250,
            retry: RetrySettings::default(),
        }
    }
}

impl CaptureSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Inclusive millisecond range a simulated push interval is drawn from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl IntervalRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_delay_ms: u64,
    pub echo_delay_ms: u64,
    /// Author name the local participant's messages are echoed under.
    pub local_author: String,
    pub chat_interval: IntervalRange,
    pub typing_interval: IntervalRange,
    pub reaction_interval: IntervalRange,
    pub participant_interval: IntervalRange,
    pub initial_participants: u32,
    pub max_participants: u32,
    pub remote_authors: Vec<String>,
    pub chat_lines: Vec<String>,
    pub reaction_symbols: Vec<String>,
    /// Oldest confirmed messages are dropped past this many.
    pub chat_history_limit: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_delay_ms: 800,
            echo_delay_ms: 150,
            local_author: "You".into(),
            chat_interval: IntervalRange::new(6_000, 15_000),
            typing_interval: IntervalRange::new(4_000, 10_000),
            reaction_interval: IntervalRange::new(5_000, 12_000),
            participant_interval: IntervalRange::new(8_000, 20_000),
            initial_participants: 12,
            max_participants: 40,
            remote_authors: vec![
                "Coach Maya".into(),
                "Jordan".into(),
                "Priya".into(),
                "Sam".into(),
                "Alex".into(),
            ],
            chat_lines: vec![
                "Great pace everyone!".into(),
                "My legs are on fire".into(),
                "Keep breathing, almost there".into(),
                "Form check: shoulders back".into(),
                "Who else is sweating already?".into(),
                "Let's go team!".into(),
            ],
            reaction_symbols: vec![
                "🔥".into(),
                "💪".into(),
                "👏".into(),
                "❤️".into(),
            ],
            chat_history_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub typing_expiry_ms: u64,
    pub achievement_display_ms: u64,
    pub cue_display_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            typing_expiry_ms: 4_000,
            achievement_display_ms: 5_000,
            cue_display_ms: 4_000,
        }
    }
}

impl PresenceSettings {
    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn achievement_display(&self) -> Duration {
        Duration::from_millis(self.achievement_display_ms)
    }

    pub fn cue_display(&self) -> Duration {
        Duration::from_millis(self.cue_display_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutSettings {
    pub tick_interval_ms: u64,
    pub calories_per_tick: f64,
    pub calorie_milestones: Vec<f64>,
    pub resting_heart_rate: f64,
    pub min_heart_rate: f64,
    pub max_heart_rate: f64,
    pub high_heart_rate: f64,
    pub high_heart_rate_chance: f64,
    pub high_heart_rate_cooldown_ticks: u32,
    pub cue_checkpoints: Vec<u32>,
}

impl Default for WorkoutSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            calories_per_tick: 0.25,
            calorie_milestones: vec![25.0, 50.0, 100.0, 200.0],
            resting_heart_rate: 72.0,
            min_heart_rate: 70.0,
            max_heart_rate: 160.0,
            high_heart_rate: 150.0,
            high_heart_rate_chance: 0.25,
            high_heart_rate_cooldown_ticks: 60,
            cue_checkpoints: vec![30, 15, 5],
        }
    }
}

impl WorkoutSettings {
    /// Never zero; a zero interval would stall the ticker.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(MIN_TICK_INTERVAL_MS))
    }
}

const MIN_TICK_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub capture: CaptureSettings,
    pub transport: TransportSettings,
    pub presence: PresenceSettings,
    pub workout: WorkoutSettings,
    pub routine: Vec<ExerciseStep>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            transport: TransportSettings::default(),
            presence: PresenceSettings::default(),
            workout: WorkoutSettings::default(),
            routine: default_routine(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<EngineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            read_settings(&path)?
        } else {
            EngineSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn get(&self) -> EngineSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: EngineSettings) -> Result<()> {
        self.persist(&settings)?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings;
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let data = read_settings(&self.path)?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &EngineSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

fn read_settings(path: &Path) -> Result<EngineSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Malformed settings in {}", path.display()))
}
