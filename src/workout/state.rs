use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::settings::WorkoutSettings;

use super::step::ExerciseStep;
use super::vitals::{clamp_intensity, heart_rate_step, normalize_heart_rate_bounds, VitalsSource};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    #[default]
    Stopped,
    Running,
    Paused,
    Completed,
}

impl RunStatus {
    fn label(self) -> &'static str {
        match self {
            RunStatus::Stopped => "stopped",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vitals {
    pub heart_rate: f64,
    pub calories_burned: f64,
    pub intensity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AchievementKind {
    StepCompleted { step: String },
    CalorieMilestone { kcal: f64 },
    HeartRateZone { bpm: u32 },
    WorkoutCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    /// Position in the run's achievement sequence, starting at 1.
    pub seq: u64,
    pub title: String,
    #[serde(flatten)]
    pub kind: AchievementKind,
    pub tick: u64,
}

/// Ephemeral coaching hint. Never stored on the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstructorCue {
    pub step: String,
    pub remaining_seconds: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Achievement(Achievement),
    Cue(InstructorCue),
    Completed,
}

/// Render-ready copy of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutRunView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub current_index: usize,
    pub step_count: usize,
    pub current_step: Option<ExerciseStep>,
    pub next_step: Option<String>,
    pub remaining_seconds: u32,
    pub total_elapsed_percent: f64,
    pub vitals: Vitals,
    pub achievements: Vec<Achievement>,
}

/// Progress through an ordered routine.
///
/// Purely synchronous: time only moves when `tick` is called. A completed
/// run is never restarted; callers replace it with a fresh one.
#[derive(Debug, Clone)]
pub struct WorkoutRun {
    run_id: Uuid,
    steps: Arc<[ExerciseStep]>,
    tuning: WorkoutSettings,
    status: RunStatus,
    current_index: usize,
    remaining_seconds: u32,
    /// Seconds of every step before `current_index`, including skipped ones.
    credited_seconds: u64,
    total_seconds: u64,
    vitals: Vitals,
    achievements: Vec<Achievement>,
    next_milestone: usize,
    ticks: u64,
    last_heart_rate_award: Option<u64>,
}

impl WorkoutRun {
    pub fn new(steps: Arc<[ExerciseStep]>, mut tuning: WorkoutSettings) -> Self {
        tuning.calorie_milestones.retain(|kcal| kcal.is_finite());
        tuning
            .calorie_milestones
            .sort_by(|a, b| a.total_cmp(b));
        normalize_heart_rate_bounds(&mut tuning);

        let total_seconds = steps.iter().map(|s| u64::from(s.duration_seconds)).sum();
        let vitals = Vitals {
            heart_rate: tuning.resting_heart_rate,
            calories_burned: 0.0,
            intensity: clamp_intensity(0.0),
        };

        Self {
            run_id: Uuid::new_v4(),
            steps,
            tuning,
            status: RunStatus::Stopped,
            current_index: 0,
            remaining_seconds: 0,
            credited_seconds: 0,
            total_seconds,
            vitals,
            achievements: Vec::new(),
            next_milestone: 0,
            ticks: 0,
            last_heart_rate_award: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.remaining_seconds
    }

    pub fn vitals(&self) -> Vitals {
        self.vitals
    }

    pub fn current_step(&self) -> Option<&ExerciseStep> {
        match self.status {
            RunStatus::Running | RunStatus::Paused => self.steps.get(self.current_index),
            RunStatus::Stopped | RunStatus::Completed => None,
        }
    }

    /// Achievements in the order they were earned.
    pub fn achievements(&self) -> impl Iterator<Item = &Achievement> {
        self.achievements.iter()
    }

    pub fn total_elapsed_percent(&self) -> f64 {
        if self.status == RunStatus::Completed {
            return 100.0;
        }
        if self.total_seconds == 0 {
            return 0.0;
        }
        let percent = self.elapsed_seconds() as f64 * 100.0 / self.total_seconds as f64;
        percent.min(100.0)
    }

    fn elapsed_seconds(&self) -> u64 {
        let in_step = self
            .steps
            .get(self.current_index)
            .map(|step| u64::from(step.duration_seconds.saturating_sub(self.remaining_seconds)))
            .unwrap_or(0);
        match self.status {
            RunStatus::Stopped => 0,
            RunStatus::Completed => self.total_seconds,
            RunStatus::Running | RunStatus::Paused => self.credited_seconds + in_step,
        }
    }

    pub fn start(&mut self) -> SessionResult<()> {
        if self.status != RunStatus::Stopped {
            return Err(self.rejected("start"));
        }
        let Some(first) = self.steps.first() else {
            return Err(SessionError::invalid_transition("empty routine", "start"));
        };
        self.remaining_seconds = first.duration_seconds;
        self.current_index = 0;
        self.status = RunStatus::Running;
        Ok(())
    }

    pub fn pause(&mut self) -> SessionResult<()> {
        if self.status != RunStatus::Running {
            return Err(self.rejected("pause"));
        }
        self.status = RunStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> SessionResult<()> {
        if self.status != RunStatus::Paused {
            return Err(self.rejected("resume"));
        }
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Jump to the next step. Skipping the last step completes the run.
    pub fn skip(&mut self) -> SessionResult<Vec<RunEvent>> {
        if self.status != RunStatus::Running {
            return Err(self.rejected("skip"));
        }
        let mut events = Vec::new();
        self.move_to_next_step(&mut events);
        Ok(events)
    }

    /// One second of progress. A no-op unless the run is `Running`.
    pub fn tick(&mut self, source: &mut dyn VitalsSource) -> Vec<RunEvent> {
        let mut events = Vec::new();
        if self.status != RunStatus::Running {
            return events;
        }
        let Some(step) = self.steps.get(self.current_index).cloned() else {
            return events;
        };

        self.ticks += 1;
        self.remaining_seconds = self.remaining_seconds.saturating_sub(1);

        self.update_vitals(&step, source, &mut events);

        if self.remaining_seconds > 0 {
            if let Some(cue) = self.cue_for(&step) {
                events.push(RunEvent::Cue(cue));
            }
            return events;
        }

        self.award(
            format!("Completed {}", step.display_title()),
            AchievementKind::StepCompleted { step: step.name.clone() },
            &mut events,
        );
        self.move_to_next_step(&mut events);
        events
    }

    pub fn view(&self) -> WorkoutRunView {
        let next_step = match self.status {
            RunStatus::Completed => None,
            _ => {
                let next = if self.status == RunStatus::Stopped {
                    0
                } else {
                    self.current_index + 1
                };
                self.steps.get(next).map(|s| s.name.clone())
            }
        };
        WorkoutRunView {
            run_id: self.run_id,
            status: self.status,
            current_index: self.current_index,
            step_count: self.steps.len(),
            current_step: self.current_step().cloned(),
            next_step,
            remaining_seconds: self.remaining_seconds,
            total_elapsed_percent: self.total_elapsed_percent(),
            vitals: self.vitals,
            achievements: self.achievements.clone(),
        }
    }

    fn move_to_next_step(&mut self, events: &mut Vec<RunEvent>) {
        let finished = self
            .steps
            .get(self.current_index)
            .map(|s| u64::from(s.duration_seconds))
            .unwrap_or(0);

        match self.steps.get(self.current_index + 1) {
            Some(next) => {
                self.credited_seconds += finished;
                self.current_index += 1;
                self.remaining_seconds = next.duration_seconds;
            }
            None => {
                self.credited_seconds = self.total_seconds;
                self.remaining_seconds = 0;
                self.status = RunStatus::Completed;
                self.award(
                    "Workout complete".to_string(),
                    AchievementKind::WorkoutCompleted,
                    events,
                );
                events.push(RunEvent::Completed);
            }
        }
    }

    fn update_vitals(
        &mut self,
        step: &ExerciseStep,
        source: &mut dyn VitalsSource,
        events: &mut Vec<RunEvent>,
    ) {
        let tuning = &self.tuning;
        let heart_rate = self.vitals.heart_rate
            + heart_rate_step(
                self.vitals.heart_rate,
                step.category.target_heart_rate(),
                source.heart_rate_jitter(),
            );
        self.vitals.heart_rate = heart_rate.clamp(tuning.min_heart_rate, tuning.max_heart_rate);
        self.vitals.calories_burned += tuning.calories_per_tick.max(0.0);
        self.vitals.intensity =
            clamp_intensity(step.category.baseline_intensity() + source.intensity_jitter());

        loop {
            let Some(kcal) = self.tuning.calorie_milestones.get(self.next_milestone).copied()
            else {
                break;
            };
            if self.vitals.calories_burned < kcal {
                break;
            }
            self.next_milestone += 1;
            self.award(
                format!("{kcal:.0} kcal burned"),
                AchievementKind::CalorieMilestone { kcal },
                events,
            );
        }

        let cooled_down = self
            .last_heart_rate_award
            .map(|tick| self.ticks - tick >= u64::from(self.tuning.high_heart_rate_cooldown_ticks))
            .unwrap_or(true);
        if self.vitals.heart_rate >= self.tuning.high_heart_rate
            && cooled_down
            && source.roll() < self.tuning.high_heart_rate_chance
        {
            let bpm = self.vitals.heart_rate.round() as u32;
            self.last_heart_rate_award = Some(self.ticks);
            self.award(
                format!("In the red zone at {bpm} bpm"),
                AchievementKind::HeartRateZone { bpm },
                events,
            );
        }
    }

    fn cue_for(&self, step: &ExerciseStep) -> Option<InstructorCue> {
        let remaining = self.remaining_seconds;
        if !self.tuning.cue_checkpoints.contains(&remaining) || step.duration_seconds <= remaining {
            return None;
        }
        let next = self.steps.get(self.current_index + 1);
        let message = match (remaining, next) {
            (r, Some(next)) if r <= 5 => {
                format!("Last {r} seconds! Next up: {}", next.display_title())
            }
            (r, None) if r <= 5 => format!("Final {r} seconds, finish strong!"),
            (r, _) if r <= 15 => format!("{r} seconds left, push through!"),
            (r, _) => format!("{r} seconds left in {}, keep your form tight", step.display_title()),
        };
        Some(InstructorCue {
            step: step.name.clone(),
            remaining_seconds: remaining,
            message,
        })
    }

    fn award(&mut self, title: String, kind: AchievementKind, events: &mut Vec<RunEvent>) {
        let achievement = Achievement {
            seq: self.achievements.len() as u64 + 1,
            title,
            kind,
            tick: self.ticks,
        };
        self.achievements.push(achievement.clone());
        events.push(RunEvent::Achievement(achievement));
    }

    fn rejected(&self, action: &str) -> SessionError {
        SessionError::invalid_transition(self.status.label(), action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workout::step::Category;
    use crate::workout::vitals::SteadyVitals;

    fn routine(steps: &[(&str, u32)]) -> Arc<[ExerciseStep]> {
        steps
            .iter()
            .map(|(name, secs)| ExerciseStep::new(*name, *secs, Category::HighIntensity))
            .collect()
    }

    fn run(steps: &[(&str, u32)]) -> WorkoutRun {
        WorkoutRun::new(routine(steps), WorkoutSettings::default())
    }

    fn step_completions(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Achievement(Achievement {
                    kind: AchievementKind::StepCompleted { step },
                    ..
                }) => Some(step.clone()),
                _ => None,
            })
            .collect()
    }

    /// Always lucky, never jittery.
    struct LuckyVitals;

    impl VitalsSource for LuckyVitals {
        fn heart_rate_jitter(&mut self) -> f64 {
            0.0
        }
        fn intensity_jitter(&mut self) -> f64 {
            0.0
        }
        fn roll(&mut self) -> f64 {
            0.0
        }
    }

    #[test]
    fn five_ticks_advance_to_second_step() {
        let mut run = run(&[("Jacks", 5), ("Plank", 5)]);
        run.start().unwrap();

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(run.tick(&mut SteadyVitals));
        }

        assert_eq!(run.current_index(), 1);
        assert_eq!(run.remaining_seconds(), 5);
        assert_eq!(step_completions(&events), vec!["Jacks".to_string()]);
    }

    #[test]
    fn final_step_completes_and_freezes_the_run() {
        let mut run = run(&[("Jacks", 2)]);
        run.start().unwrap();
        run.tick(&mut SteadyVitals);
        let events = run.tick(&mut SteadyVitals);

        assert_eq!(run.status(), RunStatus::Completed);
        assert!(events.contains(&RunEvent::Completed));
        assert_eq!(run.total_elapsed_percent(), 100.0);

        let frozen = run.view();
        assert!(run.tick(&mut SteadyVitals).is_empty());
        assert_eq!(run.view(), frozen);
    }

    #[test]
    fn elapsed_percent_is_monotonic_and_capped() {
        let mut run = run(&[("A", 3), ("B", 4), ("C", 3)]);
        run.start().unwrap();
        let mut last = run.total_elapsed_percent();
        for i in 0..12 {
            if i == 4 {
                let _ = run.skip();
            }
            run.tick(&mut SteadyVitals);
            let now = run.total_elapsed_percent();
            assert!(now >= last, "{now} < {last}");
            assert!(now <= 100.0);
            last = now;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn invalid_transitions_are_rejected_without_side_effects() {
        let mut run = run(&[("A", 3)]);
        assert!(matches!(
            run.resume(),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(run.pause().is_err());
        assert!(run.skip().is_err());
        assert_eq!(run.status(), RunStatus::Stopped);

        run.start().unwrap();
        assert!(run.start().is_err());
        assert!(run.resume().is_err());
        assert_eq!(run.status(), RunStatus::Running);
    }

    #[test]
    fn paused_run_ignores_ticks() {
        let mut run = run(&[("A", 10)]);
        run.start().unwrap();
        run.tick(&mut SteadyVitals);
        run.pause().unwrap();
        let before = run.view();
        run.tick(&mut SteadyVitals);
        assert_eq!(run.view(), before);
        run.resume().unwrap();
        run.tick(&mut SteadyVitals);
        assert_eq!(run.remaining_seconds(), 8);
    }

    #[test]
    fn skip_resets_remaining_and_skipping_last_completes() {
        let mut run = run(&[("A", 10), ("B", 7)]);
        run.start().unwrap();
        run.tick(&mut SteadyVitals);

        let events = run.skip().unwrap();
        assert!(step_completions(&events).is_empty());
        assert_eq!(run.current_index(), 1);
        assert_eq!(run.remaining_seconds(), 7);

        let events = run.skip().unwrap();
        assert!(events.contains(&RunEvent::Completed));
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[test]
    fn empty_routine_cannot_start() {
        let mut run = run(&[]);
        assert!(run.start().is_err());
        assert_eq!(run.status(), RunStatus::Stopped);
    }

    #[test]
    fn calorie_milestones_fire_once_each() {
        let tuning = WorkoutSettings {
            calories_per_tick: 1.0,
            calorie_milestones: vec![3.0, 2.0],
            ..WorkoutSettings::default()
        };
        let mut run = WorkoutRun::new(routine(&[("A", 10)]), tuning);
        run.start().unwrap();
        for _ in 0..6 {
            run.tick(&mut SteadyVitals);
        }
        let milestones: Vec<f64> = run
            .achievements()
            .filter_map(|a| match a.kind {
                AchievementKind::CalorieMilestone { kcal } => Some(kcal),
                _ => None,
            })
            .collect();
        assert_eq!(milestones, vec![2.0, 3.0]);
        assert_eq!(run.vitals().calories_burned, 6.0);
    }

    #[test]
    fn heart_rate_award_is_rate_limited() {
        let tuning = WorkoutSettings {
            resting_heart_rate: 155.0,
            high_heart_rate: 150.0,
            high_heart_rate_chance: 1.0,
            high_heart_rate_cooldown_ticks: 5,
            ..WorkoutSettings::default()
        };
        let mut run = WorkoutRun::new(routine(&[("A", 60)]), tuning);
        run.start().unwrap();
        for _ in 0..11 {
            run.tick(&mut LuckyVitals);
        }
        let awards: Vec<u64> = run
            .achievements()
            .filter(|a| matches!(a.kind, AchievementKind::HeartRateZone { .. }))
            .map(|a| a.tick)
            .collect();
        assert_eq!(awards, vec![1, 6, 11]);
    }

    #[test]
    fn heart_rate_stays_in_range() {
        let mut run = run(&[("A", 300)]);
        run.start().unwrap();
        let mut source = super::super::vitals::RandomWalkVitals::seeded(42);
        let mut previous = run.vitals().heart_rate;
        for _ in 0..300 {
            run.tick(&mut source);
            let hr = run.vitals().heart_rate;
            assert!((70.0..=160.0).contains(&hr));
            assert!((hr - previous).abs() <= 12.0);
            assert!((30.0..=100.0).contains(&run.vitals().intensity));
            previous = hr;
        }
    }

    #[test]
    fn inverted_heart_rate_band_ticks_inside_the_swapped_range() {
        let tuning = WorkoutSettings {
            min_heart_rate: 170.0,
            max_heart_rate: 160.0,
            ..WorkoutSettings::default()
        };
        let mut run = WorkoutRun::new(routine(&[("Sprint", 20)]), tuning);
        assert_eq!(run.vitals().heart_rate, 160.0);

        run.start().unwrap();
        let mut source = super::super::vitals::RandomWalkVitals::seeded(3);
        for _ in 0..20 {
            run.tick(&mut source);
            assert!((160.0..=170.0).contains(&run.vitals().heart_rate));
        }
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[test]
    fn cues_fire_at_checkpoints() {
        let mut run = run(&[("A", 31), ("B", 10)]);
        run.start().unwrap();
        let mut cues = Vec::new();
        for _ in 0..31 {
            for event in run.tick(&mut SteadyVitals) {
                if let RunEvent::Cue(cue) = event {
                    cues.push(cue);
                }
            }
        }
        let at: Vec<u32> = cues.iter().map(|c| c.remaining_seconds).collect();
        assert_eq!(at, vec![30, 15, 5]);
        assert!(cues[2].message.contains("Next up: B"));
    }
}
