use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::settings::WorkoutSettings;
use crate::{log_debug, log_info};

use super::state::{Achievement, InstructorCue, RunEvent, RunStatus, WorkoutRun, WorkoutRunView};
use super::step::ExerciseStep;
use super::vitals::VitalsSource;

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "pulsefit::workout";

#[derive(Debug, Clone, PartialEq)]
pub enum WorkoutEvent {
    Changed(WorkoutRunView),
    Achievement(Achievement),
    Cue(InstructorCue),
}

/// Owns the current `WorkoutRun` and the one-second ticker that drives it.
///
/// Invalid transitions (resume while stopped, skip while paused, ...) are
/// logged and ignored.
#[derive(Clone)]
pub struct WorkoutController {
    run: Arc<Mutex<WorkoutRun>>,
    steps: Arc<[ExerciseStep]>,
    tuning: WorkoutSettings,
    vitals: Arc<Mutex<Box<dyn VitalsSource>>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
    events: mpsc::UnboundedSender<WorkoutEvent>,
    shutdown: CancellationToken,
}

impl WorkoutController {
    pub fn new(
        steps: Vec<ExerciseStep>,
        tuning: WorkoutSettings,
        vitals: Box<dyn VitalsSource>,
    ) -> (Self, WorkoutRunView, mpsc::UnboundedReceiver<WorkoutEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let steps: Arc<[ExerciseStep]> = steps.into();
        let run = WorkoutRun::new(steps.clone(), tuning.clone());
        let initial = run.view();
        let controller = Self {
            run: Arc::new(Mutex::new(run)),
            steps,
            tick_interval: tuning.tick_interval(),
            tuning,
            vitals: Arc::new(Mutex::new(vitals)),
            ticker: Arc::new(Mutex::new(None)),
            events,
            shutdown: CancellationToken::new(),
        };
        (controller, initial, rx)
    }

    pub async fn view(&self) -> WorkoutRunView {
        self.run.lock().await.view()
    }

    /// Start the routine. A completed run is replaced by a fresh one first.
    pub async fn start(&self) -> WorkoutRunView {
        let view = {
            let mut run = self.run.lock().await;
            if run.status() == RunStatus::Completed {
                log_info!("replacing completed run {}", run.run_id());
                *run = WorkoutRun::new(self.steps.clone(), self.tuning.clone());
            }
            if let Err(err) = run.start() {
                log_debug!("ignoring start: {err}");
                return run.view();
            }
            log_info!("workout run {} started", run.run_id());
            run.view()
        };
        self.spawn_ticker().await;
        self.emit(WorkoutEvent::Changed(view.clone()));
        view
    }

    pub async fn pause(&self) -> WorkoutRunView {
        let view = {
            let mut run = self.run.lock().await;
            if let Err(err) = run.pause() {
                log_debug!("ignoring pause: {err}");
                return run.view();
            }
            run.view()
        };
        self.cancel_ticker().await;
        self.emit(WorkoutEvent::Changed(view.clone()));
        view
    }

    pub async fn resume(&self) -> WorkoutRunView {
        let view = {
            let mut run = self.run.lock().await;
            if let Err(err) = run.resume() {
                log_debug!("ignoring resume: {err}");
                return run.view();
            }
            run.view()
        };
        self.spawn_ticker().await;
        self.emit(WorkoutEvent::Changed(view.clone()));
        view
    }

    pub async fn skip(&self) -> WorkoutRunView {
        let (view, events) = {
            let mut run = self.run.lock().await;
            match run.skip() {
                Ok(events) => (run.view(), events),
                Err(err) => {
                    log_debug!("ignoring skip: {err}");
                    return run.view();
                }
            }
        };
        let completed = events.contains(&RunEvent::Completed);
        publish(&self.events, events, view.clone());
        if completed {
            self.cancel_ticker().await;
        }
        view
    }

    /// Stop the ticker so nothing mutates the run after teardown. Later
    /// start or resume calls change state but never tick again.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_ticker().await;
    }

    /// Synchronous variant of [`shutdown`](Self::shutdown) for drop paths.
    /// The ticker notices on its next wake-up.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    pub async fn is_ticking(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let run = self.run.clone();
        let vitals = self.vitals.clone();
        let events = self.events.clone();
        let tick_interval = self.tick_interval;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + tick_interval, tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                let (view, tick_events) = {
                    let mut guard = run.lock().await;
                    if guard.status() != RunStatus::Running {
                        break;
                    }
                    let mut source = vitals.lock().await;
                    let tick_events = guard.tick(source.as_mut());
                    (guard.view(), tick_events)
                };

                let completed = tick_events.contains(&RunEvent::Completed);
                publish(&events, tick_events, view);

                if completed {
                    log_info!("workout run completed");
                    break;
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    fn emit(&self, event: WorkoutEvent) {
        if self.events.send(event).is_err() {
            log_debug!("workout event dropped, no listener");
        }
    }
}

fn publish(
    sender: &mpsc::UnboundedSender<WorkoutEvent>,
    events: Vec<RunEvent>,
    view: WorkoutRunView,
) {
    for event in events {
        let outgoing = match event {
            RunEvent::Achievement(achievement) => WorkoutEvent::Achievement(achievement),
            RunEvent::Cue(cue) => WorkoutEvent::Cue(cue),
            RunEvent::Completed => continue,
        };
        let _ = sender.send(outgoing);
    }
    let _ = sender.send(WorkoutEvent::Changed(view));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workout::state::AchievementKind;
    use crate::workout::step::Category;
    use crate::workout::vitals::SteadyVitals;

    fn controller(steps: &[(&str, u32)]) -> (WorkoutController, mpsc::UnboundedReceiver<WorkoutEvent>) {
        let steps = steps
            .iter()
            .map(|(name, secs)| ExerciseStep::new(*name, *secs, Category::Core))
            .collect();
        let (workout, _, rx) =
            WorkoutController::new(steps, WorkoutSettings::default(), Box::new(SteadyVitals));
        (workout, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkoutEvent>) -> Vec<WorkoutEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_advances_once_per_second() {
        let (workout, mut rx) = controller(&[("Jacks", 5), ("Plank", 5)]);
        workout.start().await;

        time::sleep(Duration::from_millis(5_500)).await;
        let view = workout.view().await;
        assert_eq!(view.current_index, 1);
        assert_eq!(view.remaining_seconds, 5);

        let completed: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkoutEvent::Achievement(Achievement {
                    kind: AchievementKind::StepCompleted { step },
                    ..
                }) => Some(step),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["Jacks".to_string()]);
    }

    #[tokio::test]
    async fn initial_view_matches_the_owned_run() {
        let steps = vec![ExerciseStep::new("Jacks", 5, Category::Warmup)];
        let (workout, initial, _rx) =
            WorkoutController::new(steps, WorkoutSettings::default(), Box::new(SteadyVitals));
        let view = workout.view().await;
        assert_eq!(initial.run_id, view.run_id);
        assert_eq!(initial.status, RunStatus::Stopped);
        assert_eq!(initial.step_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tick_interval_still_advances() {
        let steps = vec![ExerciseStep::new("Jacks", 3, Category::Warmup)];
        let tuning = WorkoutSettings {
            tick_interval_ms: 0,
            ..WorkoutSettings::default()
        };
        let (workout, _, _rx) = WorkoutController::new(steps, tuning, Box::new(SteadyVitals));
        workout.start().await;

        time::sleep(Duration::from_millis(10)).await;
        let view = workout.view().await;
        assert_eq!(view.status, RunStatus::Completed);
        assert!(!workout.is_ticking().await);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_stops_the_clock_until_resume() {
        let (workout, _rx) = controller(&[("Plank", 30)]);
        workout.start().await;
        time::sleep(Duration::from_millis(3_500)).await;
        workout.pause().await;
        assert!(!workout.is_ticking().await);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(workout.view().await.remaining_seconds, 27);

        workout.resume().await;
        time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(workout.view().await.remaining_seconds, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_stops_the_ticker() {
        let (workout, _rx) = controller(&[("Jacks", 2)]);
        workout.start().await;
        time::sleep(Duration::from_millis(2_500)).await;

        let view = workout.view().await;
        assert_eq!(view.status, RunStatus::Completed);
        assert!(!workout.is_ticking().await);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(workout.view().await, view);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_completion_begins_a_new_run() {
        let (workout, _rx) = controller(&[("Jacks", 1)]);
        let first = workout.start().await.run_id;
        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(workout.view().await.status, RunStatus::Completed);

        let second = workout.start().await;
        assert_ne!(second.run_id, first);
        assert_eq!(second.status, RunStatus::Running);
        assert!(second.achievements.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commands_are_ignored() {
        let (workout, mut rx) = controller(&[("Jacks", 5)]);
        let view = workout.resume().await;
        assert_eq!(view.status, RunStatus::Stopped);
        workout.skip().await;
        workout.pause().await;
        assert!(drain(&mut rx).is_empty());
        assert!(!workout.is_ticking().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_mutation() {
        let (workout, _rx) = controller(&[("Plank", 30)]);
        workout.start().await;
        time::sleep(Duration::from_millis(1_500)).await;
        workout.shutdown().await;
        let frozen = workout.view().await;
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(workout.view().await, frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_the_ticker_without_awaiting() {
        let (workout, _rx) = controller(&[("Plank", 30)]);
        workout.start().await;
        time::sleep(Duration::from_millis(1_500)).await;
        workout.cancel_all();
        time::sleep(Duration::from_millis(10)).await;
        assert!(!workout.is_ticking().await);
        assert_eq!(workout.view().await.remaining_seconds, 29);
    }
}
