pub mod controller;
pub mod state;
pub mod step;
pub mod vitals;

pub use controller::{WorkoutController, WorkoutEvent};
pub use state::{
    Achievement, AchievementKind, InstructorCue, RunStatus, Vitals, WorkoutRun, WorkoutRunView,
};
pub use step::{default_routine, Category, ExerciseStep};
pub use vitals::{RandomWalkVitals, SteadyVitals, VitalsSource};
