use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Warmup,
    HighIntensity,
    Strength,
    Core,
    Cooldown,
}

impl Category {
    /// Intensity score a step of this category hovers around, before jitter.
    pub fn baseline_intensity(self) -> f64 {
        match self {
            Category::Warmup => 40.0,
            Category::HighIntensity => 90.0,
            Category::Strength => 75.0,
            Category::Core => 65.0,
            Category::Cooldown => 35.0,
        }
    }

    /// Heart rate the simulated walk drifts toward during a step.
    pub fn target_heart_rate(self) -> f64 {
        match self {
            Category::Warmup => 105.0,
            Category::HighIntensity => 150.0,
            Category::Strength => 130.0,
            Category::Core => 120.0,
            Category::Cooldown => 95.0,
        }
    }
}

/// One entry of the routine. Supplied by configuration and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseStep {
    pub name: String,
    pub duration_seconds: u32,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl ExerciseStep {
    pub fn new(name: impl Into<String>, duration_seconds: u32, category: Category) -> Self {
        Self {
            name: name.into(),
            duration_seconds,
            category,
            title: None,
            thumbnail: None,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }
}

pub fn default_routine() -> Vec<ExerciseStep> {
    vec![
        ExerciseStep::new("Jumping Jacks", 60, Category::Warmup),
        ExerciseStep::new("Arm Circles", 30, Category::Warmup),
        ExerciseStep::new("Burpees", 45, Category::HighIntensity),
        ExerciseStep::new("Mountain Climbers", 45, Category::HighIntensity),
        ExerciseStep::new("Push-ups", 60, Category::Strength),
        ExerciseStep::new("Squats", 60, Category::Strength),
        ExerciseStep::new("Plank", 45, Category::Core),
        ExerciseStep::new("Bicycle Crunches", 45, Category::Core),
        ExerciseStep::new("Hamstring Stretch", 60, Category::Cooldown),
    ]
}
