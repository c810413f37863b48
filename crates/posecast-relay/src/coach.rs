//! Coaching feedback and simulated workout metrics.

use crate::registry::Workout;
use posecast_common::message::{AiFeedback, PerformanceMetrics};
use posecast_common::types::DEFAULT_FEEDBACK;
use rand::Rng;
use std::time::Duration;

const PUSH_UPS: [&str; 7] = [
    "Excellent push-up form!",
    "Keep your body straight",
    "Lower your body more",
    "Keep elbows close to body",
    "Maintain shoulder alignment",
    "Control the movement",
    "Poor form detected - reset position",
];

const BICEP_CURLS: [&str; 7] = [
    "Perfect curl form!",
    "Keep shoulders stable",
    "Curl the weights up more",
    "Keep elbows at sides",
    "Control the movement",
    "Don't swing the weights",
    "Poor form detected - reset position",
];

const LATERAL_RAISES: [&str; 7] = [
    "Perfect shoulder height!",
    "Keep slight elbow bend",
    "Raise arms to shoulder level",
    "Keep shoulders level",
    "Control the movement",
    "Don't raise too high",
    "Poor form detected - reset position",
];

const SQUATS: [&str; 7] = [
    "Perfect squat form!",
    "Keep chest up",
    "Lower your body more",
    "Keep knees behind toes",
    "Keep your back straight",
    "Control the movement",
    "Poor form detected - reset position",
];

const FALLBACK: [&str; 1] = [DEFAULT_FEEDBACK];

/// Ceiling for the simulated heart rate.
const MAX_HEART_RATE: u32 = 180;

/// Seconds of activity after which the simulated intensity peaks.
const RAMP_SECS: f64 = 60.0;

/// How serious a feedback line is. Templates are ordered from praise to
/// reset, so severity follows the template position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackStatus {
    /// Form is fine.
    Good,
    /// A correction is suggested.
    Warning,
    /// Form broke down.
    Error,
}

impl FeedbackStatus {
    fn from_slot(slot: usize) -> Self {
        match slot {
            0..=3 => Self::Good,
            4 | 5 => Self::Warning,
            _ => Self::Error,
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Feedback lines for `exercise`; unknown exercises get the generic line.
#[must_use]
pub fn templates(exercise: &str) -> &'static [&'static str] {
    match exercise {
        "push-ups" => &PUSH_UPS,
        "bicep-curls" => &BICEP_CURLS,
        "lateral-raises" => &LATERAL_RAISES,
        "squats" => &SQUATS,
        _ => &FALLBACK,
    }
}

/// Pick a feedback line for `exercise`.
pub fn feedback<R: Rng + ?Sized>(exercise: &str, rng: &mut R) -> (FeedbackStatus, &'static str) {
    let slot = rng.gen_range(0..7);
    let lines = templates(exercise);
    (FeedbackStatus::from_slot(slot), lines[slot % lines.len()])
}

/// `ai_feedback` payload for `exercise`, stamped with `now_ms`.
pub fn feedback_payload<R: Rng + ?Sized>(exercise: &str, now_ms: u64, rng: &mut R) -> AiFeedback {
    let (_, line) = feedback(exercise, rng);
    AiFeedback {
        feedback: line.to_string(),
        timestamp: Some(now_ms),
    }
}

/// Metrics for a workout that has been running for `elapsed`.
///
/// A heart rate reported by the device wins over the simulated one. The
/// simulated rate climbs from the resting base over the first minute of an
/// active workout and is capped at [`MAX_HEART_RATE`].
pub fn performance_metrics<R: Rng + ?Sized>(
    workout: &Workout,
    elapsed: Duration,
    now_ms: u64,
    rng: &mut R,
) -> PerformanceMetrics {
    let duration = elapsed.as_secs();
    let base = i64::from(workout.base_heart_rate);
    let simulated = if workout.active {
        let intensity = (elapsed.as_secs_f64() / RAMP_SECS).min(1.0);
        #[allow(clippy::cast_possible_truncation)]
        let ramp = (60.0 * intensity) as i64;
        (base + ramp + rng.gen_range(-5..=5)).min(i64::from(MAX_HEART_RATE))
    } else {
        base + rng.gen_range(-3..=3)
    };
    let simulated = u32::try_from(simulated.max(0)).unwrap_or(0);
    let heart_rate = workout
        .reported_heart_rate
        .filter(|hr| *hr > 0)
        .unwrap_or(simulated);
    let pulse = u32::try_from((i64::from(heart_rate) + rng.gen_range(-2..=2)).max(0)).unwrap_or(0);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let calories = (duration as f64 * 0.15 + f64::from(workout.rep_count) * 1.2) as u32;

    PerformanceMetrics {
        heart_rate,
        pulse: Some(pulse),
        rep_count: workout.rep_count,
        workout_duration: duration,
        calories_burned: Some(calories),
        timestamp: Some(now_ms),
    }
}
