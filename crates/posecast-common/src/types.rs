//! Protocol constants shared by the client and the relay server.

/// Exercise label used when none has been selected.
pub const DEFAULT_EXERCISE: &str = "push-ups";

/// Exercises the relay server has feedback templates for.
pub const KNOWN_EXERCISES: [&str; 4] = ["push-ups", "bicep-curls", "lateral-raises", "squats"];

/// Feedback sent for exercises without a template set.
pub const DEFAULT_FEEDBACK: &str = "Keep up the good work!";

/// Fixed confidence attached to samples produced from estimator landmarks
/// and by the synthetic generator.
pub const ESTIMATED_CONFIDENCE: f64 = 0.85;

/// Landmark results with fewer keypoints than this are discarded.
pub const MIN_ESTIMATED_KEYPOINTS: usize = 10;

/// Wall-clock time in Unix milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
