//! Pose sample model and the fixed keypoint vocabulary.
//!
//! A [`PoseSample`] is the unit every producer hands to the fallback cascade
//! and the payload of outbound `pose_data` messages. Keypoint names are a
//! closed set: anatomical joints plus the derived `shoulder` and `hip`
//! midpoints. Names serialize in camelCase; the snake_case spellings emitted by
//! landmark-based estimators are accepted on input.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named body keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeypointName {
    #[serde(alias = "nose")]
    Head,
    #[serde(alias = "left_eye_inner")]
    LeftEyeInner,
    #[serde(alias = "left_eye")]
    LeftEye,
    #[serde(alias = "left_eye_outer")]
    LeftEyeOuter,
    #[serde(alias = "right_eye_inner")]
    RightEyeInner,
    #[serde(alias = "right_eye")]
    RightEye,
    #[serde(alias = "right_eye_outer")]
    RightEyeOuter,
    #[serde(alias = "left_ear")]
    LeftEar,
    #[serde(alias = "right_ear")]
    RightEar,
    #[serde(alias = "mouth_left")]
    MouthLeft,
    #[serde(alias = "mouth_right")]
    MouthRight,
    #[serde(alias = "left_shoulder")]
    LeftShoulder,
    #[serde(alias = "right_shoulder")]
    RightShoulder,
    /// Midpoint of the two shoulders.
    Shoulder,
    #[serde(alias = "left_elbow")]
    LeftElbow,
    #[serde(alias = "right_elbow")]
    RightElbow,
    #[serde(alias = "left_wrist")]
    LeftWrist,
    #[serde(alias = "right_wrist")]
    RightWrist,
    #[serde(alias = "left_pinky")]
    LeftPinky,
    #[serde(alias = "right_pinky")]
    RightPinky,
    #[serde(alias = "left_index")]
    LeftIndex,
    #[serde(alias = "right_index")]
    RightIndex,
    #[serde(alias = "left_thumb")]
    LeftThumb,
    #[serde(alias = "right_thumb")]
    RightThumb,
    #[serde(alias = "left_hip")]
    LeftHip,
    #[serde(alias = "right_hip")]
    RightHip,
    /// Midpoint of the two hips.
    Hip,
    #[serde(alias = "left_knee")]
    LeftKnee,
    #[serde(alias = "right_knee")]
    RightKnee,
    #[serde(alias = "left_ankle")]
    LeftAnkle,
    #[serde(alias = "right_ankle")]
    RightAnkle,
    #[serde(alias = "left_heel")]
    LeftHeel,
    #[serde(alias = "right_heel")]
    RightHeel,
    #[serde(alias = "left_foot_index")]
    LeftFootIndex,
    #[serde(alias = "right_foot_index")]
    RightFootIndex,
}

/// Normalized 3D position. `x`/`y` are image-relative, `z` is depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Component-wise midpoint of two positions.
    #[must_use]
    pub fn midpoint(&self, other: &Self) -> Self {
        Self {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
            z: (self.z + other.z) / 2.0,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// A single scored keypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: KeypointName,
    pub position: Position,
    /// Detection confidence in `[0, 1]`.
    pub score: f64,
}

impl Keypoint {
    #[must_use]
    pub const fn new(name: KeypointName, position: Position, score: f64) -> Self {
        Self {
            name,
            position,
            score,
        }
    }
}

/// One timestamped set of body keypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub keypoints: Vec<Keypoint>,
    /// Capture time in Unix milliseconds.
    #[serde(rename = "timestamp", alias = "timestampMs")]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(rename = "is3D", default)]
    pub is_3d: bool,
}

/// Reasons a sample is rejected before it reaches a consumer.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    /// The sample carries no keypoints.
    #[error("sample has no keypoints")]
    Empty,
    /// A keypoint score lies outside `[0, 1]` or is not a number.
    #[error("keypoint {name:?} has score {score} outside [0, 1]")]
    ScoreOutOfRange {
        /// Offending keypoint.
        name: KeypointName,
        /// Offending score.
        score: f64,
    },
    /// A keypoint position contains a non-finite coordinate.
    #[error("keypoint {0:?} has a non-finite position")]
    NonFinitePosition(KeypointName),
}

impl PoseSample {
    /// Check the sample invariants: at least one keypoint, every score in
    /// `[0, 1]`, every coordinate finite.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.keypoints.is_empty() {
            return Err(SampleError::Empty);
        }
        for kp in &self.keypoints {
            if !(0.0..=1.0).contains(&kp.score) {
                return Err(SampleError::ScoreOutOfRange {
                    name: kp.name,
                    score: kp.score,
                });
            }
            if !kp.position.is_finite() {
                return Err(SampleError::NonFinitePosition(kp.name));
            }
        }
        Ok(())
    }

    /// Look up a keypoint by name.
    #[must_use]
    pub fn keypoint(&self, name: KeypointName) -> Option<&Keypoint> {
        self.keypoints.iter().find(|kp| kp.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(scores: &[f64]) -> PoseSample {
        PoseSample {
            keypoints: scores
                .iter()
                .map(|s| Keypoint::new(KeypointName::Head, Position::new(0.5, 0.2, 0.0), *s))
                .collect(),
            timestamp_ms: 1_700_000_000_000,
            confidence: 0.85,
            is_3d: true,
        }
    }

    #[test]
    fn valid_sample_passes() {
        assert!(sample(&[0.0, 0.5, 1.0]).validate().is_ok());
    }

    #[test]
    fn empty_sample_is_rejected() {
        assert_eq!(sample(&[]).validate(), Err(SampleError::Empty));
    }

    #[test]
    fn score_above_one_is_rejected() {
        assert!(matches!(
            sample(&[0.9, 1.2]).validate(),
            Err(SampleError::ScoreOutOfRange { score, .. }) if (score - 1.2).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn nan_score_is_rejected() {
        assert!(sample(&[f64::NAN]).validate().is_err());
    }

    #[test]
    fn non_finite_position_is_rejected() {
        let mut s = sample(&[0.9]);
        s.keypoints[0].position.x = f64::INFINITY;
        assert_eq!(
            s.validate(),
            Err(SampleError::NonFinitePosition(KeypointName::Head))
        );
    }

    #[test]
    fn wire_shape_uses_timestamp_and_is3d_keys() {
        let json = serde_json::to_value(sample(&[0.9])).unwrap();
        assert_eq!(json["timestamp"], 1_700_000_000_000u64);
        assert_eq!(json["is3D"], true);
        assert_eq!(json["keypoints"][0]["name"], "head");
    }

    #[test]
    fn snake_case_and_nose_aliases_are_accepted() {
        let json = r#"{
            "keypoints": [
                {"name": "nose", "position": {"x": 0.5, "y": 0.1}, "score": 0.9},
                {"name": "left_shoulder", "position": {"x": 0.4, "y": 0.3, "z": -0.1}, "score": 0.8},
                {"name": "rightShoulder", "position": {"x": 0.6, "y": 0.3, "z": -0.1}, "score": 0.8}
            ],
            "timestamp": 12
        }"#;
        let s: PoseSample = serde_json::from_str(json).unwrap();
        assert_eq!(s.keypoints[0].name, KeypointName::Head);
        assert_eq!(s.keypoints[1].name, KeypointName::LeftShoulder);
        assert!(!s.is_3d);
        assert!(s.keypoint(KeypointName::RightShoulder).is_some());
    }

    #[test]
    fn unknown_keypoint_name_fails_to_parse() {
        let json = r#"{"keypoints":[{"name":"tail","position":{"x":0,"y":0},"score":0.5}],"timestamp":1}"#;
        assert!(serde_json::from_str::<PoseSample>(json).is_err());
    }

    #[test]
    fn midpoint_averages_each_axis() {
        let m = Position::new(0.0, 1.0, -1.0).midpoint(&Position::new(1.0, 3.0, 1.0));
        assert_eq!(m, Position::new(0.5, 2.0, 0.0));
    }
}
