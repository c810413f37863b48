//! Conversion from BlazePose-style landmark arrays to [`PoseSample`]s.

use crate::pose::{Keypoint, KeypointName, PoseSample, Position};
use crate::types::{ESTIMATED_CONFIDENCE, MIN_ESTIMATED_KEYPOINTS};
use serde::{Deserialize, Serialize};

/// Score assigned to landmarks that carry no visibility.
pub const DEFAULT_VISIBILITY: f64 = 0.9;

/// Landmark index → keypoint name, in BlazePose's 33-point order.
pub const BLAZEPOSE_ORDER: [KeypointName; 33] = [
    KeypointName::Head,
    KeypointName::LeftEyeInner,
    KeypointName::LeftEye,
    KeypointName::LeftEyeOuter,
    KeypointName::RightEyeInner,
    KeypointName::RightEye,
    KeypointName::RightEyeOuter,
    KeypointName::LeftEar,
    KeypointName::RightEar,
    KeypointName::MouthLeft,
    KeypointName::MouthRight,
    KeypointName::LeftShoulder,
    KeypointName::RightShoulder,
    KeypointName::LeftElbow,
    KeypointName::RightElbow,
    KeypointName::LeftWrist,
    KeypointName::RightWrist,
    KeypointName::LeftPinky,
    KeypointName::RightPinky,
    KeypointName::LeftIndex,
    KeypointName::RightIndex,
    KeypointName::LeftThumb,
    KeypointName::RightThumb,
    KeypointName::LeftHip,
    KeypointName::RightHip,
    KeypointName::LeftKnee,
    KeypointName::RightKnee,
    KeypointName::LeftAnkle,
    KeypointName::RightAnkle,
    KeypointName::LeftHeel,
    KeypointName::RightHeel,
    KeypointName::LeftFootIndex,
    KeypointName::RightFootIndex,
];

/// One landmark as reported by a pose model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Image-relative x.
    pub x: f64,
    /// Image-relative y.
    pub y: f64,
    /// Model depth, used when no world landmark is available.
    #[serde(default)]
    pub z: f64,
    /// Visibility in `[0, 1]`, if the model reports it.
    #[serde(default)]
    pub visibility: Option<f64>,
}

/// A model result: image landmarks plus optional metric world landmarks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    /// Image-space landmarks in [`BLAZEPOSE_ORDER`].
    pub image: Vec<Landmark>,
    /// World-space landmarks, same order; supply depth when present.
    #[serde(default)]
    pub world: Option<Vec<Landmark>>,
}

impl Landmarks {
    /// Convert to a sample stamped with `timestamp_ms`.
    ///
    /// Extra landmarks past the 33 known indices are ignored. `shoulder` and
    /// `hip` midpoints are appended when both sides are present, scored with
    /// the weaker side. Returns `None` when fewer than
    /// [`MIN_ESTIMATED_KEYPOINTS`] keypoints result.
    #[must_use]
    pub fn to_sample(&self, timestamp_ms: u64) -> Option<PoseSample> {
        let world = self.world.as_deref();
        let mut keypoints: Vec<Keypoint> = self
            .image
            .iter()
            .zip(BLAZEPOSE_ORDER)
            .enumerate()
            .map(|(i, (lm, name))| {
                let z = world.and_then(|w| w.get(i)).map_or(lm.z, |w| w.z);
                let score = lm.visibility.unwrap_or(DEFAULT_VISIBILITY).clamp(0.0, 1.0);
                Keypoint::new(name, Position::new(lm.x, lm.y, z), score)
            })
            .collect();

        for (left, right, mid) in [
            (
                KeypointName::LeftShoulder,
                KeypointName::RightShoulder,
                KeypointName::Shoulder,
            ),
            (KeypointName::LeftHip, KeypointName::RightHip, KeypointName::Hip),
        ] {
            if let Some(kp) = midpoint(&keypoints, left, right, mid) {
                keypoints.push(kp);
            }
        }

        if keypoints.len() < MIN_ESTIMATED_KEYPOINTS {
            return None;
        }
        Some(PoseSample {
            keypoints,
            timestamp_ms,
            confidence: ESTIMATED_CONFIDENCE,
            is_3d: true,
        })
    }
}

fn midpoint(
    keypoints: &[Keypoint],
    left: KeypointName,
    right: KeypointName,
    name: KeypointName,
) -> Option<Keypoint> {
    let l = keypoints.iter().find(|k| k.name == left)?;
    let r = keypoints.iter().find(|k| k.name == right)?;
    Some(Keypoint::new(
        name,
        l.position.midpoint(&r.position),
        l.score.min(r.score),
    ))
}
