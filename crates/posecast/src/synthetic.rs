//! Deterministic synthetic side-view pose.
//!
//! A figure seen from the side, breathing slowly, swaying its arms and
//! legs through an exercise cycle and rocking in depth. Every value is a
//! pure function of the time argument, so tests can pin exact outputs.

use posecast_common::types::ESTIMATED_CONFIDENCE;
use posecast_common::{Keypoint, KeypointName, PoseSample, Position};

/// Keypoint layout: (name, dx, dy, dz, x per unit of swing, z per unit of swing, score).
const FIGURE: [(KeypointName, f64, f64, f64, f64, f64, f64); 19] = [
    (KeypointName::Head, 0.0, 0.0, -0.05, 0.0, 0.0, 0.9),
    (KeypointName::LeftEye, -0.02, -0.01, -0.06, 0.0, 0.0, 0.9),
    (KeypointName::RightEye, 0.02, -0.01, -0.06, 0.0, 0.0, 0.9),
    (KeypointName::LeftEar, -0.04, 0.0, -0.03, 0.0, 0.0, 0.9),
    (KeypointName::RightEar, 0.04, 0.0, -0.03, 0.0, 0.0, 0.9),
    (KeypointName::LeftShoulder, -0.08, 0.15, 0.0, 0.0, 0.0, 0.9),
    (KeypointName::RightShoulder, 0.08, 0.15, 0.02, 0.0, 0.0, 0.9),
    (KeypointName::Shoulder, 0.0, 0.15, 0.0, 0.0, 0.0, 0.9),
    (KeypointName::LeftElbow, -0.12, 0.35, 0.0, 1.0, 0.5, 0.8),
    (KeypointName::RightElbow, 0.12, 0.35, 0.02, 1.0, 0.5, 0.8),
    (KeypointName::LeftWrist, -0.15, 0.55, 0.0, 1.2, 0.8, 0.8),
    (KeypointName::RightWrist, 0.15, 0.55, 0.02, 1.2, 0.8, 0.8),
    (KeypointName::LeftHip, -0.06, 0.45, 0.01, 0.0, 0.0, 0.9),
    (KeypointName::RightHip, 0.06, 0.45, 0.03, 0.0, 0.0, 0.9),
    (KeypointName::Hip, 0.0, 0.45, 0.02, 0.0, 0.0, 0.9),
    (KeypointName::LeftKnee, -0.05, 0.7, 0.0, -0.1, -0.3, 0.9),
    (KeypointName::RightKnee, 0.05, 0.7, 0.02, -0.1, -0.3, 0.9),
    (KeypointName::LeftAnkle, -0.08, 0.95, 0.0, -0.2, -0.5, 0.9),
    (KeypointName::RightAnkle, 0.08, 0.95, 0.02, -0.2, -0.5, 0.9),
];

/// Synthetic sample at `time_s` seconds, stamped `timestamp_ms`.
#[must_use]
pub fn synthetic_sample(time_s: f64, timestamp_ms: u64) -> PoseSample {
    let breathing = (time_s * 0.3).sin() * 0.02;
    let swing = (time_s * 1.5).sin() * 0.1;
    let depth = (time_s * 0.8).sin() * 0.05;
    let base_x = 0.5;
    let base_y = 0.2 + breathing;
    let base_z = -0.1 + depth;

    let keypoints = FIGURE
        .iter()
        .map(|&(name, dx, dy, dz, sx, sz, score)| {
            Keypoint::new(
                name,
                Position::new(
                    base_x + dx + swing * sx,
                    base_y + dy,
                    base_z + dz + swing * sz,
                ),
                score,
            )
        })
        .collect();

    PoseSample {
        keypoints,
        timestamp_ms,
        confidence: ESTIMATED_CONFIDENCE,
        is_3d: true,
    }
}

/// Synthetic sample for wall-clock `unix_ms`.
#[must_use]
pub fn synthetic_at(unix_ms: u64) -> PoseSample {
    #[allow(clippy::cast_precision_loss)]
    let time_s = unix_ms as f64 / 1000.0;
    synthetic_sample(time_s, unix_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn rest_pose_at_time_zero() {
        let s = synthetic_sample(0.0, 42);
        assert_eq!(s.keypoints.len(), 19);
        assert_eq!(s.timestamp_ms, 42);
        assert!(s.is_3d);
        let head = s.keypoint(KeypointName::Head).unwrap();
        assert!(close(head.position.x, 0.5));
        assert!(close(head.position.y, 0.2));
        assert!(close(head.position.z, -0.15));
        let ankle = s.keypoint(KeypointName::RightAnkle).unwrap();
        assert!(close(ankle.position.y, 1.15));
        assert!(close(ankle.position.z, -0.08));
    }

    #[test]
    fn limbs_follow_the_swing() {
        let t = 1.0;
        let swing = (t * 1.5_f64).sin() * 0.1;
        let depth = (t * 0.8_f64).sin() * 0.05;
        let s = synthetic_sample(t, 0);
        let wrist = s.keypoint(KeypointName::LeftWrist).unwrap();
        assert!(close(wrist.position.x, 0.5 - 0.15 + swing * 1.2));
        assert!(close(wrist.position.z, -0.1 + depth + swing * 0.8));
        let knee = s.keypoint(KeypointName::LeftKnee).unwrap();
        assert!(close(knee.position.x, 0.5 - 0.05 - swing * 0.1));
    }

    #[test]
    fn every_sample_is_valid() {
        for ms in (0..120_000).step_by(777) {
            assert!(synthetic_at(ms).validate().is_ok());
        }
    }
}
