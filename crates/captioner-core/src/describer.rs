//! Geometry captioner — describes head pose from landmarks and the frame's
//! lighting and shape from its pixels.
//!
//! The first three landmarks are read as left eye, right eye and nose, which
//! matches the five-point face layout.

use crate::caption::{CaptionError, CaptionGenerator};
use crate::fingerprint::Image;
use crate::frame::Frame;
use crate::types::{LandmarkRecord, Point};

pub const GEOMETRY_CAPTIONER_VERSION: &str = "geometry/v1";

/// Nose offset from the eye midpoint, as a fraction of eye distance, below
/// which the face counts as frontal.
const FRONTAL_YAW: f32 = 0.15;
/// Eye-line angle above which the head counts as tilted.
const TILT_DEGREES: f32 = 12.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryCaptioner;

impl CaptionGenerator for GeometryCaptioner {
    fn version(&self) -> &str {
        GEOMETRY_CAPTIONER_VERSION
    }

    fn generate_caption(
        &self,
        image: &Image,
        landmarks: Option<&LandmarkRecord>,
    ) -> Result<String, CaptionError> {
        let subject = landmarks.and_then(|l| describe_pose(&l.points));
        let scene = Frame::decode(image.bytes()).ok().map(|f| describe_frame(&f));

        match (subject, scene) {
            (Some(subject), Some(scene)) => Ok(format!("{subject} in {scene}")),
            (Some(subject), None) => Ok(subject),
            (None, Some(scene)) => Ok(format!("{scene} with no visible face")),
            (None, None) => Err(CaptionError::Backend(
                "nothing to describe: no landmarks and undecodable pixels".into(),
            )),
        }
    }
}

fn describe_pose(points: &[Point]) -> Option<String> {
    let (left, right, nose) = (points.first()?, points.get(1)?, points.get(2)?);

    let dx = right.x - left.x;
    let dy = right.y - left.y;
    let eye_distance = (dx * dx + dy * dy).sqrt();
    if eye_distance <= f32::EPSILON {
        return None;
    }

    let yaw = (nose.x - (left.x + right.x) / 2.0) / eye_distance;
    let direction = if yaw.abs() < FRONTAL_YAW {
        "looking forward"
    } else if yaw > 0.0 {
        "turned to the right"
    } else {
        "turned to the left"
    };

    let mut caption = format!("a face {direction}");
    if dy.atan2(dx).to_degrees().abs() > TILT_DEGREES {
        caption.push_str(" with the head tilted");
    }
    Some(caption)
}

fn describe_frame(frame: &Frame) -> String {
    format!(
        "a {} {} image",
        frame.brightness().as_str(),
        frame.orientation().as_str()
    )
}
