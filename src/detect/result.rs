use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One detector/tracker output record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    /// 0..=1
    pub confidence: f32,
    /// Persistent identity from the external tracker. `None` means untracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
}

impl Detection {
    pub fn new(bbox: BBox, class_id: u32, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
            track_id: None,
        }
    }

    pub fn tracked(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    /// Reject records that violate the data model. This is a protocol check,
    /// not a business filter.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "ingest: confidence {} out of bounds for class {}",
                self.confidence,
                self.class_id
            ));
        }
        let b = &self.bbox;
        if ![b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite()) {
            return Err(anyhow!("ingest: bbox has non-finite coordinates"));
        }
        if b.x1 >= b.x2 || b.y1 >= b.y2 {
            return Err(anyhow!(
                "ingest: malformed bbox ({}, {}, {}, {})",
                b.x1,
                b.y1,
                b.x2,
                b.y2
            ));
        }
        Ok(())
    }
}

/// The detection set for one frame, as handed over by the detector/tracker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectionFrame {
    /// Sequential frame index assigned by the source.
    #[serde(default)]
    pub index: u64,
    /// Capture time in milliseconds. Sources without timing leave it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_ms: Option<f64>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_geometry() {
        let b = BBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(b.area(), 800.0);
        assert_eq!(b.center(), (20.0, 40.0));
    }

    #[test]
    fn rejects_confidence_out_of_bounds() {
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(Detection::new(bbox, 2, 1.01).validate().is_err());
        assert!(Detection::new(bbox, 2, -0.1).validate().is_err());
        assert!(Detection::new(bbox, 2, f32::NAN).validate().is_err());
        assert!(Detection::new(bbox, 2, 1.0).validate().is_ok());
        assert!(Detection::new(bbox, 2, 0.0).validate().is_ok());
    }

    #[test]
    fn rejects_inverted_or_empty_bbox() {
        assert!(Detection::new(BBox::new(10.0, 0.0, 10.0, 5.0), 2, 0.9)
            .validate()
            .is_err());
        assert!(Detection::new(BBox::new(0.0, 8.0, 5.0, 2.0), 2, 0.9)
            .validate()
            .is_err());
        assert!(Detection::new(BBox::new(0.0, 0.0, f32::INFINITY, 2.0), 2, 0.9)
            .validate()
            .is_err());
    }

    #[test]
    fn frame_parses_without_optional_fields() -> Result<()> {
        let frame: DetectionFrame = serde_json::from_str(
            r#"{"width":640,"height":480,"detections":[
                {"bbox":{"x1":1,"y1":2,"x2":3,"y2":4},"class_id":2,"confidence":0.9}
            ]}"#,
        )?;
        assert_eq!(frame.t_ms, None);
        assert_eq!(frame.detections.len(), 1);
        assert_eq!(frame.detections[0].track_id, None);
        Ok(())
    }
}
