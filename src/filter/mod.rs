//! Spatial and confidence filtering of validated detections.

pub mod roi;

use std::collections::BTreeMap;

use crate::detect::Detection;

pub use roi::{Roi, RoiSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass,
    TooSmall,
    OutsideRoi,
    LowConfidence,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterThresholds {
    /// Minimum bbox area in pixels².
    pub min_area: f32,
    pub global_conf_floor: f32,
    /// Per-class floors. Only raise the global floor, never lower it.
    pub per_class_conf_floor: BTreeMap<u32, f32>,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self {
            min_area: 120.0,
            global_conf_floor: 0.55,
            per_class_conf_floor: BTreeMap::new(),
        }
    }
}

impl FilterThresholds {
    pub fn conf_floor(&self, class_id: u32) -> f32 {
        let class_floor = self
            .per_class_conf_floor
            .get(&class_id)
            .copied()
            .unwrap_or(self.global_conf_floor);
        self.global_conf_floor.max(class_floor)
    }
}

/// Pure per-detection gate: area, then ROI (center point), then confidence.
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    thresholds: FilterThresholds,
    roi: Roi,
}

impl DetectionFilter {
    pub fn new(thresholds: FilterThresholds, roi: Roi) -> Self {
        Self { thresholds, roi }
    }

    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    pub fn verdict(&self, det: &Detection) -> FilterVerdict {
        if det.bbox.area() < self.thresholds.min_area {
            return FilterVerdict::TooSmall;
        }
        if !self.roi.contains(det.bbox.center()) {
            return FilterVerdict::OutsideRoi;
        }
        if det.confidence < self.thresholds.conf_floor(det.class_id) {
            return FilterVerdict::LowConfidence;
        }
        FilterVerdict::Pass
    }

    pub fn passes(&self, det: &Detection) -> bool {
        self.verdict(det) == FilterVerdict::Pass
    }
}

/// Parse `"8:0.80,7:0.70"`. Malformed tokens are skipped with a warning.
pub fn parse_conf_floor_map(raw: &str) -> BTreeMap<u32, f32> {
    let mut map = BTreeMap::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let parsed = token.split_once(':').and_then(|(class, floor)| {
            let class = class.trim().parse::<u32>().ok()?;
            let floor = floor.trim().parse::<f32>().ok()?;
            Some((class, floor))
        });
        match parsed {
            Some((class, floor)) => {
                map.insert(class, floor);
            }
            None => log::warn!("ignoring malformed per-class confidence entry '{}'", token),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn det(conf: f32, class_id: u32) -> Detection {
        Detection::new(BBox::new(100.0, 100.0, 120.0, 130.0), class_id, conf)
    }

    #[test]
    fn confidence_floor_is_inclusive() {
        let mut thresholds = FilterThresholds {
            global_conf_floor: 0.5,
            ..FilterThresholds::default()
        };
        thresholds.per_class_conf_floor.insert(8, 0.8);
        let filter = DetectionFilter::new(thresholds, Roi::FullFrame);

        assert!(filter.passes(&det(0.8, 8)));
        assert_eq!(filter.verdict(&det(0.79, 8)), FilterVerdict::LowConfidence);
        assert!(filter.passes(&det(0.5, 2)));
        assert!(!filter.passes(&det(0.49, 2)));
    }

    #[test]
    fn per_class_floor_never_lowers_global() {
        let mut thresholds = FilterThresholds {
            global_conf_floor: 0.6,
            ..FilterThresholds::default()
        };
        thresholds.per_class_conf_floor.insert(7, 0.3);
        assert_eq!(thresholds.conf_floor(7), 0.6);
        assert_eq!(thresholds.conf_floor(3), 0.6);
    }

    #[test]
    fn area_checked_before_roi() {
        let thresholds = FilterThresholds {
            min_area: 1000.0,
            ..FilterThresholds::default()
        };
        let filter = DetectionFilter::new(thresholds, Roi::FullFrame);
        assert_eq!(filter.verdict(&det(0.9, 2)), FilterVerdict::TooSmall);
    }

    #[test]
    fn center_outside_roi_is_rejected() -> anyhow::Result<()> {
        let roi = Roi::from_spec(&RoiSpec::parse("0,0,0.1,0.1")?, 640, 480);
        let filter = DetectionFilter::new(FilterThresholds::default(), roi);
        assert_eq!(filter.verdict(&det(0.9, 2)), FilterVerdict::OutsideRoi);
        Ok(())
    }

    #[test]
    fn parses_floor_map_and_skips_garbage() {
        let map = parse_conf_floor_map("8:0.80, 7:0.70,bogus,9:x");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&8), Some(&0.8));
        assert_eq!(map.get(&7), Some(&0.7));
    }
}
