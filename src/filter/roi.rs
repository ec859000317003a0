use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const EDGE_EPSILON: f32 = 1e-3;

/// Normalized ROI description, scaled to pixels once the first frame size is known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoiSpec {
    /// `nx, ny, nw, nh` axis-aligned rectangle.
    Rect([f32; 4]),
    /// Four `(x, y)` vertices in clockwise order.
    Quad([f32; 8]),
}

impl RoiSpec {
    /// Parse `"nx,ny,nw,nh"` or eight comma-separated floats.
    pub fn parse(raw: &str) -> Result<Self> {
        let values = raw
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<f32>()
                    .map_err(|_| anyhow!("roi: '{}' is not a number", token))
            })
            .collect::<Result<Vec<f32>>>()?;
        Self::from_values(&values)
    }

    pub fn from_values(values: &[f32]) -> Result<Self> {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("roi: values must be finite"));
        }
        match values.len() {
            4 => Ok(RoiSpec::Rect([values[0], values[1], values[2], values[3]])),
            8 => {
                let mut quad = [0.0; 8];
                quad.copy_from_slice(values);
                Ok(RoiSpec::Quad(quad))
            }
            n => Err(anyhow!("roi: expected 4 or 8 values, got {}", n)),
        }
    }

    fn vertices(&self, width: f32, height: f32) -> [(f32, f32); 4] {
        match *self {
            RoiSpec::Rect([nx, ny, nw, nh]) => [
                (nx * width, ny * height),
                ((nx + nw) * width, ny * height),
                ((nx + nw) * width, (ny + nh) * height),
                (nx * width, (ny + nh) * height),
            ],
            RoiSpec::Quad(v) => [
                (v[0] * width, v[1] * height),
                (v[2] * width, v[3] * height),
                (v[4] * width, v[5] * height),
                (v[6] * width, v[7] * height),
            ],
        }
    }
}

/// Region of interest in pixel coordinates. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub enum Roi {
    FullFrame,
    Polygon([(f32, f32); 4]),
}

impl Roi {
    pub fn from_spec(spec: &RoiSpec, width: u32, height: u32) -> Self {
        Roi::Polygon(spec.vertices(width as f32, height as f32))
    }

    /// Build from a raw ROI string. Anything malformed falls back to the full
    /// frame so the run keeps going without ROI filtering.
    pub fn from_raw_or_full(raw: Option<&str>, width: u32, height: u32) -> Self {
        match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => Roi::FullFrame,
            Some(raw) => match RoiSpec::parse(raw) {
                Ok(spec) => Roi::from_spec(&spec, width, height),
                Err(e) => {
                    log::warn!("{}; falling back to full-frame ROI", e);
                    Roi::FullFrame
                }
            },
        }
    }

    /// Boundary points count as inside. A zero-area polygon contains nothing.
    pub fn contains(&self, point: (f32, f32)) -> bool {
        let poly = match self {
            Roi::FullFrame => return true,
            Roi::Polygon(poly) => poly,
        };
        if polygon_area(poly).abs() <= f32::EPSILON {
            return false;
        }
        let (px, py) = point;
        let mut inside = false;
        let mut j = poly.len() - 1;
        for i in 0..poly.len() {
            let (xi, yi) = poly[i];
            let (xj, yj) = poly[j];
            if on_segment((xj, yj), (xi, yi), point) {
                return true;
            }
            if (yi > py) != (yj > py) {
                let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
                if px < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn polygon_area(poly: &[(f32, f32); 4]) -> f32 {
    let mut twice = 0.0;
    for i in 0..poly.len() {
        let (x1, y1) = poly[i];
        let (x2, y2) = poly[(i + 1) % poly.len()];
        twice += x1 * y2 - x2 * y1;
    }
    twice / 2.0
}

fn on_segment(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    let len = ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt().max(1.0);
    if cross.abs() > EDGE_EPSILON * len {
        return false;
    }
    p.0 >= a.0.min(b.0) - EDGE_EPSILON
        && p.0 <= a.0.max(b.0) + EDGE_EPSILON
        && p.1 >= a.1.min(b.1) - EDGE_EPSILON
        && p.1 <= a.1.max(b.1) + EDGE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_rect_contains_whole_frame_including_edges() -> Result<()> {
        let spec = RoiSpec::parse("0,0,1,1")?;
        for (w, h) in [(640, 480), (1920, 1080), (3, 7)] {
            let roi = Roi::from_spec(&spec, w, h);
            let (wf, hf) = (w as f32, h as f32);
            for p in [
                (0.0, 0.0),
                (wf, hf),
                (wf / 2.0, hf / 2.0),
                (wf, 0.0),
                (0.0, hf / 3.0),
            ] {
                assert!(roi.contains(p), "{:?} should be inside {}x{}", p, w, h);
            }
        }
        Ok(())
    }

    #[test]
    fn degenerate_rect_contains_nothing() -> Result<()> {
        let roi = Roi::from_spec(&RoiSpec::parse("0.5,0.5,0,0")?, 640, 480);
        assert!(!roi.contains((320.0, 240.0)));
        assert!(!roi.contains((0.0, 0.0)));
        Ok(())
    }

    #[test]
    fn partial_rect_excludes_lower_half() -> Result<()> {
        let roi = Roi::from_spec(&RoiSpec::parse("0,0,1,0.55")?, 1000, 1000);
        assert!(roi.contains((500.0, 100.0)));
        assert!(roi.contains((500.0, 550.0)));
        assert!(!roi.contains((500.0, 551.0)));
        Ok(())
    }

    #[test]
    fn quad_trapezoid_containment() -> Result<()> {
        // Trapezoid narrowing towards the top.
        let spec = RoiSpec::parse("0.4,0,0.6,0,1,1,0,1")?;
        let roi = Roi::from_spec(&spec, 100, 100);
        assert!(roi.contains((50.0, 10.0)));
        assert!(!roi.contains((5.0, 10.0)));
        assert!(roi.contains((50.0, 0.0)));
        assert!(roi.contains((0.0, 100.0)));
        Ok(())
    }

    #[test]
    fn malformed_spec_falls_back_to_full_frame() {
        assert_eq!(Roi::from_raw_or_full(Some("0.1,0.2,0.3"), 640, 480), Roi::FullFrame);
        assert_eq!(Roi::from_raw_or_full(Some("a,b,c,d"), 640, 480), Roi::FullFrame);
        assert_eq!(Roi::from_raw_or_full(Some(""), 640, 480), Roi::FullFrame);
        assert_eq!(Roi::from_raw_or_full(None, 640, 480), Roi::FullFrame);
        assert!(matches!(
            Roi::from_raw_or_full(Some("0,0,1,1"), 640, 480),
            Roi::Polygon(_)
        ));
    }

    #[test]
    fn spec_deserializes_from_list() -> Result<()> {
        let spec: RoiSpec = serde_json::from_str("[0.0, 0.0, 1.0, 0.5]")?;
        assert_eq!(spec, RoiSpec::Rect([0.0, 0.0, 1.0, 0.5]));
        Ok(())
    }
}
