// src/geometry.rs

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in normalized [0,1] coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// The eight canonical capture orientations, numbered as in EXIF tag 274.
///
/// The recognition engine reports boxes in the coordinate space of the raw
/// capture buffer (origin bottom-left, y up); the orientation says how that
/// buffer must be turned to display upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Up,
    UpMirrored,
    Down,
    DownMirrored,
    LeftMirrored,
    Right,
    RightMirrored,
    Left,
}

impl Orientation {
    /// Map a raw EXIF orientation value (1..=8) to a variant.
    pub fn from_exif(value: u16) -> Option<Self> {
        match value {
            1 => Some(Orientation::Up),
            2 => Some(Orientation::UpMirrored),
            3 => Some(Orientation::Down),
            4 => Some(Orientation::DownMirrored),
            5 => Some(Orientation::LeftMirrored),
            6 => Some(Orientation::Right),
            7 => Some(Orientation::RightMirrored),
            8 => Some(Orientation::Left),
            _ => None,
        }
    }
}

/// Re-express an engine-space box in display space, where increasing y moves
/// down the displayed image.
///
/// Mirrored variants share their rotation family's mapping: only the vertical
/// sort axis matters downstream, and mirroring never changes it. Converting
/// between the engine's bottom-left-up frame and the display's top-left-down
/// frame absorbs a flip, which makes every family mapping an involution:
/// applying it twice returns the original box.
pub fn transform(b: BoundingBox, orientation: Orientation) -> BoundingBox {
    use Orientation::*;
    match orientation {
        Up | UpMirrored => BoundingBox {
            min_x: b.min_x,
            min_y: 1.0 - b.max_y,
            max_x: b.max_x,
            max_y: 1.0 - b.min_y,
        },
        Down | DownMirrored => BoundingBox {
            min_x: 1.0 - b.max_x,
            min_y: b.min_y,
            max_x: 1.0 - b.min_x,
            max_y: b.max_y,
        },
        // Buffer rotated 90° clockwise for display: the engine x axis becomes
        // the display y axis.
        Right | RightMirrored => BoundingBox {
            min_x: b.min_y,
            min_y: b.min_x,
            max_x: b.max_y,
            max_y: b.max_x,
        },
        // 90° counter-clockwise.
        Left | LeftMirrored => BoundingBox {
            min_x: 1.0 - b.max_y,
            min_y: 1.0 - b.max_x,
            max_x: 1.0 - b.min_y,
            max_y: 1.0 - b.min_x,
        },
    }
}

/// Total over any raw orientation value: unrecognized values leave the box
/// untouched rather than failing.
pub fn display_box(b: BoundingBox, raw_orientation: u16) -> BoundingBox {
    match Orientation::from_exif(raw_orientation) {
        Some(orientation) => transform(b, orientation),
        None => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn sample() -> BoundingBox {
        BoundingBox {
            min_x: 0.1,
            min_y: 0.25,
            max_x: 0.4,
            max_y: 0.3,
        }
    }

    fn approx_eq(a: BoundingBox, b: BoundingBox) -> bool {
        (a.min_x - b.min_x).abs() < EPSILON
            && (a.min_y - b.min_y).abs() < EPSILON
            && (a.max_x - b.max_x).abs() < EPSILON
            && (a.max_y - b.max_y).abs() < EPSILON
    }

    #[test]
    fn test_round_trip_all_orientations() {
        for raw in 1..=8u16 {
            let orientation = Orientation::from_exif(raw).unwrap();
            let there = transform(sample(), orientation);
            let back = transform(there, orientation);
            assert!(
                approx_eq(back, sample()),
                "orientation {raw} did not round-trip: {back:?}"
            );
        }
    }

    #[test]
    fn test_upright_flips_vertical_axis() {
        // A box near the top of the engine frame (y up) lands near the top of
        // the display frame (y down).
        let b = BoundingBox {
            min_x: 0.0,
            min_y: 0.9,
            max_x: 1.0,
            max_y: 1.0,
        };
        let t = transform(b, Orientation::Up);
        assert!(t.min_y.abs() < EPSILON);
        assert!((t.max_y - 0.1).abs() < EPSILON);
    }

    #[test]
    fn test_rotated_capture_swaps_axes() {
        let t = transform(sample(), Orientation::Right);
        assert!((t.min_y - sample().min_x).abs() < EPSILON);
        assert!((t.max_y - sample().max_x).abs() < EPSILON);
    }

    #[test]
    fn test_mirrored_variants_match_their_family() {
        assert_eq!(
            transform(sample(), Orientation::Up),
            transform(sample(), Orientation::UpMirrored)
        );
        assert_eq!(
            transform(sample(), Orientation::Down),
            transform(sample(), Orientation::DownMirrored)
        );
        assert_eq!(
            transform(sample(), Orientation::Right),
            transform(sample(), Orientation::RightMirrored)
        );
        assert_eq!(
            transform(sample(), Orientation::Left),
            transform(sample(), Orientation::LeftMirrored)
        );
    }

    #[test]
    fn test_unknown_orientation_passes_through() {
        assert_eq!(display_box(sample(), 0), sample());
        assert_eq!(display_box(sample(), 9), sample());
        assert_eq!(display_box(sample(), 42), sample());
    }

    #[test]
    fn test_out_of_range_box_is_not_clamped() {
        let b = BoundingBox {
            min_x: -0.2,
            min_y: 1.1,
            max_x: 0.1,
            max_y: 1.4,
        };
        let t = transform(b, Orientation::Up);
        assert!((t.min_y - (1.0 - 1.4)).abs() < EPSILON);
    }
}
