use serde::{Deserialize, Serialize};

/// Axis-aligned box, top-left origin, pixel units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Build from corner coordinates (Pascal VOC style).
    pub fn from_corners(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self::new(xmin, ymin, (xmax - xmin).max(0.0), (ymax - ymin).max(0.0))
    }

    pub fn x2(&self) -> f64 {
        self.x + self.w
    }

    pub fn y2(&self) -> f64 {
        self.y + self.h
    }

    pub fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn is_degenerate(&self) -> bool {
        self.area() <= 0.0
    }

    pub fn intersection(&self, other: &BBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection over union, `0.0` when both boxes are empty.
    pub fn iou(&self, other: &BBox) -> f64 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Spatial distance used for clustering: `1 - IoU`, in `[0, 1]`.
    pub fn distance(&self, other: &BBox) -> f64 {
        1.0 - self.iou(other)
    }

    /// Clip the box into `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let (width, height) = (width as f64, height as f64);
        let x1 = self.x.clamp(0.0, width);
        let y1 = self.y.clamp(0.0, height);
        let x2 = self.x2().clamp(0.0, width);
        let y2 = self.y2().clamp(0.0, height);
        BBox::from_corners(x1, y1, x2, y2)
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        const EPS: f64 = 1e-6;
        self.x >= -EPS
            && self.y >= -EPS
            && self.w >= 0.0
            && self.h >= 0.0
            && self.x2() <= width as f64 + EPS
            && self.y2() <= height as f64 + EPS
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.x, self.y, self.w, self.h]
    }
}
