//! Boxes, IoU, non-maximum suppression and frame-level scoring.

use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-5;

/// Axis-aligned box in normalized center format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    /// Build from corner coordinates; corners may come in either order.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        let (x0, x1) = (x0.min(x1), x0.max(x1));
        let (y0, y1) = (y0.min(y1), y0.max(y1));
        Self {
            cx: (x0 + x1) / 2.0,
            cy: (y0 + y1) / 2.0,
            w: x1 - x0,
            h: y1 - y0,
        }
    }

    fn corners(&self) -> [f32; 4] {
        let w = self.w.max(0.0);
        let h = self.h.max(0.0);
        [
            self.cx - w / 2.0,
            self.cy - h / 2.0,
            self.cx + w / 2.0,
            self.cy + h / 2.0,
        ]
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let [ax0, ay0, ax1, ay1] = self.corners();
        let [bx0, by0, bx1, by1] = other.corners();

        let inter_w = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
        let inter_h = (ay1.min(by1) - ay0.max(by0)).max(0.0);
        let inter = inter_w * inter_h;

        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

/// One decoded detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Objectness confidence; NMS and proposal counting rank by this.
    pub det_conf: f32,
    pub class_id: usize,
    pub class_conf: f32,
}

/// An annotated action box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub class_id: usize,
    pub bbox: BoundingBox,
}

/// Greedy suppression by descending `det_conf`: a box is dropped when its
/// IoU with an already kept box exceeds `nms_thresh`.
pub fn nms(detections: &[Detection], nms_thresh: f32) -> Vec<Detection> {
    let mut order: Vec<&Detection> = detections.iter().collect();
    order.sort_by(|a, b| b.det_conf.total_cmp(&a.det_conf));

    let mut kept: Vec<Detection> = Vec::with_capacity(order.len());
    for candidate in order {
        let suppressed = kept
            .iter()
            .any(|k| k.bbox.iou(&candidate.bbox) > nms_thresh);
        if !suppressed {
            kept.push(*candidate);
        }
    }
    kept
}

/// Thresholds used while scoring a clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreThresholds {
    pub conf_thresh: f32,
    pub nms_thresh: f32,
    pub iou_thresh: f32,
}

/// Running frame-level counts over an evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Ground-truth boxes seen.
    pub total: usize,
    /// Kept detections above the confidence threshold.
    pub proposals: usize,
    /// Ground truths matched by a proposal of the same class.
    pub correct: usize,
}

impl FrameStats {
    /// Score one clip's detections against its annotations.
    pub fn add_clip(
        &mut self,
        detections: &[Detection],
        truths: &[GroundTruth],
        thresholds: &ScoreThresholds,
    ) {
        let kept = nms(detections, thresholds.nms_thresh);
        let proposals: Vec<&Detection> = kept
            .iter()
            .filter(|d| d.det_conf > thresholds.conf_thresh)
            .collect();

        self.total += truths.len();
        self.proposals += proposals.len();

        for truth in truths {
            let mut best: Option<(&Detection, f32)> = None;
            for det in &proposals {
                let iou = truth.bbox.iou(&det.bbox);
                if best.is_none_or(|(_, b)| iou > b) {
                    best = Some((det, iou));
                }
            }
            if let Some((det, iou)) = best {
                if iou > thresholds.iou_thresh && det.class_id == truth.class_id {
                    self.correct += 1;
                }
            }
        }
    }

    pub fn precision(&self) -> f64 {
        self.correct as f64 / (self.proposals as f64 + EPS)
    }

    pub fn recall(&self) -> f64 {
        self.correct as f64 / (self.total as f64 + EPS)
    }

    /// Harmonic mean of precision and recall; 0 when nothing was found.
    pub fn fscore(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        2.0 * p * r / (p + r + EPS)
    }
}
