use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geometry::Rect;

/// One detected text region. `bounding_box` is the detector's flat quad,
/// `[x1, y1, x2, y2, x3, y3, x4, y4]` in source-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    pub bounding_box: Vec<f32>,
}

impl TextRegion {
    /// Axis-aligned bounding box of the quad, clamped to non-negative
    /// coordinates.
    pub fn axis_aligned_box(&self) -> Rect {
        let xs = self.bounding_box.iter().step_by(2);
        let ys = self.bounding_box.iter().skip(1).step_by(2);
        let min_x = xs.clone().copied().fold(f32::INFINITY, f32::min);
        let max_x = xs.copied().fold(f32::NEG_INFINITY, f32::max);
        let min_y = ys.clone().copied().fold(f32::INFINITY, f32::min);
        let max_y = ys.copied().fold(f32::NEG_INFINITY, f32::max);
        Rect::new(
            min_x.max(0.0) as u32,
            min_y.max(0.0) as u32,
            max_x.max(0.0) as u32,
            max_y.max(0.0) as u32,
        )
    }

    pub fn polygon_points(&self) -> Vec<(i32, i32)> {
        self.bounding_box
            .chunks_exact(2)
            .map(|pair| (pair[0].round() as i32, pair[1].round() as i32))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub regions: Vec<TextRegion>,
}

impl OcrResult {
    /// Parses the florence-2 "OCR with Region" payload. The model returns its
    /// result as a Python dict repr inside a `text` field:
    /// `{"text": "{'<OCR_WITH_REGION>': {'quad_boxes': [...], 'labels': [...]}}"}`.
    /// Strict JSON is tried first, then a quote-normalized retry.
    pub fn from_florence_payload(payload: &Value) -> Result<Self> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("OCR payload missing text field: {payload}"))?;

        let parsed: Value = serde_json::from_str(text)
            .or_else(|_| serde_json::from_str(&python_repr_to_json(text)))
            .with_context(|| format!("failed parsing OCR payload: {}", text))?;

        let data = parsed
            .get("<OCR_WITH_REGION>")
            .ok_or_else(|| anyhow!("OCR payload missing <OCR_WITH_REGION> key"))?;
        let quad_boxes = data
            .get("quad_boxes")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("OCR payload missing quad_boxes"))?;
        let labels = data
            .get("labels")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("OCR payload missing labels"))?;

        let mut regions = Vec::new();
        for (label, quad) in labels.iter().zip(quad_boxes) {
            let text = label.as_str().unwrap_or_default().to_string();
            let bounding_box: Vec<f32> = quad
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_f64)
                        .map(|value| value as f32)
                        .collect()
                })
                .unwrap_or_default();
            if bounding_box.len() < 8 {
                continue;
            }
            regions.push(TextRegion { text, bounding_box });
        }

        Ok(Self { regions })
    }
}

/// Best-effort conversion of a Python dict repr into JSON. Handles the quote
/// style and literals florence actually emits; apostrophes inside labels are
/// rare enough that the strict-JSON-first strategy covers the common case.
fn python_repr_to_json(raw: &str) -> String {
    raw.replace('\'', "\"")
        .replace(": True", ": true")
        .replace(": False", ": false")
        .replace(": None", ": null")
}
