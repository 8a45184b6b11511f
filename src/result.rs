use geo::Polygon;
use serde::Serialize;
use uuid::Uuid;

/// Axis-aligned rectangle in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        Rect::new(x, y, (right - x).max(0), (bottom - y).max(0))
    }
}

/// A cropped, rotation-corrected spine image plus where it came from.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Upright bounding box of the detected region, before rotation correction.
    pub bounding_box: Rect,
    /// PNG-encoded crop, independent of the source buffer.
    pub image_data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognitionResult {
    /// Text of the highest-confidence orientation that produced any text.
    pub text: String,
    pub confidence: f64,
    /// Raw text of every orientation tried, in 0°, 90°, 270° order.
    pub attempts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Candidate {
    pub bounding_box: Rect,
    pub title: String,
    pub author: String,
    pub genres: Vec<String>,
    /// Always within [0, 0.99].
    pub confidence: f64,
    pub raw_text: String,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub segment_count: usize,
    pub elapsed_ms: u64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub candidates: Vec<Candidate>,
    pub diagnostics: Diagnostics,
}

/// One text region found by the line detector inside a segment.
#[derive(Debug, Clone)]
pub struct TextBox {
    pub score: f32,
    pub rect: Polygon<f32>,
}

#[derive(Debug, Clone)]
pub struct TextLine {
    pub text: String,
    pub character_scores: Vec<f32>,
}

/// What one engine instance read from one orientation of a segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageText {
    pub text: String,
    pub confidence: f64,
}
