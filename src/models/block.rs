//! Page blocks and OCR result records.
//!
//! Blocks arrive in the request `blocks.json` and are never mutated by the
//! core. Ids use the OCR-resistant ArmorID format `XXXX-XXXX-XXX`; the
//! matcher tolerates case changes and dropped separators when a model echoes
//! them back.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle, either in raster pixels or normalized [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// A rectangle that cannot produce a crop.
    pub fn is_degenerate(&self) -> bool {
        self.width() < 1.0 || self.height() < 1.0
    }

    /// Scale a normalized rectangle onto a raster of the given dimensions.
    pub fn scaled(&self, width: f64, height: f64) -> Rect {
        Rect {
            x1: self.x1 * width,
            y1: self.y1 * height,
            x2: self.x2 * width,
            y2: self.y2 * height,
        }
    }

    /// Clamp to raster bounds and round outward to whole pixels.
    pub fn to_pixels(&self, raster_w: u32, raster_h: u32) -> (u32, u32, u32, u32) {
        let x = self.x1.floor().clamp(0.0, raster_w as f64) as u32;
        let y = self.y1.floor().clamp(0.0, raster_h as f64) as u32;
        let x2 = self.x2.ceil().clamp(0.0, raster_w as f64) as u32;
        let y2 = self.y2.ceil().clamp(0.0, raster_h as f64) as u32;
        (x, y, x2.saturating_sub(x), y2.saturating_sub(y))
    }
}

/// Content category of a block. Text and table blocks are strip-eligible;
/// image blocks always crop individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Text,
    Table,
    Image,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Image => "image",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "table" => Some(Self::Table),
            "image" => Some(Self::Image),
            _ => None,
        }
    }

    pub fn is_strip_eligible(&self) -> bool {
        matches!(self, Self::Text | Self::Table)
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Geometric shape of a block. Polygons crop to their bounding box; the
/// vertex list is preserved in records and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    #[default]
    Rectangle,
    Polygon,
}

/// A requested region on one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Stable ArmorID (`XXXX-XXXX-XXX`).
    pub id: String,
    pub page_index: u32,
    pub block_type: BlockType,
    #[serde(default)]
    pub shape_type: ShapeType,
    /// Pixel coordinates on the client's rendered canvas.
    #[serde(default)]
    pub coords_px: Rect,
    /// Normalized coordinates in [0,1]; authoritative across re-renders.
    pub coords_norm: Rect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon_points: Option<Vec<[f64; 2]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl Block {
    /// The crop rectangle on a raster of the given dimensions.
    ///
    /// Normalized coords are authoritative; the client's pixel coords are a
    /// fallback for inputs predating normalized geometry.
    pub fn pixel_rect(&self, raster_w: u32, raster_h: u32) -> Rect {
        let scaled = self
            .coords_norm
            .scaled(raster_w as f64, raster_h as f64);
        if scaled.is_degenerate() && !self.coords_px.is_degenerate() {
            self.coords_px
        } else {
            scaled
        }
    }
}

/// Parse a `blocks.json` payload (a JSON list of blocks).
pub fn parse_blocks(bytes: &[u8]) -> Result<Vec<Block>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Canonical form used for id comparison: uppercase, alphanumerics only.
pub fn normalize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Whether a string is a well-formed ArmorID.
pub fn is_armor_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != 13 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 9 => *b == b'-',
        _ => b.is_ascii_uppercase() || b.is_ascii_digit(),
    })
}

/// Outcome of recognizing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "missing")]
    Missing,
    #[serde(rename = "retried-ok")]
    RetriedOk,
    #[serde(rename = "failed")]
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Missing => "missing",
            Self::RetriedOk => "retried-ok",
            Self::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::RetriedOk)
    }
}

/// One recognized block. The pipeline guarantees exactly one record per
/// requested block by the time artifacts are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub block_id: String,
    pub text: Option<String>,
    pub status: ResultStatus,
}

impl ResultRecord {
    pub fn ok(block_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            text: Some(text.into()),
            status: ResultStatus::Ok,
        }
    }

    pub fn failed(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            text: None,
            status: ResultStatus::Failed,
        }
    }

    pub fn missing(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            text: None,
            status: ResultStatus::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "id": "AAAA-BBBB-001",
            "page_index": 0,
            "block_type": "text",
            "shape_type": "rectangle",
            "coords_px": {"x1": 10.0, "y1": 100.0, "x2": 500.0, "y2": 160.0},
            "coords_norm": {"x1": 0.01, "y1": 0.1, "x2": 0.5, "y2": 0.16}
        },
        {
            "id": "AAAA-BBBB-002",
            "page_index": 1,
            "block_type": "image",
            "coords_norm": {"x1": 0.2, "y1": 0.2, "x2": 0.8, "y2": 0.6},
            "hint": "stamp in the corner"
        }
    ]"#;

    #[test]
    fn test_parse_blocks() {
        let blocks = parse_blocks(SAMPLE.as_bytes()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].block_type, BlockType::Text);
        assert_eq!(blocks[1].shape_type, ShapeType::Rectangle);
        assert_eq!(blocks[1].hint.as_deref(), Some("stamp in the corner"));
    }

    #[test]
    fn test_pixel_rect_prefers_normalized() {
        let blocks = parse_blocks(SAMPLE.as_bytes()).unwrap();
        let r = blocks[0].pixel_rect(1000, 2000);
        assert!((r.x1 - 10.0).abs() < 1e-9);
        assert!((r.y1 - 200.0).abs() < 1e-9);
        assert!((r.x2 - 500.0).abs() < 1e-9);
        assert!((r.y2 - 320.0).abs() < 1e-9);
    }

    #[test]
    fn test_pixel_rect_falls_back_to_px() {
        let mut block = parse_blocks(SAMPLE.as_bytes()).unwrap().remove(0);
        block.coords_norm = Rect::default();
        let r = block.pixel_rect(1000, 2000);
        assert_eq!(r, block.coords_px);
    }

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id("xyz-aaaa-001"), "XYZAAAA001");
        assert_eq!(normalize_id("XYZ AAAA 001"), "XYZAAAA001");
        assert_eq!(normalize_id("XYZ-AAAA-001"), "XYZAAAA001");
    }

    #[test]
    fn test_is_armor_id() {
        assert!(is_armor_id("AAAA-BBBB-001"));
        assert!(is_armor_id("X9Z2-QQ41-77A"));
        assert!(!is_armor_id("aaaa-bbbb-001"));
        assert!(!is_armor_id("AAAA-BBBB-0011"));
        assert!(!is_armor_id("AAAABBBB-001"));
    }

    #[test]
    fn test_rect_to_pixels_clamps() {
        let r = Rect::new(-5.0, 10.2, 120.7, 50.0);
        let (x, y, w, h) = r.to_pixels(100, 100);
        assert_eq!((x, y), (0, 10));
        assert_eq!(w, 100);
        assert_eq!(h, 40);
    }
}
