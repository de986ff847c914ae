//! Versioned annotation documents.
//!
//! `annotation.json` is the canonical serialized form of a document's blocks
//! plus their OCR results. The current schema version is 2; version-1 files
//! (flat block lists without pages) are still readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::block::{Block, BlockType, Rect, ResultRecord, ShapeType};

/// Current annotation schema version.
pub const ANNOTATION_VERSION: u32 = 2;

/// A block inside an annotation document, geometry plus recognition output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationBlock {
    pub id: String,
    pub block_type: BlockType,
    #[serde(default)]
    pub shape_type: ShapeType,
    pub coords_norm: Rect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon_points: Option<Vec<[f64; 2]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Where the block came from ("import", "draft", ...).
    #[serde(default = "default_source")]
    pub source: String,
    pub created_at: DateTime<Utc>,
    /// Recognized text; serialized as an explicit null when recognition
    /// failed.
    #[serde(default)]
    pub ocr_text: Option<String>,
    /// "ok" | "retried-ok" | "failed"; absent for never-processed drafts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_status: Option<String>,
}

fn default_source() -> String {
    "import".to_string()
}

/// One page of annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationPage {
    pub page_index: u32,
    pub blocks: Vec<AnnotationBlock>,
}

/// The versioned document: all pages, all blocks, all results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationDocument {
    pub version: u32,
    pub document_name: String,
    pub page_count: u32,
    pub pages: Vec<AnnotationPage>,
    pub created_at: DateTime<Utc>,
}

impl AnnotationDocument {
    /// Assemble a version-2 document from the request blocks and the
    /// completed result set. Every requested block appears exactly once,
    /// with text or an explicit failure marker.
    pub fn from_results(
        document_name: impl Into<String>,
        blocks: &[Block],
        results: &HashMap<String, ResultRecord>,
    ) -> Self {
        let mut pages: Vec<AnnotationPage> = Vec::new();
        for block in blocks {
            let record = results.get(&block.id);
            let annotated = AnnotationBlock {
                id: block.id.clone(),
                block_type: block.block_type,
                shape_type: block.shape_type,
                coords_norm: block.coords_norm,
                polygon_points: block.polygon_points.clone(),
                hint: block.hint.clone(),
                category: block.category.clone(),
                group_id: block.group_id.clone(),
                source: "import".to_string(),
                created_at: Utc::now(),
                ocr_text: record.and_then(|r| r.text.clone()),
                ocr_status: Some(
                    record
                        .map(|r| r.status.as_str())
                        .unwrap_or("failed")
                        .to_string(),
                ),
            };
            match pages.iter_mut().find(|p| p.page_index == block.page_index) {
                Some(page) => page.blocks.push(annotated),
                None => pages.push(AnnotationPage {
                    page_index: block.page_index,
                    blocks: vec![annotated],
                }),
            }
        }
        pages.sort_by_key(|p| p.page_index);
        let page_count = pages.last().map(|p| p.page_index + 1).unwrap_or(0);
        Self {
            version: ANNOTATION_VERSION,
            document_name: document_name.into(),
            page_count,
            pages,
            created_at: Utc::now(),
        }
    }

    /// Flatten back into request-shaped blocks (used when a draft is started
    /// from an annotation.json instead of a blocks.json).
    pub fn to_blocks(&self) -> Vec<Block> {
        self.pages
            .iter()
            .flat_map(|page| {
                page.blocks.iter().map(move |b| Block {
                    id: b.id.clone(),
                    page_index: page.page_index,
                    block_type: b.block_type,
                    shape_type: b.shape_type,
                    coords_px: Rect::default(),
                    coords_norm: b.coords_norm,
                    polygon_points: b.polygon_points.clone(),
                    hint: b.hint.clone(),
                    category: b.category.clone(),
                    group_id: b.group_id.clone(),
                })
            })
            .collect()
    }

    /// Total number of blocks across all pages.
    pub fn block_count(&self) -> usize {
        self.pages.iter().map(|p| p.blocks.len()).sum()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::block::ResultStatus;

    fn sample_blocks() -> Vec<Block> {
        vec![
            Block {
                id: "AAAA-BBBB-001".to_string(),
                page_index: 0,
                block_type: BlockType::Text,
                shape_type: ShapeType::Rectangle,
                coords_px: Rect::new(10.0, 100.0, 500.0, 160.0),
                coords_norm: Rect::new(0.0123456789, 0.1, 0.5, 0.16),
                polygon_points: None,
                hint: None,
                category: None,
                group_id: None,
            },
            Block {
                id: "AAAA-BBBB-002".to_string(),
                page_index: 1,
                block_type: BlockType::Image,
                shape_type: ShapeType::Polygon,
                coords_px: Rect::default(),
                coords_norm: Rect::new(0.2, 0.2, 0.8, 0.6),
                polygon_points: Some(vec![[0.2, 0.2], [0.8, 0.2], [0.5, 0.6]]),
                hint: Some("figure".to_string()),
                category: None,
                group_id: None,
            },
        ]
    }

    #[test]
    fn test_every_block_present_with_marker() {
        let blocks = sample_blocks();
        let mut results = HashMap::new();
        results.insert(
            "AAAA-BBBB-001".to_string(),
            ResultRecord::ok("AAAA-BBBB-001", "hello"),
        );
        // Second block has no record at all: must still appear, marked failed.
        let doc = AnnotationDocument::from_results("report.pdf", &blocks, &results);
        assert_eq!(doc.version, ANNOTATION_VERSION);
        assert_eq!(doc.block_count(), 2);
        assert_eq!(doc.page_count, 2);

        let first = &doc.pages[0].blocks[0];
        assert_eq!(first.ocr_text.as_deref(), Some("hello"));
        assert_eq!(first.ocr_status.as_deref(), Some("ok"));

        let second = &doc.pages[1].blocks[0];
        assert!(second.ocr_text.is_none());
        assert_eq!(second.ocr_status.as_deref(), Some("failed"));
    }

    #[test]
    fn test_round_trip_preserves_geometry() {
        let blocks = sample_blocks();
        let mut results = HashMap::new();
        results.insert(
            "AAAA-BBBB-002".to_string(),
            ResultRecord {
                block_id: "AAAA-BBBB-002".to_string(),
                text: Some("a figure".to_string()),
                status: ResultStatus::RetriedOk,
            },
        );
        let doc = AnnotationDocument::from_results("report.pdf", &blocks, &results);
        let json = doc.to_json().unwrap();
        let parsed = AnnotationDocument::parse(json.as_bytes()).unwrap();

        assert_eq!(parsed.block_count(), doc.block_count());
        for (page, reparsed) in doc.pages.iter().zip(parsed.pages.iter()) {
            assert_eq!(page.page_index, reparsed.page_index);
            for (a, b) in page.blocks.iter().zip(reparsed.blocks.iter()) {
                assert_eq!(a.id, b.id);
                assert!((a.coords_norm.x1 - b.coords_norm.x1).abs() < 1e-9);
                assert!((a.coords_norm.y1 - b.coords_norm.y1).abs() < 1e-9);
                assert!((a.coords_norm.x2 - b.coords_norm.x2).abs() < 1e-9);
                assert!((a.coords_norm.y2 - b.coords_norm.y2).abs() < 1e-9);
            }
        }
        assert_eq!(
            parsed.pages[1].blocks[0].ocr_status.as_deref(),
            Some("retried-ok")
        );
    }

    #[test]
    fn test_to_blocks_flattens_pages() {
        let blocks = sample_blocks();
        let doc = AnnotationDocument::from_results("report.pdf", &blocks, &HashMap::new());
        let back = doc.to_blocks();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].id, "AAAA-BBBB-001");
        assert_eq!(back[1].page_index, 1);
        assert_eq!(back[1].block_type, BlockType::Image);
    }

    #[test]
    fn test_empty_document() {
        let doc = AnnotationDocument::from_results("empty.pdf", &[], &HashMap::new());
        assert_eq!(doc.page_count, 0);
        assert_eq!(doc.block_count(), 0);
        let json = doc.to_json().unwrap();
        let parsed = AnnotationDocument::parse(json.as_bytes()).unwrap();
        assert_eq!(parsed.block_count(), 0);
    }
}
