//! Pass-1 strip planning.
//!
//! Text and table blocks on a page merge into vertical strips when they sit
//! close together, so one backend call can recognize several blocks. Image
//! blocks always crop individually, and degenerate regions are failed up
//! front without ever reaching a backend.

use crate::models::{Block, BlockType, Rect};

/// A planned merged crop of consecutive strip-eligible blocks.
#[derive(Debug, Clone)]
pub struct StripPlan {
    pub strip_id: String,
    pub page_index: u32,
    /// Member block ids ordered top to bottom.
    pub member_ids: Vec<String>,
    /// Union crop rectangle in raster pixels.
    pub rect: Rect,
}

/// A planned individual crop.
#[derive(Debug, Clone)]
pub struct CropPlan {
    pub block_id: String,
    pub page_index: u32,
    pub block_type: BlockType,
    pub rect: Rect,
    pub hint: Option<String>,
}

/// Everything Pass 1 will cut out of one page.
#[derive(Debug, Default)]
pub struct PagePlan {
    pub strips: Vec<StripPlan>,
    pub singles: Vec<CropPlan>,
    /// Blocks with degenerate geometry, recorded as failed.
    pub degenerate: Vec<String>,
}

impl PagePlan {
    pub fn unit_count(&self) -> usize {
        self.strips.len() + self.singles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strips.is_empty() && self.singles.is_empty() && self.degenerate.is_empty()
    }
}

/// Plan one page's crops against a rendered raster.
pub fn plan_page(
    page_index: u32,
    blocks: &[Block],
    raster_w: u32,
    raster_h: u32,
    merge_gap_px: u32,
    max_height_px: u32,
) -> PagePlan {
    let mut plan = PagePlan::default();

    let mut eligible: Vec<(&Block, Rect)> = Vec::new();
    for block in blocks.iter().filter(|b| b.page_index == page_index) {
        let rect = block.pixel_rect(raster_w, raster_h);
        if rect.is_degenerate() {
            plan.degenerate.push(block.id.clone());
            continue;
        }
        if block.block_type.is_strip_eligible() {
            eligible.push((block, rect));
        } else {
            plan.singles.push(CropPlan {
                block_id: block.id.clone(),
                page_index,
                block_type: block.block_type,
                rect,
                hint: block.hint.clone(),
            });
        }
    }

    eligible.sort_by(|a, b| a.1.y1.partial_cmp(&b.1.y1).unwrap_or(std::cmp::Ordering::Equal));

    let mut current: Vec<(&Block, Rect)> = Vec::new();
    let mut current_rect = Rect::default();

    let flush = |current: &mut Vec<(&Block, Rect)>, rect: Rect, plan: &mut PagePlan| {
        if current.is_empty() {
            return;
        }
        let strip_index = plan.strips.len();
        plan.strips.push(StripPlan {
            strip_id: format!("p{}-s{}", page_index, strip_index),
            page_index,
            member_ids: current.iter().map(|(b, _)| b.id.clone()).collect(),
            rect,
        });
        current.clear();
    };

    for (block, rect) in eligible {
        if current.is_empty() {
            current.push((block, rect));
            current_rect = rect;
            continue;
        }
        let gap = rect.y1 - current_rect.y2;
        let merged = Rect::new(
            current_rect.x1.min(rect.x1),
            current_rect.y1.min(rect.y1),
            current_rect.x2.max(rect.x2),
            current_rect.y2.max(rect.y2),
        );
        if gap <= merge_gap_px as f64 && merged.height() <= max_height_px as f64 {
            current.push((block, rect));
            current_rect = merged;
        } else {
            flush(&mut current, current_rect, &mut plan);
            current.push((block, rect));
            current_rect = rect;
        }
    }
    flush(&mut current, current_rect, &mut plan);

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShapeType;

    fn text_block(id: &str, page: u32, y1: f64, y2: f64) -> Block {
        Block {
            id: id.to_string(),
            page_index: page,
            block_type: BlockType::Text,
            shape_type: ShapeType::Rectangle,
            coords_px: Rect::default(),
            coords_norm: Rect::new(0.1, y1 / 1000.0, 0.9, y2 / 1000.0),
            polygon_points: None,
            hint: None,
            category: None,
            group_id: None,
        }
    }

    fn image_block(id: &str, page: u32) -> Block {
        let mut b = text_block(id, page, 300.0, 500.0);
        b.block_type = BlockType::Image;
        b
    }

    // Raster 1000x1000 makes normalized y values read as pixels.
    const W: u32 = 1000;
    const H: u32 = 1000;

    #[test]
    fn test_close_blocks_merge_into_one_strip() {
        let blocks = vec![
            text_block("AAAA-BBBB-001", 0, 100.0, 160.0),
            text_block("AAAA-BBBB-002", 0, 180.0, 240.0),
        ];
        let plan = plan_page(0, &blocks, W, H, 24, 1600);
        assert_eq!(plan.strips.len(), 1);
        assert_eq!(
            plan.strips[0].member_ids,
            vec!["AAAA-BBBB-001", "AAAA-BBBB-002"]
        );
        assert!(plan.singles.is_empty());
        // The strip covers both blocks.
        assert!((plan.strips[0].rect.y1 - 100.0).abs() < 1.0);
        assert!((plan.strips[0].rect.y2 - 240.0).abs() < 1.0);
    }

    #[test]
    fn test_wide_gap_splits_strips() {
        let blocks = vec![
            text_block("AAAA-BBBB-001", 0, 100.0, 160.0),
            text_block("AAAA-BBBB-002", 0, 400.0, 460.0),
        ];
        let plan = plan_page(0, &blocks, W, H, 24, 1600);
        assert_eq!(plan.strips.len(), 2);
        assert_eq!(plan.strips[0].member_ids, vec!["AAAA-BBBB-001"]);
        assert_eq!(plan.strips[1].member_ids, vec!["AAAA-BBBB-002"]);
    }

    #[test]
    fn test_height_budget_splits_strips() {
        let blocks = vec![
            text_block("AAAA-BBBB-001", 0, 0.0, 300.0),
            text_block("AAAA-BBBB-002", 0, 310.0, 620.0),
        ];
        // Combined height 620 exceeds the 500px budget.
        let plan = plan_page(0, &blocks, W, H, 24, 500);
        assert_eq!(plan.strips.len(), 2);
    }

    #[test]
    fn test_images_crop_individually() {
        let blocks = vec![
            text_block("AAAA-BBBB-001", 0, 100.0, 160.0),
            image_block("AAAA-BBBB-002", 0),
        ];
        let plan = plan_page(0, &blocks, W, H, 24, 1600);
        assert_eq!(plan.strips.len(), 1);
        assert_eq!(plan.singles.len(), 1);
        assert_eq!(plan.singles[0].block_id, "AAAA-BBBB-002");
    }

    #[test]
    fn test_degenerate_blocks_fail_without_crop() {
        let mut degenerate = text_block("AAAA-BBBB-003", 0, 100.0, 100.0);
        degenerate.coords_norm = Rect::new(0.5, 0.5, 0.5, 0.5);
        let plan = plan_page(0, &[degenerate], W, H, 24, 1600);
        assert!(plan.strips.is_empty());
        assert_eq!(plan.degenerate, vec!["AAAA-BBBB-003"]);
    }

    #[test]
    fn test_other_pages_ignored() {
        let blocks = vec![
            text_block("AAAA-BBBB-001", 0, 100.0, 160.0),
            text_block("AAAA-BBBB-002", 1, 100.0, 160.0),
        ];
        let plan = plan_page(0, &blocks, W, H, 24, 1600);
        assert_eq!(plan.strips.len(), 1);
        assert_eq!(plan.strips[0].member_ids, vec!["AAAA-BBBB-001"]);
    }

    #[test]
    fn test_unsorted_input_sorts_by_y() {
        let blocks = vec![
            text_block("AAAA-BBBB-002", 0, 180.0, 240.0),
            text_block("AAAA-BBBB-001", 0, 100.0, 160.0),
        ];
        let plan = plan_page(0, &blocks, W, H, 24, 1600);
        assert_eq!(
            plan.strips[0].member_ids,
            vec!["AAAA-BBBB-001", "AAAA-BBBB-002"]
        );
    }
}
