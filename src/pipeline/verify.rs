//! Verification and retry of missing blocks.
//!
//! After Pass 2, every requested block without a successful record gets one
//! single-block OCR call against its own crop, using the same per-type model
//! selection as the original pass. The verification phase itself is never
//! retried.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::models::{Block, Job, JobSettings, ResultRecord, ResultStatus};
use crate::ocr::{pdf_utils, prompts};

use super::render::px_to_points;
use super::{Checkpoint, JobExecutor, PipelineDeps, PipelineError};

/// Requested blocks that still need text.
fn missing_blocks<'a>(
    blocks: &'a [Block],
    results: &HashMap<String, ResultRecord>,
) -> Vec<&'a Block> {
    blocks
        .iter()
        .filter(|block| {
            !results
                .get(&block.id)
                .map(|r| r.status.is_success())
                .unwrap_or(false)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub async fn run_verification(
    deps: &PipelineDeps,
    executor: &JobExecutor,
    job: &Job,
    job_settings: &JobSettings,
    blocks: &[Block],
    pdf_path: &Path,
    workspace: &Path,
    results: &mut HashMap<String, ResultRecord>,
) -> Result<Checkpoint, PipelineError> {
    let missing = missing_blocks(blocks, results);
    if missing.is_empty() {
        return Ok(Checkpoint::Continue);
    }
    tracing::info!(job_id = %job.id, count = missing.len(), "retrying missing blocks");

    // Render each affected page once.
    let mut by_page: BTreeMap<u32, Vec<&Block>> = BTreeMap::new();
    for block in missing {
        by_page.entry(block.page_index).or_default().push(block);
    }

    let render_dir = workspace.join("verify");
    tokio::fs::create_dir_all(&render_dir).await?;
    let dpi = deps.settings.pdf_render_dpi;

    for (page_index, page_blocks) in by_page {
        let raster_path =
            match pdf_utils::render_page(pdf_path, page_index + 1, dpi, &render_dir).await {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, page = page_index, "verify render failed: {}", e);
                    for block in page_blocks {
                        results.insert(block.id.clone(), ResultRecord::failed(block.id.clone()));
                    }
                    continue;
                }
            };
        let raster = image::open(&raster_path)
            .map_err(|e| PipelineError::Internal(format!("failed to load raster: {}", e)))?;

        for block in page_blocks {
            match executor.checkpoint().await? {
                Checkpoint::Continue => {}
                stopped => return Ok(stopped),
            }

            let rect = block.pixel_rect(raster.width(), raster.height());
            if rect.is_degenerate() {
                results.insert(block.id.clone(), ResultRecord::failed(block.id.clone()));
                continue;
            }
            let (x, y, w, h) = rect.to_pixels(raster.width(), raster.height());
            let crop_path = render_dir.join(format!("{}.png", block.id));
            if let Err(e) = raster.crop_imm(x, y, w, h).save(&crop_path) {
                tracing::warn!(job_id = %job.id, block_id = %block.id, "verify crop failed: {}", e);
                results.insert(block.id.clone(), ResultRecord::failed(block.id.clone()));
                continue;
            }
            let image_bytes = tokio::fs::read(&crop_path).await?;

            let pdf_text = pdf_utils::extract_region_text(
                pdf_path,
                page_index + 1,
                px_to_points(rect.x1, dpi),
                px_to_points(rect.y1, dpi),
                px_to_points(rect.width(), dpi),
                px_to_points(rect.height(), dpi),
            )
            .await;

            let mut values = HashMap::new();
            values.insert("doc_name", job.document_name.clone());
            values.insert("page_index", block.page_index.to_string());
            values.insert("block_id", block.id.clone());
            values.insert("hint", prompts::hint_line(block.hint.as_deref()));
            values.insert("pdf_text", prompts::pdf_text_line(&pdf_text));
            let prompt = prompts::fill(prompts::single_block_template(block.block_type), &values);
            let model = job_settings.model_for(block.block_type);

            let record = match deps
                .dispatcher
                .recognize(job.engine, &image_bytes, &prompt, model, false)
                .await
            {
                Ok(text) => ResultRecord {
                    block_id: block.id.clone(),
                    text: Some(text),
                    status: ResultStatus::RetriedOk,
                },
                Err(e) => {
                    tracing::warn!(job_id = %job.id, block_id = %block.id, "retry failed: {}", e);
                    ResultRecord::failed(block.id.clone())
                }
            };
            results.insert(block.id.clone(), record);
            let _ = tokio::fs::remove_file(&crop_path).await;
        }

        drop(raster);
        let _ = tokio::fs::remove_file(&raster_path).await;
    }

    Ok(Checkpoint::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockType, Rect, ShapeType};

    fn block(id: &str) -> Block {
        Block {
            id: id.to_string(),
            page_index: 0,
            block_type: BlockType::Text,
            shape_type: ShapeType::Rectangle,
            coords_px: Rect::default(),
            coords_norm: Rect::new(0.1, 0.1, 0.9, 0.2),
            polygon_points: None,
            hint: None,
            category: None,
            group_id: None,
        }
    }

    #[test]
    fn test_missing_blocks_selection() {
        let blocks = vec![block("AAAA-BBBB-001"), block("AAAA-BBBB-002"), block("AAAA-BBBB-003")];
        let mut results = HashMap::new();
        results.insert(
            "AAAA-BBBB-001".to_string(),
            ResultRecord::ok("AAAA-BBBB-001", "text"),
        );
        results.insert(
            "AAAA-BBBB-002".to_string(),
            ResultRecord::failed("AAAA-BBBB-002"),
        );
        // -003 has no record at all.
        let missing = missing_blocks(&blocks, &results);
        let ids: Vec<&str> = missing.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["AAAA-BBBB-002", "AAAA-BBBB-003"]);
    }

    #[test]
    fn test_retried_ok_counts_as_success() {
        let blocks = vec![block("AAAA-BBBB-001")];
        let mut results = HashMap::new();
        results.insert(
            "AAAA-BBBB-001".to_string(),
            ResultRecord {
                block_id: "AAAA-BBBB-001".to_string(),
                text: Some("text".to_string()),
                status: ResultStatus::RetriedOk,
            },
        );
        assert!(missing_blocks(&blocks, &results).is_empty());
    }
}
