//! Pass 1: render pages and cut crops to disk.
//!
//! Pages render one at a time at the configured DPI; each page's strips and
//! individual crops are written under the workspace and described by one
//! manifest line, then the raster is dropped. Peak memory stays at one
//! rendered page regardless of document size.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::models::Block;
use crate::ocr::pdf_utils;

use super::manifest::{CropEntry, ManifestWriter, PageManifest, StripEntry};
use super::strip::plan_page;
use super::{Checkpoint, ExecOutcome, JobExecutor, PipelineDeps, PipelineError};
use crate::models::Job;

/// What Pass 1 leaves behind for Pass 2.
pub struct PassOneOutput {
    pub manifest_path: PathBuf,
    pub total_units: usize,
    /// Blocks failed during planning or rendering (degenerate geometry,
    /// out-of-range pages).
    pub failed: Vec<String>,
    pub page_count: u32,
}

pub enum PassOneOutcome {
    Finished(PassOneOutput),
    /// A checkpoint asked the execution to stop.
    Stopped(ExecOutcome),
}

/// Convert raster pixels to PDF points for the text-layer extractor.
pub(crate) fn px_to_points(px: f64, dpi: u32) -> i64 {
    (px * 72.0 / f64::from(dpi)).round() as i64
}

pub async fn run_pass_one(
    deps: &PipelineDeps,
    executor: &JobExecutor,
    job: &Job,
    blocks: &[Block],
    pdf_path: &Path,
    workspace: &Path,
) -> Result<PassOneOutcome, PipelineError> {
    let dpi = deps.settings.pdf_render_dpi;
    let page_count = pdf_utils::page_count(pdf_path)?;

    let crops_dir = workspace.join("crops");
    let render_dir = workspace.join("render");
    tokio::fs::create_dir_all(&crops_dir).await?;
    tokio::fs::create_dir_all(&render_dir).await?;

    let manifest_path = workspace.join("manifest.jsonl");
    let mut manifest = ManifestWriter::create(&manifest_path).await?;

    let mut failed: Vec<String> = Vec::new();
    let mut total_units = 0usize;

    // Pages without requested blocks are never rendered.
    let mut pages: BTreeSet<u32> = BTreeSet::new();
    for block in blocks {
        if block.page_index < page_count {
            pages.insert(block.page_index);
        } else {
            tracing::warn!(
                job_id = %job.id,
                block_id = %block.id,
                page = block.page_index,
                "block references a page beyond the document"
            );
            failed.push(block.id.clone());
        }
    }

    let total_pages = pages.len();
    for (n, page_index) in pages.iter().copied().enumerate() {
        match executor.checkpoint().await? {
            Checkpoint::Continue => {}
            Checkpoint::Pause => return Ok(PassOneOutcome::Stopped(ExecOutcome::Paused)),
            Checkpoint::Cancel => return Ok(PassOneOutcome::Stopped(ExecOutcome::Cancelled)),
        }
        executor
            .report(
                0.05 * (n as f64 / total_pages.max(1) as f64),
                &format!("rendering page {}/{}", n + 1, total_pages),
            )
            .await?;

        let raster_path = pdf_utils::render_page(pdf_path, page_index + 1, dpi, &render_dir).await?;
        let raster = image::open(&raster_path)
            .map_err(|e| PipelineError::Internal(format!("failed to load raster: {}", e)))?;
        let (raster_w, raster_h) = (raster.width(), raster.height());

        let plan = plan_page(
            page_index,
            blocks,
            raster_w,
            raster_h,
            deps.settings.strip_merge_gap_px,
            deps.settings.strip_max_height_px,
        );

        let mut strips = Vec::with_capacity(plan.strips.len());
        for strip in &plan.strips {
            let (x, y, w, h) = strip.rect.to_pixels(raster_w, raster_h);
            let crop_path = crops_dir.join(format!("{}.png", strip.strip_id));
            raster
                .crop_imm(x, y, w, h)
                .save(&crop_path)
                .map_err(|e| PipelineError::Internal(format!("failed to save crop: {}", e)))?;
            strips.push(StripEntry {
                strip_id: strip.strip_id.clone(),
                page_index,
                member_ids: strip.member_ids.clone(),
                crop_path,
                width: w,
                height: h,
            });
        }

        let mut crops = Vec::with_capacity(plan.singles.len());
        for single in &plan.singles {
            let (x, y, w, h) = single.rect.to_pixels(raster_w, raster_h);
            let crop_path = crops_dir.join(format!("{}.png", single.block_id));
            raster
                .crop_imm(x, y, w, h)
                .save(&crop_path)
                .map_err(|e| PipelineError::Internal(format!("failed to save crop: {}", e)))?;
            let pdf_text = pdf_utils::extract_region_text(
                pdf_path,
                page_index + 1,
                px_to_points(single.rect.x1, dpi),
                px_to_points(single.rect.y1, dpi),
                px_to_points(single.rect.width(), dpi),
                px_to_points(single.rect.height(), dpi),
            )
            .await;
            crops.push(CropEntry {
                block_id: single.block_id.clone(),
                page_index,
                block_type: single.block_type,
                crop_path,
                width: w,
                height: h,
                hint: single.hint.clone(),
                pdf_text,
            });
        }

        failed.extend(plan.degenerate.iter().cloned());
        let page = PageManifest {
            page_index,
            raster_width: raster_w,
            raster_height: raster_h,
            strips,
            crops,
            failed: plan.degenerate.clone(),
        };
        total_units += page.unit_count();
        manifest.append(&page).await?;

        // Release the raster before the next page renders.
        drop(raster);
        let _ = tokio::fs::remove_file(&raster_path).await;
    }

    tracing::debug!(
        job_id = %job.id,
        pages = total_pages,
        units = total_units,
        failed = failed.len(),
        "pass 1 complete"
    );
    Ok(PassOneOutcome::Finished(PassOneOutput {
        manifest_path,
        total_units,
        failed,
        page_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_px_to_points() {
        // 300 px at 300 dpi is one inch: 72 points.
        assert_eq!(px_to_points(300.0, 300), 72);
        assert_eq!(px_to_points(150.0, 300), 36);
        assert_eq!(px_to_points(72.0, 72), 72);
    }
}
