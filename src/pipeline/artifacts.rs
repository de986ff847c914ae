//! Artifact assembly and publication.
//!
//! Produces `result.md`, `annotation.json`, per-block crop PDFs and
//! `result.zip`, uploads everything under the job's artifact prefix,
//! records JobFile rows, and registers node files when the job is tied to a
//! project tree node. Publication is idempotent: re-running a job overwrites
//! the same keys and replaces the same rows.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use crate::models::{
    AnnotationDocument, Block, BlockType, FileType, Job, JobFile, ResultRecord,
};
use crate::ocr::pdf_utils;

use super::{PipelineDeps, PipelineError};

/// Render the structured Markdown result: blocks in page order, top to
/// bottom, with explicit markers for failed blocks.
pub fn render_markdown(
    document_name: &str,
    blocks: &[Block],
    results: &HashMap<String, ResultRecord>,
) -> String {
    let mut by_page: BTreeMap<u32, Vec<&Block>> = BTreeMap::new();
    for block in blocks {
        by_page.entry(block.page_index).or_default().push(block);
    }

    let mut out = format!("# {}\n", document_name);
    for (page_index, mut page_blocks) in by_page {
        page_blocks.sort_by(|a, b| {
            a.coords_norm
                .y1
                .partial_cmp(&b.coords_norm.y1)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.push_str(&format!("\n## Page {}\n", page_index + 1));
        for block in page_blocks {
            let record = results.get(&block.id);
            let text = record.and_then(|r| r.text.as_deref());
            out.push('\n');
            match (block.block_type, text) {
                (BlockType::Image, Some(text)) => {
                    out.push_str(&format!("### Figure {}\n\n", block.id));
                    if !text.is_empty() {
                        out.push_str(text);
                        out.push_str("\n\n");
                    }
                    out.push_str(&format!("![{}](crops/{}.pdf)\n", block.id, block.id));
                }
                (_, Some(text)) => {
                    out.push_str(text);
                    out.push('\n');
                }
                (_, None) => {
                    out.push_str(&format!("> [recognition failed: {}]\n", block.id));
                }
            }
        }
    }
    out
}

/// Cut one crop PDF per block, page by page.
async fn build_crop_pdfs(
    deps: &PipelineDeps,
    job: &Job,
    blocks: &[Block],
    pdf_path: &Path,
    workspace: &Path,
) -> Result<Vec<(String, Vec<u8>)>, PipelineError> {
    let mut by_page: BTreeMap<u32, Vec<&Block>> = BTreeMap::new();
    for block in blocks {
        by_page.entry(block.page_index).or_default().push(block);
    }

    let render_dir = workspace.join("artifact-render");
    tokio::fs::create_dir_all(&render_dir).await?;
    let dpi = deps.settings.pdf_render_dpi;

    let mut crops = Vec::new();
    for (page_index, page_blocks) in by_page {
        let raster_path =
            match pdf_utils::render_page(pdf_path, page_index + 1, dpi, &render_dir).await {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, page = page_index, "crop render failed: {}", e);
                    continue;
                }
            };
        let raster = image::open(&raster_path)
            .map_err(|e| PipelineError::Internal(format!("failed to load raster: {}", e)))?;

        for block in page_blocks {
            let rect = block.pixel_rect(raster.width(), raster.height());
            if rect.is_degenerate() {
                continue;
            }
            let (x, y, w, h) = rect.to_pixels(raster.width(), raster.height());
            let mut png = Vec::new();
            if let Err(e) = raster.crop_imm(x, y, w, h).write_to(
                &mut std::io::Cursor::new(&mut png),
                image::ImageFormat::Png,
            ) {
                tracing::warn!(job_id = %job.id, block_id = %block.id, "crop encode failed: {}", e);
                continue;
            }
            match pdf_utils::image_to_pdf(&png) {
                Ok(pdf) => crops.push((block.id.clone(), pdf)),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, block_id = %block.id, "crop pdf failed: {}", e)
                }
            }
        }

        drop(raster);
        let _ = tokio::fs::remove_file(&raster_path).await;
    }
    Ok(crops)
}

fn build_zip(
    markdown: &str,
    annotation_json: &str,
    crops: &[(String, Vec<u8>)],
) -> Result<Vec<u8>, PipelineError> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("result.md", options)
        .map_err(|e| PipelineError::Internal(format!("zip: {}", e)))?;
    zip.write_all(markdown.as_bytes())?;

    zip.start_file("annotation.json", options)
        .map_err(|e| PipelineError::Internal(format!("zip: {}", e)))?;
    zip.write_all(annotation_json.as_bytes())?;

    for (block_id, pdf) in crops {
        zip.start_file(format!("crops/{}.pdf", block_id), options)
            .map_err(|e| PipelineError::Internal(format!("zip: {}", e)))?;
        zip.write_all(pdf)?;
    }

    let cursor = zip
        .finish()
        .map_err(|e| PipelineError::Internal(format!("zip: {}", e)))?;
    Ok(cursor.into_inner())
}

/// Upload one artifact, record its JobFile row, and register it on the
/// job's tree node when one is linked.
async fn publish(
    deps: &PipelineDeps,
    job: &Job,
    file_type: FileType,
    file_name: &str,
    bytes: Vec<u8>,
    content_type: &str,
    metadata: serde_json::Value,
) -> Result<(), PipelineError> {
    let key = job.object_key(file_name);
    let size = bytes.len() as i64;
    deps.store.upload(&key, bytes, content_type).await?;
    deps.repos
        .files
        .append(&JobFile::new(
            &job.id, file_type, &key, file_name, size, metadata,
        ))
        .await?;
    if let Some(node_id) = &job.node_id {
        deps.repos
            .nodes
            .register_node_file(node_id, &key, file_name, file_type.as_str())
            .await?;
    }
    Ok(())
}

pub async fn build_artifacts(
    deps: &PipelineDeps,
    job: &Job,
    blocks: &[Block],
    results: &HashMap<String, ResultRecord>,
    pdf_path: &Path,
    workspace: &Path,
) -> Result<(), PipelineError> {
    let markdown = render_markdown(&job.document_name, blocks, results);
    let annotation = AnnotationDocument::from_results(&job.document_name, blocks, results);
    let annotation_json = annotation
        .to_json()
        .map_err(|e| PipelineError::Internal(format!("annotation serialize: {}", e)))?;

    let crops = if blocks.is_empty() {
        Vec::new()
    } else {
        build_crop_pdfs(deps, job, blocks, pdf_path, workspace).await?
    };
    let zip_bytes = build_zip(&markdown, &annotation_json, &crops)?;

    for (block_id, pdf) in &crops {
        let block = blocks.iter().find(|b| b.id == *block_id);
        let metadata = match block {
            Some(block) => serde_json::json!({
                "block_id": block.id,
                "page_index": block.page_index,
                "block_type": block.block_type,
                "coords_norm": block.coords_norm,
            }),
            None => serde_json::Value::Null,
        };
        publish(
            deps,
            job,
            FileType::Crop,
            &format!("crops/{}.pdf", block_id),
            pdf.clone(),
            "application/pdf",
            metadata,
        )
        .await?;
    }

    publish(
        deps,
        job,
        FileType::ResultMd,
        "result.md",
        markdown.into_bytes(),
        "text/markdown; charset=utf-8",
        serde_json::Value::Null,
    )
    .await?;
    publish(
        deps,
        job,
        FileType::Annotation,
        "annotation.json",
        annotation_json.into_bytes(),
        "application/json",
        serde_json::Value::Null,
    )
    .await?;
    publish(
        deps,
        job,
        FileType::ResultZip,
        "result.zip",
        zip_bytes,
        "application/zip",
        serde_json::Value::Null,
    )
    .await?;

    tracing::info!(job_id = %job.id, crops = crops.len(), "artifacts published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Rect, ResultStatus, ShapeType};

    fn block(id: &str, page: u32, y: f64, block_type: BlockType) -> Block {
        Block {
            id: id.to_string(),
            page_index: page,
            block_type,
            shape_type: ShapeType::Rectangle,
            coords_px: Rect::default(),
            coords_norm: Rect::new(0.1, y, 0.9, y + 0.05),
            polygon_points: None,
            hint: None,
            category: None,
            group_id: None,
        }
    }

    #[test]
    fn test_markdown_page_order_and_reading_order() {
        let blocks = vec![
            block("AAAA-BBBB-003", 1, 0.1, BlockType::Text),
            block("AAAA-BBBB-002", 0, 0.5, BlockType::Text),
            block("AAAA-BBBB-001", 0, 0.1, BlockType::Text),
        ];
        let mut results = HashMap::new();
        for (id, text) in [
            ("AAAA-BBBB-001", "first"),
            ("AAAA-BBBB-002", "second"),
            ("AAAA-BBBB-003", "third"),
        ] {
            results.insert(id.to_string(), ResultRecord::ok(id, text));
        }
        let md = render_markdown("doc.pdf", &blocks, &results);

        let first = md.find("first").unwrap();
        let second = md.find("second").unwrap();
        let third = md.find("third").unwrap();
        assert!(first < second && second < third);
        assert!(md.contains("## Page 1"));
        assert!(md.contains("## Page 2"));
    }

    #[test]
    fn test_markdown_marks_failures_and_figures() {
        let blocks = vec![
            block("AAAA-BBBB-001", 0, 0.1, BlockType::Text),
            block("AAAA-BBBB-002", 0, 0.3, BlockType::Image),
        ];
        let mut results = HashMap::new();
        results.insert(
            "AAAA-BBBB-002".to_string(),
            ResultRecord {
                block_id: "AAAA-BBBB-002".to_string(),
                text: Some("a stamp".to_string()),
                status: ResultStatus::RetriedOk,
            },
        );
        let md = render_markdown("doc.pdf", &blocks, &results);
        assert!(md.contains("> [recognition failed: AAAA-BBBB-001]"));
        assert!(md.contains("### Figure AAAA-BBBB-002"));
        assert!(md.contains("![AAAA-BBBB-002](crops/AAAA-BBBB-002.pdf)"));
    }

    #[test]
    fn test_zip_contains_expected_entries() {
        let crops = vec![("AAAA-BBBB-001".to_string(), b"%PDF-fake".to_vec())];
        let bytes = build_zip("# md", "{}", &crops).unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"result.md".to_string()));
        assert!(names.contains(&"annotation.json".to_string()));
        assert!(names.contains(&"crops/AAAA-BBBB-001.pdf".to_string()));
    }

    #[test]
    fn test_empty_blocks_produce_empty_markdown() {
        let md = render_markdown("empty.pdf", &[], &HashMap::new());
        assert!(md.starts_with("# empty.pdf"));
        assert!(!md.contains("## Page"));
    }
}
