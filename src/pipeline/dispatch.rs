//! Pass 2: replay the manifest through a bounded pool of backend calls.
//!
//! Units (strips and individual crops) feed `ocr_threads_per_job` concurrent
//! recognitions. Completions update progress and probe the pause/cancel
//! checkpoint every few units; a stop drops the remaining in-flight futures,
//! which is safe because executions restart from Pass 1.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};

use crate::models::{Block, BlockType, Job, JobSettings, ResultRecord};
use crate::ocr::prompts;

use super::manifest::{read_manifest, CropEntry, StripEntry};
use super::render::PassOneOutput;
use super::{Checkpoint, JobExecutor, PipelineDeps, PipelineError};

enum Unit {
    Strip(StripEntry),
    Crop(CropEntry),
}

/// Run Pass 2, merging per-block records into `results`.
///
/// Returns the checkpoint state that ended the pass: `Continue` means every
/// unit was dispatched.
pub async fn run_pass_two(
    deps: &PipelineDeps,
    executor: &JobExecutor,
    job: &Job,
    job_settings: &JobSettings,
    blocks: &[Block],
    pass_one: &PassOneOutput,
    results: &mut HashMap<String, ResultRecord>,
) -> Result<Checkpoint, PipelineError> {
    if pass_one.total_units == 0 {
        return Ok(Checkpoint::Continue);
    }

    let pages = read_manifest(&pass_one.manifest_path).await?;
    let block_types: HashMap<&str, BlockType> = blocks
        .iter()
        .map(|b| (b.id.as_str(), b.block_type))
        .collect();

    let mut units: Vec<Unit> = Vec::with_capacity(pass_one.total_units);
    for page in pages {
        units.extend(page.strips.into_iter().map(Unit::Strip));
        units.extend(page.crops.into_iter().map(Unit::Crop));
    }

    let total = units.len();
    let mut stream = stream::iter(units.into_iter().map(|unit| {
        let block_types = &block_types;
        async move { process_unit(deps, job, job_settings, unit, block_types).await }
    }))
    .buffer_unordered(deps.settings.ocr_threads_per_job.max(1));

    let mut completed = 0usize;
    while let Some(records) = stream.next().await {
        for record in records {
            results.insert(record.block_id.clone(), record);
        }
        completed += 1;

        let every = deps.settings.progress_every_blocks.max(1);
        if completed % every == 0 || completed == total {
            let fraction = completed as f64 / total as f64;
            executor
                .report(
                    0.05 + 0.85 * fraction,
                    &format!("recognizing {}/{} regions", completed, total),
                )
                .await?;
            match executor.checkpoint().await? {
                Checkpoint::Continue => {}
                stopped => return Ok(stopped),
            }
        }
    }

    Ok(Checkpoint::Continue)
}

/// Recognize one unit. Backend failures never fail the job here: they
/// produce failed/missing records for the verification pass to retry.
async fn process_unit(
    deps: &PipelineDeps,
    job: &Job,
    job_settings: &JobSettings,
    unit: Unit,
    block_types: &HashMap<&str, BlockType>,
) -> Vec<ResultRecord> {
    match unit {
        Unit::Strip(strip) => process_strip(deps, job, job_settings, strip, block_types).await,
        Unit::Crop(crop) => vec![process_crop(deps, job, job_settings, crop).await],
    }
}

async fn process_strip(
    deps: &PipelineDeps,
    job: &Job,
    job_settings: &JobSettings,
    strip: StripEntry,
    block_types: &HashMap<&str, BlockType>,
) -> Vec<ResultRecord> {
    let image = match tokio::fs::read(&strip.crop_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(job_id = %job.id, strip_id = %strip.strip_id, "crop unreadable: {}", e);
            return strip
                .member_ids
                .iter()
                .map(|id| ResultRecord::failed(id.clone()))
                .collect();
        }
    };

    let block_list = strip
        .member_ids
        .iter()
        .map(|id| {
            let block_type = block_types
                .get(id.as_str())
                .copied()
                .unwrap_or(BlockType::Text);
            format!("- {} ({})", id, block_type)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut values = HashMap::new();
    values.insert("doc_name", job.document_name.clone());
    values.insert("page_index", strip.page_index.to_string());
    values.insert("block_list", block_list);
    let prompt = prompts::fill(prompts::STRIP_BATCH_TEMPLATE, &values);

    // A strip mixing text and tables goes to the table model, which handles
    // both.
    let any_table = strip.member_ids.iter().any(|id| {
        block_types.get(id.as_str()).copied() == Some(BlockType::Table)
    });
    let model = if any_table {
        &job_settings.table_model
    } else {
        &job_settings.text_model
    };

    match deps
        .dispatcher
        .recognize(job.engine, &image, &prompt, model, false)
        .await
    {
        Ok(response) => {
            let matched = super::matcher::match_response(
                &response,
                &strip.member_ids,
                deps.settings.fuzzy_threshold,
            );
            strip
                .member_ids
                .iter()
                .map(|id| match matched.get(id) {
                    Some(text) => ResultRecord::ok(id.clone(), text.clone()),
                    None => ResultRecord::missing(id.clone()),
                })
                .collect()
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, strip_id = %strip.strip_id, "strip recognition failed: {}", e);
            strip
                .member_ids
                .iter()
                .map(|id| ResultRecord::failed(id.clone()))
                .collect()
        }
    }
}

async fn process_crop(
    deps: &PipelineDeps,
    job: &Job,
    job_settings: &JobSettings,
    crop: CropEntry,
) -> ResultRecord {
    let image = match tokio::fs::read(&crop.crop_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(job_id = %job.id, block_id = %crop.block_id, "crop unreadable: {}", e);
            return ResultRecord::failed(crop.block_id);
        }
    };

    let mut values = HashMap::new();
    values.insert("doc_name", job.document_name.clone());
    values.insert("page_index", crop.page_index.to_string());
    values.insert("block_id", crop.block_id.clone());
    values.insert("hint", prompts::hint_line(crop.hint.as_deref()));
    values.insert("pdf_text", prompts::pdf_text_line(&crop.pdf_text));
    let prompt = prompts::fill(prompts::single_block_template(crop.block_type), &values);
    let model = job_settings.model_for(crop.block_type);

    match deps
        .dispatcher
        .recognize(job.engine, &image, &prompt, model, false)
        .await
    {
        Ok(text) => ResultRecord::ok(crop.block_id, text),
        Err(e) => {
            tracing::warn!(job_id = %job.id, block_id = %crop.block_id, "recognition failed: {}", e);
            ResultRecord::failed(crop.block_id)
        }
    }
}
