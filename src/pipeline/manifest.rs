//! The Pass-1 manifest: an append-only JSONL log, one line per page.
//!
//! Pass 2 replays the manifest instead of holding rendered pages in memory;
//! peak RAM stays bounded by a single raster regardless of document size.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::models::BlockType;

use super::PipelineError;

/// One merged strip crop on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripEntry {
    pub strip_id: String,
    pub page_index: u32,
    pub member_ids: Vec<String>,
    pub crop_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// One individual crop on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropEntry {
    pub block_id: String,
    pub page_index: u32,
    pub block_type: BlockType,
    pub crop_path: PathBuf,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Text layer extracted from the PDF region, when the PDF has one.
    #[serde(default)]
    pub pdf_text: String,
}

/// Everything Pass 1 produced for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageManifest {
    pub page_index: u32,
    pub raster_width: u32,
    pub raster_height: u32,
    pub strips: Vec<StripEntry>,
    pub crops: Vec<CropEntry>,
    /// Blocks failed during planning (degenerate geometry).
    #[serde(default)]
    pub failed: Vec<String>,
}

impl PageManifest {
    /// Dispatchable work units on this page.
    pub fn unit_count(&self) -> usize {
        self.strips.len() + self.crops.len()
    }
}

/// Append-only writer for the manifest file.
pub struct ManifestWriter {
    file: tokio::fs::File,
    path: PathBuf,
}

impl ManifestWriter {
    pub async fn create(path: &Path) -> Result<Self, PipelineError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub async fn append(&mut self, page: &PageManifest) -> Result<(), PipelineError> {
        let mut line = serde_json::to_string(page)
            .map_err(|e| PipelineError::Internal(format!("manifest serialize: {}", e)))?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every page line back in order.
pub async fn read_manifest(path: &Path) -> Result<Vec<PageManifest>, PipelineError> {
    let text = tokio::fs::read_to_string(path).await?;
    let mut pages = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let page: PageManifest = serde_json::from_str(line).map_err(|e| {
            PipelineError::Internal(format!("manifest line {} is corrupt: {}", n + 1, e))
        })?;
        pages.push(page);
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.jsonl");

        let mut writer = ManifestWriter::create(&path).await.unwrap();
        for page_index in 0..3u32 {
            writer
                .append(&PageManifest {
                    page_index,
                    raster_width: 2550,
                    raster_height: 3300,
                    strips: vec![StripEntry {
                        strip_id: format!("p{}-s0", page_index),
                        page_index,
                        member_ids: vec!["AAAA-BBBB-001".to_string()],
                        crop_path: dir.path().join("s.png"),
                        width: 100,
                        height: 50,
                    }],
                    crops: vec![],
                    failed: vec![],
                })
                .await
                .unwrap();
        }
        drop(writer);

        let pages = read_manifest(&path).await.unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].page_index, 2);
        assert_eq!(pages[0].strips[0].member_ids, vec!["AAAA-BBBB-001"]);
        assert_eq!(pages[0].unit_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.jsonl");
        tokio::fs::write(&path, "{not json}\n").await.unwrap();
        assert!(read_manifest(&path).await.is_err());
    }
}
