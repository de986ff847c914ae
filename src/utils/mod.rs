//! Formatting utilities.

use crate::models::FileType;

/// Format a byte count as a human-readable size.
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Icon shown next to an artifact in job details.
pub fn file_icon(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Pdf => "📄",
        FileType::Blocks => "🧩",
        FileType::Annotation => "📝",
        FileType::ResultMd => "📃",
        FileType::ResultZip => "🗜",
        FileType::Crop => "🖼",
        FileType::OcrHtml => "🌐",
        FileType::ResultJson => "🧾",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1500), "1.5 KB");
        assert_eq!(format_size(1_500_000), "1.5 MB");
        assert_eq!(format_size(1_500_000_000), "1.5 GB");
    }

    #[test]
    fn test_every_file_type_has_an_icon() {
        for file_type in [
            FileType::Pdf,
            FileType::Blocks,
            FileType::Annotation,
            FileType::ResultMd,
            FileType::ResultZip,
            FileType::Crop,
            FileType::OcrHtml,
            FileType::ResultJson,
        ] {
            assert!(!file_icon(file_type).is_empty());
        }
    }
}
