//! Prompt templates for the vision backends.
//!
//! Templates use `{{placeholder}}` substitution. The strip template asks for
//! a JSON object keyed by block id, which also flips the dispatcher into
//! JSON mode via `wants_json`.

use std::collections::HashMap;

use crate::models::BlockType;

/// System role content sent with every vision request.
pub const SYSTEM_PROMPT: &str = "You are a meticulous OCR engine. Transcribe exactly what is in \
the image. Never invent content. Preserve line breaks inside paragraphs only when they are \
semantically meaningful.";

/// Batch prompt for a strip of text/table blocks.
pub const STRIP_BATCH_TEMPLATE: &str = "The image is a vertical strip cut from page \
{{page_index}} of the document \"{{doc_name}}\". It contains these regions, top to bottom:\n\
{{block_list}}\n\
Transcribe each region separately. Respond with a single JSON object whose keys are exactly \
the region ids above and whose values are the transcribed content. Render tables as HTML \
<table> markup; keep plain text as plain text. Use an empty string for a region with no \
legible content.";

/// Single text block.
pub const TEXT_BLOCK_TEMPLATE: &str = "The image is region {{block_id}} from page \
{{page_index}} of \"{{doc_name}}\". Transcribe the text exactly.\n{{hint}}{{pdf_text}}";

/// Single table block.
pub const TABLE_BLOCK_TEMPLATE: &str = "The image is table region {{block_id}} from page \
{{page_index}} of \"{{doc_name}}\". Reconstruct the table as HTML <table> markup, preserving \
merged cells with rowspan/colspan.\n{{hint}}{{pdf_text}}";

/// Single image/figure block.
pub const IMAGE_BLOCK_TEMPLATE: &str = "The image is figure region {{block_id}} from page \
{{page_index}} of \"{{doc_name}}\". Transcribe any visible text (labels, captions, stamps, \
signatures) and add a one-line description of the figure.\n{{hint}}{{pdf_text}}";

/// Substitute `{{name}}` placeholders. Unknown placeholders collapse to the
/// empty string so optional context never leaks template syntax.
pub fn fill(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = values.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// The template used for a single block of the given type.
pub fn single_block_template(block_type: BlockType) -> &'static str {
    match block_type {
        BlockType::Text => TEXT_BLOCK_TEMPLATE,
        BlockType::Table => TABLE_BLOCK_TEMPLATE,
        BlockType::Image => IMAGE_BLOCK_TEMPLATE,
    }
}

/// JSON-indicative phrasing flips the backend into JSON mode.
pub fn wants_json(prompt: &str) -> bool {
    prompt.to_lowercase().contains("json")
}

/// Format the optional hint for template substitution.
pub fn hint_line(hint: Option<&str>) -> String {
    match hint {
        Some(hint) if !hint.is_empty() => format!("Annotator hint: {}\n", hint),
        _ => String::new(),
    }
}

/// Format extracted PDF text for template substitution.
pub fn pdf_text_line(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(
            "Text layer extracted from the PDF for this region (may be incomplete):\n{}\n",
            trimmed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_substitutes_known_placeholders() {
        let mut values = HashMap::new();
        values.insert("doc_name", "report.pdf".to_string());
        values.insert("page_index", "3".to_string());
        let out = fill("page {{page_index}} of {{doc_name}}", &values);
        assert_eq!(out, "page 3 of report.pdf");
    }

    #[test]
    fn test_fill_drops_unknown_placeholders() {
        let out = fill("a{{unknown}}b", &HashMap::new());
        assert_eq!(out, "ab");
    }

    #[test]
    fn test_fill_tolerates_unclosed_braces() {
        let out = fill("a{{broken", &HashMap::new());
        assert_eq!(out, "a{{broken");
    }

    #[test]
    fn test_strip_template_requests_json() {
        assert!(wants_json(STRIP_BATCH_TEMPLATE));
        assert!(!wants_json(TEXT_BLOCK_TEMPLATE));
    }

    #[test]
    fn test_hint_and_pdf_text_lines() {
        assert_eq!(hint_line(None), "");
        assert!(hint_line(Some("stamp")).contains("stamp"));
        assert_eq!(pdf_text_line("   "), "");
        assert!(pdf_text_line("hello").contains("hello"));
    }
}
