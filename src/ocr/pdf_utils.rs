//! PDF helpers shared by the pipeline and the segment backend.
//!
//! Page rasterization shells out to `pdftoppm` and region text extraction to
//! `pdftotext` (both poppler); single-page PDF wrapping of crops is done
//! in-process with lopdf.

use std::path::{Path, PathBuf};

use lopdf::{dictionary, Document, Object, Stream};
use tokio::process::Command;

use super::OcrError;

/// Number of pages in a PDF file.
pub fn page_count(pdf_path: &Path) -> Result<u32, OcrError> {
    let doc = Document::load(pdf_path)
        .map_err(|e| OcrError::Failed(format!("failed to read pdf: {}", e)))?;
    Ok(doc.get_pages().len() as u32)
}

/// Render one page (1-based) to a PNG at the given DPI.
pub async fn render_page(
    pdf_path: &Path,
    page: u32,
    dpi: u32,
    output_dir: &Path,
) -> Result<PathBuf, OcrError> {
    let page_str = page.to_string();
    let output_prefix = output_dir.join("page");

    let status = Command::new("pdftoppm")
        .args(["-png", "-r", &dpi.to_string(), "-f", &page_str, "-l", &page_str])
        .arg(pdf_path)
        .arg(&output_prefix)
        .status()
        .await;

    match status {
        Ok(s) if s.success() => find_page_image(output_dir, page).ok_or_else(|| {
            OcrError::Failed(format!("no image generated for page {}", page))
        }),
        Ok(_) => Err(OcrError::Failed(
            "pdftoppm failed to convert PDF page".to_string(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OcrError::BackendNotAvailable(
            "pdftoppm not found; install poppler-utils".to_string(),
        )),
        Err(e) => Err(OcrError::Io(e)),
    }
}

/// Find the image file for a page number.
///
/// pdftoppm pads the page number to the digit count of the document's last
/// page, so try the plausible widths.
pub fn find_page_image(dir: &Path, page_num: u32) -> Option<PathBuf> {
    for digits in [1, 2, 3, 4] {
        let filename = format!("page-{:0width$}.png", page_num, width = digits);
        let path = dir.join(&filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Extract the text layer under a region, in PDF points (72 dpi units).
///
/// Best-effort: an absent `pdftotext` binary or a scanned page yields an
/// empty string, never an error.
pub async fn extract_region_text(
    pdf_path: &Path,
    page: u32,
    x: i64,
    y: i64,
    width: i64,
    height: i64,
) -> String {
    if width <= 0 || height <= 0 {
        return String::new();
    }
    let page_str = page.to_string();
    let output = Command::new("pdftotext")
        .args(["-f", &page_str, "-l", &page_str])
        .args(["-x", &x.to_string(), "-y", &y.to_string()])
        .args(["-W", &width.to_string(), "-H", &height.to_string()])
        .arg(pdf_path)
        .arg("-")
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        _ => String::new(),
    }
}

/// Wrap a raster image into a one-page PDF sized to the image.
///
/// The image is re-encoded as JPEG and embedded as a DCTDecode XObject; one
/// pixel maps to one PDF point.
pub fn image_to_pdf(image_bytes: &[u8]) -> Result<Vec<u8>, OcrError> {
    let decoded = image::load_from_memory(image_bytes)
        .map_err(|e| OcrError::Failed(format!("failed to decode crop image: {}", e)))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut jpeg = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 92)
        .encode_image(&image::DynamicImage::ImageRgb8(rgb))
        .map_err(|e| OcrError::Failed(format!("failed to encode jpeg: {}", e)))?;

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    ));

    let content = format!("q\n{} 0 0 {} 0 0 cm\n/Im0 Do\nQ", width, height);
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => vec![0.into(), 0.into(), (width as i64).into(), (height as i64).into()],
        "Contents" => Object::Reference(content_id),
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                "Im0" => Object::Reference(image_id),
            },
        },
    });

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| OcrError::Failed(format!("failed to serialize pdf: {}", e)))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_page_image_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(find_page_image(temp.path(), 1).is_none());
    }

    #[test]
    fn test_find_page_image_padding_widths() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page-01.png");
        std::fs::write(&path, b"fake png").unwrap();
        assert_eq!(find_page_image(temp.path(), 1), Some(path));

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("page-1.png");
        std::fs::write(&path, b"fake png").unwrap();
        assert_eq!(find_page_image(temp.path(), 1), Some(path));
    }

    #[test]
    fn test_image_to_pdf_produces_valid_pdf() {
        let mut png = Vec::new();
        let img = image::RgbImage::from_pixel(40, 20, image::Rgb([200u8, 10, 10]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let pdf = image_to_pdf(&png).unwrap();
        assert!(pdf.starts_with(b"%PDF-1.5"));

        // Parses back as a one-page document.
        let doc = Document::load_mem(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn test_image_to_pdf_rejects_garbage() {
        assert!(image_to_pdf(b"not an image").is_err());
    }

    #[tokio::test]
    async fn test_extract_region_text_zero_area() {
        let text = extract_region_text(Path::new("/nonexistent.pdf"), 1, 0, 0, 0, 0).await;
        assert_eq!(text, "");
    }
}
