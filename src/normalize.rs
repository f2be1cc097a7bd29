//! Image Normalizer: decodes input bytes into logical pages and produces the
//! fixed set of preprocessed frame variants the OCR runner scores against.
//!
//! Raster inputs yield one page with four recipe frames. PDFs are handled per
//! page: a page with a text layer skips rasterization entirely; a fully
//! scanned PDF (no text anywhere) contributes its embedded JPEG images as
//! frames instead.

use crate::error::ExtractionError;
use image::imageops::FilterType;
use image::{GrayImage, ImageFormat, Luma};
use imageproc::contrast::{adaptive_threshold, otsu_level, stretch_contrast, threshold};
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use lopdf::{Document, Object};
use std::io::Cursor;
use tracing::{debug, warn};

/// Named preprocessing recipes, applied in this fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipe {
    GrayscaleThreshold,
    AdaptiveThreshold,
    ContrastDenoise,
    Deskew,
}

impl Recipe {
    pub const ALL: [Recipe; 4] = [
        Recipe::GrayscaleThreshold,
        Recipe::AdaptiveThreshold,
        Recipe::ContrastDenoise,
        Recipe::Deskew,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Recipe::GrayscaleThreshold => "grayscale-threshold",
            Recipe::AdaptiveThreshold => "adaptive-threshold",
            Recipe::ContrastDenoise => "contrast-denoise",
            Recipe::Deskew => "deskew",
        }
    }
}

/// One preprocessed variant of a raster page. Transient: owned by the OCR
/// runner for the duration of a single run.
#[derive(Debug)]
pub struct PreprocessedFrame {
    pub recipe: Recipe,
    pub image: GrayImage,
}

/// What the OCR runner receives for one logical page.
#[derive(Debug)]
pub enum PageContent {
    /// Raster variants to OCR, best one wins.
    Frames(Vec<PreprocessedFrame>),
    /// Digital text layer (PDF); no OCR needed.
    TextLayer(String),
}

#[derive(Debug)]
pub struct LogicalPage {
    /// 1-indexed.
    pub page_num: u32,
    pub content: PageContent,
}

const ADAPTIVE_BLOCK_RADIUS: u32 = 10;
const MEDIAN_RADIUS: u32 = 1;
/// Skew search range in degrees, either side of level.
const DESKEW_MAX_DEGREES: f32 = 5.0;
const DESKEW_STEP_DEGREES: f32 = 0.5;

/// Decode raw bytes into logical pages. The only fatal pipeline error:
/// undecodable input (or a MIME type disagreeing with the actual content)
/// is reported as `InvalidDocument` and the run stops here.
pub fn normalize(data: &[u8], mime: &str) -> Result<Vec<LogicalPage>, ExtractionError> {
    if data.is_empty() {
        return Err(ExtractionError::InvalidDocument("empty file".to_string()));
    }

    match mime {
        "application/pdf" => normalize_pdf(data),
        "image/jpeg" | "image/png" | "image/webp" => normalize_image(data, mime),
        other => Err(ExtractionError::UnsupportedFileType(other.to_string())),
    }
}

fn normalize_image(data: &[u8], mime: &str) -> Result<Vec<LogicalPage>, ExtractionError> {
    let format = image::guess_format(data)
        .map_err(|e| ExtractionError::InvalidDocument(format!("unrecognized image: {}", e)))?;

    let expected = match mime {
        "image/jpeg" => ImageFormat::Jpeg,
        "image/png" => ImageFormat::Png,
        "image/webp" => ImageFormat::WebP,
        _ => unreachable!("caller filters MIME types"),
    };
    if format != expected {
        return Err(ExtractionError::InvalidDocument(format!(
            "declared type {} but content is {:?}",
            mime, format
        )));
    }

    let decoded = image::load_from_memory(data)
        .map_err(|e| ExtractionError::InvalidDocument(format!("image decode failed: {}", e)))?;

    let gray = decoded.to_luma8();
    Ok(vec![LogicalPage {
        page_num: 1,
        content: PageContent::Frames(preprocess_variants(&gray)),
    }])
}

fn normalize_pdf(data: &[u8]) -> Result<Vec<LogicalPage>, ExtractionError> {
    if !data.starts_with(b"%PDF") {
        return Err(ExtractionError::InvalidDocument(
            "declared type application/pdf but content is not a PDF".to_string(),
        ));
    }

    let doc = Document::load_from(Cursor::new(data))
        .map_err(|e| ExtractionError::InvalidDocument(format!("PDF load failed: {}", e)))?;

    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
        return Err(ExtractionError::InvalidDocument(
            "PDF contains no pages".to_string(),
        ));
    }

    let mut pages = Vec::new();
    let mut any_text = false;
    for &page_num in &page_numbers {
        let text = doc.extract_text(&[page_num]).unwrap_or_default();
        if !text.trim().is_empty() {
            any_text = true;
        }
        pages.push(LogicalPage {
            page_num,
            content: PageContent::TextLayer(text),
        });
    }

    if any_text {
        debug!("PDF has a text layer on {} page(s), skipping OCR", pages.len());
        return Ok(pages);
    }

    // Fully scanned PDF: no text layer anywhere. OCR the embedded JPEG images
    // instead, each as its own logical page.
    let images = extract_embedded_jpegs(&doc);
    if images.is_empty() {
        warn!("Scanned PDF with no extractable images, producing empty pages");
        return Ok(pages);
    }

    debug!("Scanned PDF: preprocessing {} embedded image(s)", images.len());
    let mut frame_pages = Vec::new();
    for (idx, jpeg) in images.into_iter().enumerate() {
        match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
            Ok(decoded) => {
                let gray = decoded.to_luma8();
                frame_pages.push(LogicalPage {
                    page_num: idx as u32 + 1,
                    content: PageContent::Frames(preprocess_variants(&gray)),
                });
            }
            Err(e) => warn!("Skipping undecodable embedded image {}: {}", idx, e),
        }
    }

    if frame_pages.is_empty() {
        // No decodable image either; degrade to empty text pages rather
        // than failing. Downstream yields an all-null record.
        return Ok(pages);
    }
    Ok(frame_pages)
}

/// Pull DCT-encoded (JPEG) image streams out of a PDF.
fn extract_embedded_jpegs(doc: &Document) -> Vec<Vec<u8>> {
    let mut images = Vec::new();
    for (_, object) in doc.objects.iter() {
        let Object::Stream(stream) = object else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(|o| o.as_name())
            .map(|n| n == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let is_dct = match stream.dict.get(b"Filter") {
            Ok(Object::Name(name)) => name == b"DCTDecode",
            Ok(Object::Array(filters)) => filters
                .iter()
                .any(|f| f.as_name().map(|n| n == b"DCTDecode").unwrap_or(false)),
            _ => false,
        };
        if is_dct {
            images.push(stream.content.clone());
        }
    }
    images
}

/// Apply the fixed recipe set to a grayscale page.
fn preprocess_variants(gray: &GrayImage) -> Vec<PreprocessedFrame> {
    Recipe::ALL
        .iter()
        .map(|&recipe| PreprocessedFrame {
            recipe,
            image: apply_recipe(gray, recipe),
        })
        .collect()
}

fn apply_recipe(gray: &GrayImage, recipe: Recipe) -> GrayImage {
    match recipe {
        Recipe::GrayscaleThreshold => {
            let level = otsu_level(gray);
            threshold(gray, level)
        }
        Recipe::AdaptiveThreshold => adaptive_threshold(gray, ADAPTIVE_BLOCK_RADIUS),
        Recipe::ContrastDenoise => {
            let stretched = stretch_contrast(gray, 40, 215);
            median_filter(&stretched, MEDIAN_RADIUS, MEDIAN_RADIUS)
        }
        Recipe::Deskew => {
            let angle = estimate_skew_degrees(gray);
            if angle.abs() < f32::EPSILON {
                gray.clone()
            } else {
                rotate_about_center(
                    gray,
                    angle.to_radians(),
                    Interpolation::Bilinear,
                    Luma([255u8]),
                )
            }
        }
    }
}

/// Estimate page skew by projection-profile search: text rows on a level page
/// concentrate dark pixels into few rows, maximizing the variance of per-row
/// dark-pixel counts. Searches a small angle window on a downscaled binary
/// thumbnail.
fn estimate_skew_degrees(gray: &GrayImage) -> f32 {
    const THUMB_WIDTH: u32 = 400;
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let scale = (THUMB_WIDTH as f32 / w as f32).min(1.0);
    let tw = ((w as f32 * scale) as u32).max(1);
    let th = ((h as f32 * scale) as u32).max(1);
    let thumb = image::imageops::resize(gray, tw, th, FilterType::Triangle);
    let level = otsu_level(&thumb);
    let binary = threshold(&thumb, level);

    let mut best_angle = 0.0f32;
    let mut best_score = projection_variance(&binary);

    let steps = (DESKEW_MAX_DEGREES / DESKEW_STEP_DEGREES) as i32;
    for i in -steps..=steps {
        let angle = i as f32 * DESKEW_STEP_DEGREES;
        if angle == 0.0 {
            continue;
        }
        let rotated = rotate_about_center(
            &binary,
            angle.to_radians(),
            Interpolation::Nearest,
            Luma([255u8]),
        );
        let score = projection_variance(&rotated);
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
    }
    best_angle
}

fn projection_variance(binary: &GrayImage) -> f64 {
    let h = binary.height();
    if h == 0 {
        return 0.0;
    }
    let mut rows = vec![0u32; h as usize];
    for (_, y, pixel) in binary.enumerate_pixels() {
        if pixel.0[0] == 0 {
            rows[y as usize] += 1;
        }
    }
    let mean = rows.iter().map(|&c| c as f64).sum::<f64>() / h as f64;
    rows.iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / h as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn sample_png() -> Vec<u8> {
        // White page with a black band, enough structure for every recipe.
        let mut img = GrayImage::from_pixel(120, 80, Luma([255u8]));
        for y in 30..40 {
            for x in 10..110 {
                img.put_pixel(x, y, Luma([0u8]));
            }
        }
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_image_yields_one_page_with_all_recipes() {
        let pages = normalize(&sample_png(), "image/png").unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_num, 1);
        match &pages[0].content {
            PageContent::Frames(frames) => {
                let names: Vec<&str> = frames.iter().map(|f| f.recipe.name()).collect();
                assert_eq!(
                    names,
                    vec![
                        "grayscale-threshold",
                        "adaptive-threshold",
                        "contrast-denoise",
                        "deskew"
                    ]
                );
            }
            PageContent::TextLayer(_) => panic!("expected raster frames"),
        }
    }

    #[test]
    fn test_undecodable_bytes_are_invalid_document() {
        let err = normalize(b"definitely not an image", "image/png").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidDocument(_)));
    }

    #[test]
    fn test_empty_input_is_invalid_document() {
        let err = normalize(b"", "image/jpeg").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidDocument(_)));
    }

    #[test]
    fn test_mime_mismatch_is_invalid_document() {
        // Valid PNG bytes declared as JPEG.
        let err = normalize(&sample_png(), "image/jpeg").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidDocument(_)));
    }

    #[test]
    fn test_unknown_mime_rejected() {
        let err = normalize(b"anything", "text/csv").unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFileType(_)));
    }

    #[test]
    fn test_not_a_pdf_is_invalid_document() {
        let err = normalize(b"plain text body", "application/pdf").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidDocument(_)));
    }

    #[test]
    fn test_skew_estimate_is_zero_for_level_page() {
        let png = sample_png();
        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        let angle = estimate_skew_degrees(&decoded);
        assert!(angle.abs() <= DESKEW_STEP_DEGREES + f32::EPSILON);
    }
}
