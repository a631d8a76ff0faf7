use crate::core::types::{
    BlockKind, BorderMetrics, FeatureEnvelope, FontMetrics, ImageMeta, OcrBlock, QualityMetrics,
};
use crate::vision::capability::{ObjectStore, VisionCapability};
use anyhow::Result;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Detected card region inside the photo frame, in pixel coordinates.
#[derive(Clone, Copy, Debug)]
struct CardRegion {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
}

impl CardRegion {
    fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Turns a raw image into a structured feature envelope: OCR blocks,
/// border/symmetry metrics, holographic variance, quality metrics.
///
/// Contract: never errors on a readable image. An unreadable or corrupt
/// image yields a degraded envelope (empty OCR, zeroed metrics) so the rest
/// of the pipeline still runs. Only a missing image reference propagates.
pub struct FeatureExtractionService {
    store: Arc<dyn ObjectStore>,
    vision: Arc<dyn VisionCapability>,
}

impl FeatureExtractionService {
    pub fn new(store: Arc<dyn ObjectStore>, vision: Arc<dyn VisionCapability>) -> Self {
        Self { store, vision }
    }

    pub async fn extract(&self, image_ref: &str) -> Result<FeatureEnvelope> {
        let bytes = self.store.get_image_bytes(image_ref).await?;

        let format = image::guess_format(&bytes).ok();
        let decoded = match image::load_from_memory(&bytes) {
            Ok(img) => img,
            Err(e) => {
                warn!("image {} undecodable, running degraded: {}", image_ref, e);
                return Ok(FeatureEnvelope::degraded(ImageMeta {
                    width: 0,
                    height: 0,
                    format: "unknown".to_string(),
                    size_bytes: bytes.len() as u64,
                }));
            }
        };

        let image_meta = ImageMeta {
            width: decoded.width(),
            height: decoded.height(),
            format: format
                .map(format_name)
                .unwrap_or("unknown")
                .to_string(),
            size_bytes: bytes.len() as u64,
        };

        // Vision services accept JPEG/PNG; re-encode anything else.
        let vision_bytes = match format {
            Some(ImageFormat::Png) | Some(ImageFormat::Jpeg) => bytes,
            _ => match to_png(&decoded) {
                Ok(png) => png,
                Err(e) => {
                    warn!("PNG conversion failed for {}: {}", image_ref, e);
                    bytes
                }
            },
        };

        let luma = decoded.to_luma8();
        let region = detect_card_region(&luma);

        // OCR and label detection hit the network; pixel analysis is pure CPU
        // over the already-decoded buffer. All three are independent reads.
        let (ocr_res, labels_res, pixel) = tokio::join!(
            self.vision.detect_text(&vision_bytes),
            self.vision.detect_labels(&vision_bytes),
            async { analyze_pixels(&decoded, &luma, region) }
        );

        let ocr = match ocr_res {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("text detection failed for {}: {:#}", image_ref, e);
                Vec::new()
            }
        };
        let labels = match labels_res {
            Ok(labels) => labels,
            Err(e) => {
                warn!("label detection failed for {}: {:#}", image_ref, e);
                Vec::new()
            }
        };

        let font_metrics = font_metrics_from_blocks(&ocr);

        debug!(
            "extracted {} OCR blocks, {} labels, holo={:.2}, blur={:.2}",
            ocr.len(),
            labels.len(),
            pixel.holo_variance,
            pixel.quality.blur_score
        );

        Ok(FeatureEnvelope {
            ocr,
            labels,
            borders: pixel.borders,
            holo_variance: pixel.holo_variance,
            font_metrics,
            quality: pixel.quality,
            image_meta,
        })
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "other",
    }
}

fn to_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

struct PixelAnalysis {
    borders: BorderMetrics,
    holo_variance: f64,
    quality: QualityMetrics,
}

/// Card-boundary detection via edge gradients: pick the tightest box whose
/// row/column gradient energy clears a fraction of the peak. If the detected
/// region has an implausible aspect ratio or is too small a share of the
/// frame, analyze the full image instead of failing.
fn detect_card_region(luma: &GrayImage) -> CardRegion {
    let (w, h) = luma.dimensions();
    let full = CardRegion {
        left: 0,
        top: 0,
        right: w,
        bottom: h,
    };
    if w < 16 || h < 16 {
        return full;
    }

    let mut col_energy = vec![0f64; w as usize];
    let mut row_energy = vec![0f64; h as usize];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = luma.get_pixel(x + 1, y).0[0] as f64 - luma.get_pixel(x - 1, y).0[0] as f64;
            let gy = luma.get_pixel(x, y + 1).0[0] as f64 - luma.get_pixel(x, y - 1).0[0] as f64;
            let g = gx.abs() + gy.abs();
            col_energy[x as usize] += g;
            row_energy[y as usize] += g;
        }
    }

    let col_peak = col_energy.iter().cloned().fold(0.0, f64::max);
    let row_peak = row_energy.iter().cloned().fold(0.0, f64::max);
    if col_peak <= 0.0 || row_peak <= 0.0 {
        return full;
    }
    let col_thresh = col_peak * 0.25;
    let row_thresh = row_peak * 0.25;

    let left = col_energy.iter().position(|&e| e >= col_thresh).unwrap_or(0) as u32;
    let right = w - col_energy
        .iter()
        .rev()
        .position(|&e| e >= col_thresh)
        .unwrap_or(0) as u32;
    let top = row_energy.iter().position(|&e| e >= row_thresh).unwrap_or(0) as u32;
    let bottom = h - row_energy
        .iter()
        .rev()
        .position(|&e| e >= row_thresh)
        .unwrap_or(0) as u32;

    let region = CardRegion {
        left,
        top,
        right,
        bottom,
    };

    // Plausibility gate: a trading card is portrait, roughly 63x88mm, and
    // should dominate the photo.
    let rw = region.width() as f64;
    let rh = region.height() as f64;
    if rw < 1.0 || rh < 1.0 {
        return full;
    }
    let aspect = rw / rh;
    let area_share = (rw * rh) / (w as f64 * h as f64);
    if !(0.5..=0.95).contains(&aspect) || area_share < 0.2 {
        debug!(
            "implausible card region (aspect {:.2}, area {:.2}), using full frame",
            aspect, area_share
        );
        return full;
    }
    region
}

fn analyze_pixels(img: &DynamicImage, luma: &GrayImage, region: CardRegion) -> PixelAnalysis {
    PixelAnalysis {
        borders: border_metrics(luma, region),
        holo_variance: holo_variance(img, region),
        quality: quality_metrics(luma),
    }
}

/// Margins of the card region relative to the frame, plus a left/right and
/// top/bottom symmetry score. Off-center crops score low.
fn border_metrics(luma: &GrayImage, region: CardRegion) -> BorderMetrics {
    let (w, h) = luma.dimensions();
    if w == 0 || h == 0 {
        return BorderMetrics::default();
    }
    let left_ratio = region.left as f64 / w as f64;
    let right_ratio = (w - region.right) as f64 / w as f64;
    let top_ratio = region.top as f64 / h as f64;
    let bottom_ratio = (h - region.bottom) as f64 / h as f64;

    let horizontal = (left_ratio - right_ratio).abs();
    let vertical = (top_ratio - bottom_ratio).abs();
    let symmetry_score = (1.0 - 2.0 * (horizontal + vertical)).clamp(0.0, 1.0);

    BorderMetrics {
        top_ratio,
        bottom_ratio,
        left_ratio,
        right_ratio,
        symmetry_score,
    }
}

/// Holographic foil shows up as high cell-to-cell variance in color
/// saturation across the art box. Sampled on a coarse grid; normalized so a
/// matte card sits near 0 and heavy foil near 1.
fn holo_variance(img: &DynamicImage, region: CardRegion) -> f64 {
    const GRID: u32 = 12;
    const NORM: f64 = 0.015; // empirical: saturation variance of heavy foil

    let rw = region.width();
    let rh = region.height();
    if rw < GRID || rh < GRID {
        return 0.0;
    }
    let rgb = img.to_rgb8();
    let cell_w = rw / GRID;
    let cell_h = rh / GRID;

    let mut cell_sats = Vec::with_capacity((GRID * GRID) as usize);
    for gy in 0..GRID {
        for gx in 0..GRID {
            let x0 = region.left + gx * cell_w;
            let y0 = region.top + gy * cell_h;
            let mut sum = 0.0;
            let mut n = 0u32;
            // sparse sample within the cell
            let step = (cell_w.min(cell_h) / 8).max(1);
            let mut y = y0;
            while y < y0 + cell_h {
                let mut x = x0;
                while x < x0 + cell_w {
                    let p = rgb.get_pixel(x.min(rgb.width() - 1), y.min(rgb.height() - 1));
                    let (r, g, b) = (p.0[0] as f64, p.0[1] as f64, p.0[2] as f64);
                    let max = r.max(g).max(b);
                    let min = r.min(g).min(b);
                    let sat = if max > 0.0 { (max - min) / max } else { 0.0 };
                    sum += sat;
                    n += 1;
                    x += step;
                }
                y += step;
            }
            if n > 0 {
                cell_sats.push(sum / n as f64);
            }
        }
    }

    (variance(&cell_sats) / NORM).clamp(0.0, 1.0)
}

fn quality_metrics(luma: &GrayImage) -> QualityMetrics {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return QualityMetrics::default();
    }

    let mut lap = Vec::with_capacity(((w - 2) * (h - 2)) as usize / 4);
    let mut sum_luma = 0u64;
    let mut bright_pixels = 0u64;
    let total = (w as u64) * (h as u64);

    for y in 0..h {
        for x in 0..w {
            let v = luma.get_pixel(x, y).0[0];
            sum_luma += v as u64;
            if v >= 250 {
                bright_pixels += 1;
            }
        }
    }
    // Laplacian on a sparse grid keeps this cheap on large photos.
    let step = ((w.min(h)) / 256).max(1);
    let mut y = 1;
    while y < h - 1 {
        let mut x = 1;
        while x < w - 1 {
            let center = 4.0 * luma.get_pixel(x, y).0[0] as f64;
            let neighbors = luma.get_pixel(x - 1, y).0[0] as f64
                + luma.get_pixel(x + 1, y).0[0] as f64
                + luma.get_pixel(x, y - 1).0[0] as f64
                + luma.get_pixel(x, y + 1).0[0] as f64;
            lap.push(center - neighbors);
            x += step;
        }
        y += step;
    }

    // Laplacian variance of a sharp photo is in the hundreds.
    const BLUR_NORM: f64 = 400.0;
    let blur_score = (variance(&lap) / BLUR_NORM).clamp(0.0, 1.0);
    let brightness = sum_luma as f64 / total as f64 / 255.0;
    let glare_detected = bright_pixels as f64 / total as f64 > 0.02;

    QualityMetrics {
        blur_score,
        glare_detected,
        brightness,
    }
}

/// Typography signals from OCR geometry: kerning gaps between words, how
/// consistently lines share a left edge, and line-height variance. Fakes
/// tend to drift on all three.
fn font_metrics_from_blocks(blocks: &[OcrBlock]) -> FontMetrics {
    let lines: Vec<&OcrBlock> = blocks.iter().filter(|b| b.kind == BlockKind::Line).collect();
    let words: Vec<&OcrBlock> = blocks.iter().filter(|b| b.kind == BlockKind::Word).collect();

    let mut kerning = Vec::new();
    // gaps between words sharing a vertical band
    let mut sorted = words.clone();
    sorted.sort_by(|a, b| {
        (a.bounding_box.top, a.bounding_box.left)
            .partial_cmp(&(b.bounding_box.top, b.bounding_box.left))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for pair in sorted.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let same_line = (a.bounding_box.top - b.bounding_box.top).abs()
            < a.bounding_box.height.max(b.bounding_box.height);
        if same_line {
            let gap = b.bounding_box.left - (a.bounding_box.left + a.bounding_box.width);
            if gap > 0.0 {
                kerning.push(gap);
            }
        }
    }

    let lefts: Vec<f64> = lines.iter().map(|b| b.bounding_box.left).collect();
    let heights: Vec<f64> = lines.iter().map(|b| b.bounding_box.height).collect();

    // 0.05 of frame width of left-edge drift counts as fully misaligned
    let alignment = (1.0 - variance(&lefts).sqrt() / 0.05).clamp(0.0, 1.0);
    let font_size_variance = variance(&heights);

    FontMetrics {
        kerning,
        alignment,
        font_size_variance,
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}
