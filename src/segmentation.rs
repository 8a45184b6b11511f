use geo::MinimumRotatedRect;
use image::{DynamicImage, GrayImage};
use imageproc::{
    contours::{find_contours, BorderType, Contour},
    distance_transform::Norm,
    edges::canny,
    filter::gaussian_blur_f32,
    morphology::close_mut,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::SegmentationOptions,
    util::{bounding_rect, encode_png, rotated_crop, to_geo_poly, RotatedRect},
    Error, Rect, Result, Segment,
};

/// Equivalent of a 5x5 Gaussian kernel.
const BLUR_SIGMA: f32 = 1.1;
const CANNY_LOW: f32 = 30.0;
const CANNY_HIGH: f32 = 120.0;
/// Two closing passes with a 5x5 square element.
const CLOSE_RADIUS: u8 = 4;

/// The segmentation stage as seen by the pipeline.
pub trait Segmenter: Send + Sync {
    /// Splits an encoded image into spine segments ordered left to right.
    fn segment(&self, image_data: &[u8], cancel: &CancellationToken) -> Result<Vec<Segment>>;
}

/// Finds upright, spine-shaped regions with edge detection and contour analysis.
#[derive(Debug, Clone, Default)]
pub struct SpineSegmenter {
    options: SegmentationOptions,
}

impl SpineSegmenter {
    pub fn new(options: SegmentationOptions) -> Self {
        Self { options }
    }

    fn accepts(&self, rect: &Rect, image_area: f64) -> bool {
        if rect.is_empty() {
            return false;
        }
        let area_fraction = rect.area() as f64 / image_area;
        if area_fraction < self.options.min_area_fraction
            || area_fraction > self.options.max_area_fraction
        {
            return false;
        }
        let aspect_ratio = rect.width as f64 / rect.height as f64;
        aspect_ratio >= self.options.min_aspect_ratio
            && aspect_ratio <= self.options.max_aspect_ratio
    }
}

impl Segmenter for SpineSegmenter {
    #[instrument(level = "debug", skip_all, fields(bytes = image_data.len()))]
    fn segment(&self, image_data: &[u8], cancel: &CancellationToken) -> Result<Vec<Segment>> {
        if image_data.is_empty() {
            return Ok(Vec::new());
        }

        let source = match image::load_from_memory(image_data) {
            Ok(image) => image.to_rgb8(),
            Err(err) => {
                log::warn!("Unable to decode uploaded image for segmentation: {err}");
                return Ok(Vec::new());
            }
        };
        check_cancelled(cancel)?;

        let pixels = source.width() as u64 * source.height() as u64;
        if pixels > self.options.max_image_pixels {
            return Err(Error::ImageTooLarge {
                pixels,
                limit: self.options.max_image_pixels,
            });
        }

        let closed = edge_map(&image::imageops::grayscale(&source), cancel)?;

        let mut contours = find_contours::<i32>(&closed)
            .into_iter()
            .filter(is_external)
            .map(|contour| {
                let rect = bounding_rect(&contour.points);
                (contour, rect)
            })
            .collect::<Vec<_>>();
        contours.sort_by_key(|(_, rect)| rect.x);
        check_cancelled(cancel)?;
        log::debug!("Found {} external contours", contours.len());

        let image_area = pixels as f64;
        let max_segments = self.options.max_segments;
        let mut segments = Vec::new();

        for (contour, rect) in contours {
            check_cancelled(cancel)?;

            if !self.accepts(&rect, image_area) {
                continue;
            }

            let Some(rotated) = to_geo_poly(&contour.points)
                .minimum_rotated_rect()
                .and_then(|poly| RotatedRect::from_polygon(&poly))
            else {
                continue;
            };
            let Some(crop) = rotated_crop(&source, &rotated) else {
                continue;
            };
            let image_data = match encode_png(&DynamicImage::ImageRgb8(crop)) {
                Ok(data) => data,
                Err(err) => {
                    log::debug!("Skipping region at {rect:?}, crop failed to encode: {err}");
                    continue;
                }
            };

            #[cfg(feature = "debug")]
            {
                let path = format!("debug_segments/{}.png", segments.len());
                if let Err(err) = std::fs::write(&path, &image_data) {
                    log::warn!("Failed to write {path}: {err}");
                }
            }

            segments.push(Segment {
                bounding_box: rect,
                image_data,
            });

            if segments.len() >= max_segments {
                log::info!(
                    "Max segment limit of {max_segments} reached; stopping contour processing."
                );
                break;
            }
        }

        segments.sort_by_key(|it| it.bounding_box.x);
        segments.truncate(max_segments);
        Ok(segments)
    }
}

/// Grayscale -> blur -> edges -> closing, so a spine's two border lines merge into one blob.
fn edge_map(gray: &GrayImage, cancel: &CancellationToken) -> Result<GrayImage> {
    let blurred = gaussian_blur_f32(gray, BLUR_SIGMA);
    check_cancelled(cancel)?;
    let mut edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    check_cancelled(cancel)?;
    close_mut(&mut edges, Norm::LInf, CLOSE_RADIUS);
    check_cancelled(cancel)?;
    Ok(edges)
}

fn is_external(contour: &Contour<i32>) -> bool {
    contour.border_type == BorderType::Outer && contour.parent.is_none()
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
