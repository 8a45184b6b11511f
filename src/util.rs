use std::io::Cursor;

use geo::{
    point, Area, BoundingRect, Contains, Coord, EuclideanLength, HasDimensions, LineString,
    MinimumRotatedRect, Polygon, Translate,
};
use geo_clipper::{Clipper, EndType, JoinType};
use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, Pixel, Rgb, RgbImage};
use imageproc::point::Point;
use nalgebra::{Isometry2, Point2, UnitComplex};
use ndarray::{s, Array3, ArrayView2, Axis};
use tracing::instrument;

use crate::Rect;

#[instrument(level = "debug", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

pub(crate) fn to_luma_image(data: ArrayView2<f32>) -> Option<GrayImage> {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    let pixel_data = data
        .axis_iter(Axis(0))
        .flat_map(|it| it.into_iter())
        .map(|p| (p * 255.0) as u8)
        .collect::<Vec<u8>>();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
}

pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f32> {
    let points = points
        .iter()
        .map(|point| Coord {
            x: point.x as f32,
            y: point.y as f32,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

/// Upright bounding box of a contour, inclusive of its edge pixels.
pub(crate) fn bounding_rect(points: &[Point<i32>]) -> Rect {
    let Some(first) = points.first() else {
        return Rect::default();
    };
    let (min_x, min_y, max_x, max_y) = points.iter().fold(
        (first.x, first.y, first.x, first.y),
        |(min_x, min_y, max_x, max_y), p| {
            (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y))
        },
    );
    Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

pub(crate) fn max_side(rect: &Polygon<f32>) -> f32 {
    rect.exterior()
        .lines()
        .map(|it| it.euclidean_length() as i32)
        .max()
        .unwrap_or(0) as f32
}

pub(crate) fn box_score_fast(rect: &Polygon<f32>, pred_data: ArrayView2<f32>) -> f32 {
    let Some(bounds) = rect.bounding_rect() else {
        return 0.0;
    };
    let (height, width) = pred_data.dim();
    let min = bounds.min();
    let max = bounds.max();
    let (min_x, max_x) = ((min.x as usize).min(width), (max.x as usize).min(width));
    let (min_y, max_y) = ((min.y as usize).min(height), (max.y as usize).min(height));

    let sliced = pred_data.slice(s![min_y..max_y, min_x..max_x]);
    let local_rect = rect.translate(-(min_x as f32), -(min_y as f32));

    let (sum, count) = sliced
        .indexed_iter()
        .filter(|((y, x), _)| local_rect.contains(&point![x: *x as f32, y: *y as f32]))
        .fold((0.0, 0usize), |(sum, count), (_, value)| (sum + *value, count + 1));

    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

pub(crate) fn unclip(rect: Polygon<f32>, unclip_ratio: f32) -> Option<Polygon<f32>> {
    let distance = (rect.unsigned_area() * 0.5 * unclip_ratio) / rect.exterior().euclidean_length();

    let clipped_rect = rect.offset(distance, JoinType::Round(0.25), EndType::ClosedPolygon, 1.0);

    if clipped_rect.is_empty() {
        None
    } else {
        clipped_rect.minimum_rotated_rect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scale {
    pub factor_x: f32,
    pub factor_y: f32,
    pub target_width: u32,
    pub target_height: u32,
}

pub fn scale_normalized(image: &DynamicImage, target_size: u32) -> Scale {
    let aspect_ratio = image.width() as f32 / image.height() as f32;
    let (mut target_width, mut target_height) = if aspect_ratio >= 1.0 {
        let width = image.width().min(target_size);
        let height = (width as f32 / aspect_ratio) as u32;
        (width, height)
    } else {
        let height = image.height().min(target_size);
        let width = (height as f32 * aspect_ratio) as u32;
        (width, height)
    };
    if target_width % 32 != 0 {
        let new_width = (target_width / 32 * 32).max(32);
        log::trace!("Flooring detector width {target_width} to {new_width}.");
        target_width = new_width;
    }
    if target_height % 32 != 0 {
        let new_height = (target_height / 32 * 32).max(32);
        log::trace!("Flooring detector height {target_height} to {new_height}.");
        target_height = new_height;
    }
    Scale {
        target_width,
        target_height,
        factor_x: image.width() as f32 / target_width as f32,
        factor_y: image.height() as f32 / target_height as f32,
    }
}

/// Axis-aligned crop of a detected text line, clamped to the image.
pub(crate) fn part_image(image: &DynamicImage, b_box: &Polygon<f32>) -> Option<DynamicImage> {
    let rect = b_box.bounding_rect()?;
    let x = (rect.min().x.max(0.0) as u32).min(image.width());
    let y = (rect.min().y.max(0.0) as u32).min(image.height());
    let width = (rect.width() as u32).min(image.width() - x);
    let height = (rect.height() as u32).min(image.height() - y);
    if width == 0 || height == 0 {
        return None;
    }
    log::trace!("Slicing text line to {rect:?}");
    Some(image.crop_imm(x, y, width, height))
}

/// Minimum-area rectangle described by its long and short sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RotatedRect {
    pub center_x: f32,
    pub center_y: f32,
    pub long_side: f32,
    pub short_side: f32,
    /// Direction of the long side in image coordinates, degrees.
    pub long_axis_angle: f32,
}

impl RotatedRect {
    pub fn from_polygon(rect: &Polygon<f32>) -> Option<Self> {
        let coords = &rect.exterior().0;
        if coords.len() < 4 {
            return None;
        }
        let (sum_x, sum_y) = coords[..4]
            .iter()
            .fold((0.0, 0.0), |(x, y), c| (x + c.x, y + c.y));
        let edge_a = coords[1] - coords[0];
        let edge_b = coords[2] - coords[1];
        let len_a = edge_a.x.hypot(edge_a.y);
        let len_b = edge_b.x.hypot(edge_b.y);
        let (long_edge, long_side, short_side) = if len_a >= len_b {
            (edge_a, len_a, len_b)
        } else {
            (edge_b, len_b, len_a)
        };
        Some(Self {
            center_x: sum_x / 4.0,
            center_y: sum_y / 4.0,
            long_side,
            short_side,
            long_axis_angle: long_edge.y.atan2(long_edge.x).to_degrees(),
        })
    }

    /// Rotation in degrees, within (-90, 90], that turns the long side vertical.
    pub fn correction_angle(&self) -> f32 {
        let mut angle = 90.0 - self.long_axis_angle;
        while angle > 90.0 {
            angle -= 180.0;
        }
        while angle <= -90.0 {
            angle += 180.0;
        }
        angle
    }

    /// Upright extent of the corrected rectangle, in rotated-image coordinates.
    pub fn upright_extent(&self) -> Rect {
        Rect::new(
            (self.center_x - self.short_side / 2.0).round() as i32,
            (self.center_y - self.long_side / 2.0).round() as i32,
            self.short_side.round() as i32,
            self.long_side.round() as i32,
        )
    }
}

/// Rotates `image` about the rectangle's center so its long side is vertical, then cuts out the
/// rectangle. Equivalent to warping the whole image and cropping, but only the crop is sampled.
pub(crate) fn rotated_crop(image: &RgbImage, rect: &RotatedRect) -> Option<RgbImage> {
    let bounds = Rect::new(0, 0, image.width() as i32, image.height() as i32);
    let crop = rect.upright_extent().intersect(&bounds);
    if crop.is_empty() {
        return None;
    }

    let angle = rect.correction_angle();
    if angle.abs() < 1e-3 {
        return Some(
            image::imageops::crop_imm(
                image,
                crop.x as u32,
                crop.y as u32,
                crop.width as u32,
                crop.height as u32,
            )
            .to_image(),
        );
    }

    let to_source = Isometry2::rotation_wrt_point(
        UnitComplex::new(-angle.to_radians()),
        Point2::new(rect.center_x, rect.center_y),
    );
    let mut out = RgbImage::new(crop.width as u32, crop.height as u32);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let source = to_source.transform_point(&Point2::new(
            (crop.x + x as i32) as f32,
            (crop.y + y as i32) as f32,
        ));
        *pixel = sample_bilinear(image, source.x, source.y);
    }
    Some(out)
}

/// Bilinear sample that replicates edge pixels outside the image.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let max_x = image.width().saturating_sub(1);
    let max_y = image.height().saturating_sub(1);
    let x = x.clamp(0.0, max_x as f32);
    let y = y.clamp(0.0, max_y as f32);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(max_x), (y0 + 1).min(max_y));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;
    Rgb(std::array::from_fn(|ch| {
        let top = p00[ch] as f32 * (1.0 - fx) + p10[ch] as f32 * fx;
        let bottom = p01[ch] as f32 * (1.0 - fx) + p11[ch] as f32 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

pub(crate) fn encode_png(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
