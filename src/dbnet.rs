use std::path::Path;

use geo::{Coord, MinimumRotatedRect, Scale};
use image::{imageops::FilterType, DynamicImage, GrayImage};
use imageproc::{
    contours::find_contours,
    contrast::{threshold_mut, ThresholdType},
    distance_transform::Norm,
    morphology::dilate_mut,
};
use ndarray::{ArrayView2, Axis};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    session::{build_session, SessionOptions, ShapeProfile},
    util::{
        self, box_score_fast, max_side, subtract_mean_normalize, to_geo_poly, to_luma_image, unclip,
    },
    ExecutionProvider, Result, TextBox,
};

const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

const LONG_SIDE_THRESHOLD: f32 = 3.0;
const MAX_CANDIDATES: usize = 1000;

/// Thresholds applied to the detector's probability map.
#[derive(Debug, Clone, Copy)]
pub struct DetectionOptions {
    pub box_score_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            box_score_threshold: 0.5,
            box_threshold: 0.3,
            unclip_ratio: 1.6,
        }
    }
}

/// Differentiable-binarization text detector; finds text lines inside one spine image.
pub struct DbNet {
    session: Session,
    max_side_len: u32,
}

impl DbNet {
    #[instrument(level = "debug", skip(execution_providers))]
    pub fn init(
        path: &Path,
        num_threads: usize,
        max_side_len: u32,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<&Path>,
    ) -> ort::Result<Self> {
        let session = build_session(
            path,
            SessionOptions {
                threads: num_threads,
                execution_providers,
                cache_path: cache_path.map(Path::to_path_buf),
                profile: ShapeProfile {
                    min: "x:1x3x32x32".into(),
                    max: format!("x:1x3x{max_side_len}x{max_side_len}"),
                    opt: format!("x:1x3x{max_side_len}x{max_side_len}"),
                },
            },
        )?;

        Ok(Self {
            session,
            max_side_len,
        })
    }

    #[instrument(skip(self, image), level = "debug")]
    pub fn get_text_boxes(
        &self,
        image: &DynamicImage,
        options: DetectionOptions,
    ) -> Result<Vec<TextBox>> {
        let scale = util::scale_normalized(image, self.max_side_len);
        let image =
            image.resize_exact(scale.target_width, scale.target_height, FilterType::Nearest);
        let input_values =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => input_values]?)?;
        let Some((_, output)) = outputs.first_key_value() else {
            return Ok(Vec::new());
        };
        let pred_mat = output.try_extract_tensor::<f32>()?;

        let width = pred_mat.len_of(Axis(3));
        let height = pred_mat.len_of(Axis(2));

        let pred_data = pred_mat.to_owned().into_shape((height, width))?;
        let Some(mut binary) = to_luma_image(pred_data.view()) else {
            return Ok(Vec::new());
        };

        let threshold = (options.box_threshold * 255.0) as u8;
        threshold_mut(&mut binary, threshold, ThresholdType::Binary);
        dilate_mut(&mut binary, Norm::L1, 2);

        Ok(find_rs_boxes(pred_data.view(), binary, scale, options))
    }
}

#[instrument(skip(pred_data, image), level = "trace")]
fn find_rs_boxes(
    pred_data: ArrayView2<f32>,
    image: GrayImage,
    util::Scale {
        factor_x, factor_y, ..
    }: util::Scale,
    options: DetectionOptions,
) -> Vec<TextBox> {
    find_contours::<i32>(&image)
        .into_iter()
        .take(MAX_CANDIDATES)
        .filter(|it| it.points.len() > 2)
        .filter_map(|it| to_geo_poly(&it.points).minimum_rotated_rect())
        .map(|rect| {
            let side = max_side(&rect);
            (rect, side)
        })
        .filter(|(_, side)| *side >= LONG_SIDE_THRESHOLD)
        .map(|(rect, _)| {
            let score = box_score_fast(&rect, pred_data.view());
            (rect, score)
        })
        .filter(|(_, score)| *score >= options.box_score_threshold)
        .filter_map(|(rect, score)| Some((unclip(rect, options.unclip_ratio)?, score)))
        .filter(|(clip_rect, _)| max_side(clip_rect) >= LONG_SIDE_THRESHOLD + 2.0)
        .map(|(rect, score)| TextBox {
            score,
            rect: rect.scale_around_point(factor_x, factor_y, Coord::zero()),
        })
        .collect()
}
