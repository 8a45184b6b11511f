use std::path::Path;

use float_ord::FloatOrd;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{ArrayView2, Axis};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    session::{build_session, SessionOptions, ShapeProfile},
    util::subtract_mean_normalize,
    Error, ExecutionProvider, Result, TextLine,
};

const MEAN_VALUES: [f32; 3] = [0.5, 0.5, 0.5];
const NORM_VALUES: [f32; 3] = [2.0, 2.0, 2.0];
const DEST_HEIGHT: u32 = 48;

/// CTC line recognizer: one horizontal text line in, characters with per-character scores out.
pub struct CrnnNet {
    session: Session,
    keys: Vec<String>,
}

impl CrnnNet {
    #[instrument(level = "debug", skip(execution_providers))]
    pub fn init(
        model_path: &Path,
        keys_path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<&Path>,
    ) -> Result<Self> {
        let session = build_session(
            model_path,
            SessionOptions {
                threads: num_threads,
                execution_providers,
                cache_path: cache_path.map(Path::to_path_buf),
                profile: ShapeProfile {
                    min: format!("x:1x3x{DEST_HEIGHT}x1"),
                    max: format!("x:1x3x{DEST_HEIGHT}x{}", u16::MAX),
                    opt: format!("x:1x3x{DEST_HEIGHT}x256"),
                },
            },
        )?;

        let keys = std::fs::read_to_string(keys_path).map_err(|source| Error::Model {
            path: keys_path.to_path_buf(),
            source,
        })?;
        // Index 0 is the CTC blank; the trailing space matches the exported models' last class.
        let keys = ["#".to_string()]
            .into_iter()
            .chain(keys.lines().map(|line| line.to_string()))
            .chain([" ".to_string()])
            .collect::<Vec<_>>();

        log::debug!("CRNN inputs: {:?}", session.inputs);
        log::debug!("CRNN outputs: {:?}", session.outputs);

        Ok(Self { session, keys })
    }

    #[instrument(level = "trace", skip(self, image))]
    pub fn get_text_line(&self, image: &DynamicImage) -> Result<TextLine> {
        let scale = DEST_HEIGHT as f32 / image.height() as f32;
        let dest_width = ((image.width() as f32 * scale) as u32).clamp(1, u16::MAX as u32);
        let image = image.resize_exact(dest_width, DEST_HEIGHT, FilterType::Nearest);

        let tensor_values =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self.session.run(inputs!["x" => tensor_values]?)?;
        let Some((_, output)) = outputs.first_key_value() else {
            return Ok(TextLine {
                text: String::new(),
                character_scores: Vec::new(),
            });
        };
        let output_tensor = output.try_extract_tensor::<f32>()?;

        log::trace!("Output tensor size: {:?}", output_tensor.dim());
        let steps = output_tensor.len_of(Axis(1));
        let classes = output_tensor.len_of(Axis(2));
        let output = output_tensor.to_owned().into_shape((steps, classes))?;

        Ok(self.score_to_text_line(output.view()))
    }

    /// Greedy CTC decoding: best class per step, blanks and repeats collapsed.
    fn score_to_text_line(&self, data: ArrayView2<f32>) -> TextLine {
        let keys_size = self.keys.len();
        let mut previous = None;
        let mut text = String::new();
        let mut character_scores = Vec::new();

        for step in data.outer_iter() {
            let Some((index, score)) = step
                .indexed_iter()
                .max_by_key(|(_, value)| FloatOrd(**value))
                .map(|(i, value)| (i, *value))
            else {
                continue;
            };
            if index > 0 && index < keys_size && previous != Some(index) {
                text.push_str(&self.keys[index]);
                character_scores.push(score);
            }
            previous = Some(index);
        }

        TextLine {
            text,
            character_scores,
        }
    }
}
