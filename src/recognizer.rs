use std::path::PathBuf;

use float_ord::FloatOrd;
use geo::{BoundingRect, Coord};
use image::DynamicImage;
use tracing::instrument;

use crate::{
    config::RecognitionOptions,
    crnn_net::CrnnNet,
    dbnet::{DbNet, DetectionOptions},
    session::DEFAULT_PROVIDERS,
    util::part_image,
    ExecutionProvider, PageText, Result,
};

/// A stateful text-recognition engine instance.
///
/// An instance is only ever used by one call at a time; the pool in
/// [`RecognitionEngine`](crate::RecognitionEngine) hands out exclusive access.
pub trait TextRecognizer: Send + 'static {
    /// Reads all text in `image`, lines separated by `\n`, with a mean confidence in [0, 1].
    fn recognize(&mut self, image: &DynamicImage) -> Result<PageText>;
}

/// Detector + line recognizer pair backed by ONNX runtime sessions.
pub struct OnnxRecognizer {
    det_model: DbNet,
    rec_model: CrnnNet,
    detection: DetectionOptions,
}

impl TextRecognizer for OnnxRecognizer {
    #[instrument(level = "debug", skip_all)]
    fn recognize(&mut self, image: &DynamicImage) -> Result<PageText> {
        let mut boxes = self.det_model.get_text_boxes(image, self.detection)?;
        // Reading order: top to bottom, then left to right.
        boxes.sort_by_key(|it| {
            let origin = it
                .rect
                .bounding_rect()
                .map(|rect| rect.min())
                .unwrap_or(Coord::zero());
            (FloatOrd(origin.y), FloatOrd(origin.x))
        });

        let mut lines = Vec::with_capacity(boxes.len());
        let mut scores = Vec::new();
        for text_box in &boxes {
            let Some(line_image) = part_image(image, &text_box.rect) else {
                continue;
            };
            let line = self.rec_model.get_text_line(&line_image)?;
            if line.text.trim().is_empty() {
                continue;
            }
            scores.extend(line.character_scores);
            lines.push(line.text);
        }

        let confidence = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|it| *it as f64).sum::<f64>() / scores.len() as f64
        };
        Ok(PageText {
            text: lines.join("\n"),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OnnxRecognizerBuilder {
    threads: usize,
    det_path: PathBuf,
    rec_paths: (PathBuf, PathBuf),
    max_side_len: u32,
    detection: DetectionOptions,
    cache_path: Option<PathBuf>,
    execution_providers: Vec<ExecutionProvider>,
}

impl OnnxRecognizerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(options: &RecognitionOptions) -> Self {
        let mut builder = Self::new()
            .threads(options.threads)
            .det_model(&options.det_model)
            .rec_model(&options.rec_model, &options.rec_keys)
            .max_side_len(options.max_side_len);
        builder.cache_path = options.engine_cache_path.clone();
        builder
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.det_path = path.into();
        self
    }

    pub fn rec_model(
        mut self,
        model_path: impl Into<PathBuf>,
        keys_path: impl Into<PathBuf>,
    ) -> Self {
        self.rec_paths = (model_path.into(), keys_path.into());
        self
    }

    pub fn max_side_len(mut self, max_side_len: u32) -> Self {
        self.max_side_len = max_side_len;
        self
    }

    pub fn detection_options(mut self, options: DetectionOptions) -> Self {
        self.detection = options;
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    /// Loads a fresh engine instance. Called once per pool slot, and again whenever the pool
    /// runs dry, so the builder stays cheap to clone.
    #[instrument(skip(self))]
    pub fn build(&self) -> Result<OnnxRecognizer> {
        let (rec_path, keys_path) = &self.rec_paths;
        Ok(OnnxRecognizer {
            det_model: DbNet::init(
                &self.det_path,
                self.threads,
                self.max_side_len,
                &self.execution_providers,
                self.cache_path.as_deref(),
            )?,
            rec_model: CrnnNet::init(
                rec_path,
                keys_path,
                self.threads,
                &self.execution_providers,
                self.cache_path.as_deref(),
            )?,
            detection: self.detection,
        })
    }
}

impl Default for OnnxRecognizerBuilder {
    fn default() -> Self {
        let options = RecognitionOptions::default();
        Self {
            threads: options.threads,
            det_path: options.det_model,
            rec_paths: (options.rec_model, options.rec_keys),
            max_side_len: options.max_side_len,
            detection: DetectionOptions::default(),
            cache_path: None,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}
