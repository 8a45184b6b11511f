use std::path::PathBuf;

use tracing::instrument;

pub mod config;
mod crnn_net;
pub mod dbnet;
mod error;
pub mod fuzzy;
pub mod genre;
pub mod lookup;
pub mod parsing;
pub mod pipeline;
pub mod recognition;
mod recognizer;
mod result;
pub mod segmentation;
mod session;
mod util;

pub use config::{Config, ConfigError, ParsingOptions, RecognitionOptions, SegmentationOptions};
pub use dbnet::DetectionOptions;
pub use error::{Error, Result};
pub use genre::{GenreClassifier, KeywordGenreClassifier};
pub use lookup::{BookMetadata, CatalogLookup, LookupError};
pub use parsing::BookParser;
pub use pipeline::Pipeline;
pub use recognition::{RecognitionEngine, Recognizer};
pub use recognizer::{OnnxRecognizer, OnnxRecognizerBuilder, TextRecognizer};
pub use result::*;
pub use segmentation::{Segmenter, SpineSegmenter};
pub use session::ExecutionProvider;

pub use ort as runtime;

/// The production pipeline: contour segmentation plus a pool of ONNX engines.
pub type BookshelfReader = Pipeline<SpineSegmenter, RecognitionEngine<OnnxRecognizer>>;

pub struct BookshelfReaderBuilder {
    config: Config,
    engine: OnnxRecognizerBuilder,
}

impl BookshelfReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: Config) -> Self {
        let engine = OnnxRecognizerBuilder::from_options(&config.recognition);
        Self { config, engine }
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.config.recognition.threads = threads;
        self.engine = self.engine.threads(threads);
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.config.recognition.det_model = path.clone();
        self.engine = self.engine.det_model(path);
        self
    }

    pub fn rec_model(
        mut self,
        model_path: impl Into<PathBuf>,
        keys_path: impl Into<PathBuf>,
    ) -> Self {
        let (model_path, keys_path) = (model_path.into(), keys_path.into());
        self.config.recognition.rec_model = model_path.clone();
        self.config.recognition.rec_keys = keys_path.clone();
        self.engine = self.engine.rec_model(model_path, keys_path);
        self
    }

    pub fn max_side_len(mut self, max_side_len: u32) -> Self {
        self.config.recognition.max_side_len = max_side_len;
        self.engine = self.engine.max_side_len(max_side_len);
        self
    }

    /// Number of pooled engines, which is also the bound on concurrent recognition calls.
    pub fn max_parallelism(mut self, parallelism: usize) -> Self {
        self.config.recognition.max_parallelism = parallelism;
        self
    }

    pub fn detection_options(mut self, options: DetectionOptions) -> Self {
        self.engine = self.engine.detection_options(options);
        self
    }

    pub fn segmentation(mut self, options: SegmentationOptions) -> Self {
        self.config.segmentation = options;
        self
    }

    pub fn parsing(mut self, options: ParsingOptions) -> Self {
        self.config.parsing = options;
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.config.recognition.engine_cache_path = Some(path.clone());
        self.engine = self.engine.with_engine_cache_path(path);
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.engine = self.engine.with_execution_providers(providers);
        self
    }

    /// Validates the configuration and loads `max_parallelism` engine instances.
    #[instrument(skip(self))]
    pub fn build(self) -> Result<BookshelfReader> {
        let Self { config, engine } = self;
        config.validate()?;
        let recognizer = RecognitionEngine::new(config.recognition.max_parallelism, move || {
            engine.build()
        })?;
        Ok(Pipeline::new(
            SpineSegmenter::new(config.segmentation),
            recognizer,
            BookParser::new(config.parsing),
        ))
    }
}

impl Default for BookshelfReaderBuilder {
    fn default() -> Self {
        Self::from_config(Config::default())
    }
}
