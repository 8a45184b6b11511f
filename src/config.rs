//! Runtime options for the three pipeline stages.
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it wants to change:
//!
//! ```json
//! { "segmentation": { "max_segments": 16 }, "parsing": { "base_confidence": 0.3 } }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than 0")]
    NotPositive { field: &'static str },

    #[error("{min_field} ({min}) must not exceed {max_field} ({max})")]
    InvertedRange {
        min_field: &'static str,
        max_field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{field} must be within [{low}, {high}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("author tokens must not contain blank entries")]
    BlankAuthorToken,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub segmentation: SegmentationOptions,
    pub recognition: RecognitionOptions,
    pub parsing: ParsingOptions,
}

impl Config {
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.segmentation.validate()?;
        self.recognition.validate()?;
        self.parsing.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentationOptions {
    /// Bounding-box width / height.
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Bounding-box area as a fraction of the whole image.
    pub min_area_fraction: f64,
    pub max_area_fraction: f64,
    pub max_segments: usize,
    pub max_image_pixels: u64,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 10.0,
            min_area_fraction: 0.0025,
            max_area_fraction: 0.9,
            max_segments: 64,
            max_image_pixels: 25_000_000,
        }
    }
}

impl SegmentationOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_aspect_ratio <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "min_aspect_ratio",
            });
        }
        if self.min_aspect_ratio > self.max_aspect_ratio {
            return Err(ConfigError::InvertedRange {
                min_field: "min_aspect_ratio",
                max_field: "max_aspect_ratio",
                min: self.min_aspect_ratio,
                max: self.max_aspect_ratio,
            });
        }
        if self.min_area_fraction <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "min_area_fraction",
            });
        }
        if self.max_area_fraction > 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "max_area_fraction",
                value: self.max_area_fraction,
                low: 0.0,
                high: 1.0,
            });
        }
        if self.min_area_fraction > self.max_area_fraction {
            return Err(ConfigError::InvertedRange {
                min_field: "min_area_fraction",
                max_field: "max_area_fraction",
                min: self.min_area_fraction,
                max: self.max_area_fraction,
            });
        }
        if self.max_segments == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_segments",
            });
        }
        if self.max_image_pixels == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_image_pixels",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionOptions {
    pub det_model: PathBuf,
    pub rec_model: PathBuf,
    pub rec_keys: PathBuf,
    /// ONNX runtime threads per engine instance.
    pub threads: usize,
    pub max_side_len: u32,
    /// Engine instances in the pool, and the system-wide bound on concurrent recognition calls.
    pub max_parallelism: usize,
    pub engine_cache_path: Option<PathBuf>,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            det_model: "models/ch_PP-OCRv4_det_infer/ch_PP-OCRv4_det_infer.onnx".into(),
            rec_model: "models/ch_PP-OCRv4_rec_infer/ch_PP-OCRv4_rec_infer.onnx".into(),
            rec_keys: "models/ppocr_keys_v1.txt".into(),
            threads: 4,
            max_side_len: 1024,
            max_parallelism: std::thread::available_parallelism()
                .map(|it| it.get())
                .unwrap_or(1),
            engine_cache_path: None,
        }
    }
}

impl RecognitionOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NotPositive { field: "threads" });
        }
        if self.max_parallelism == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_parallelism",
            });
        }
        if self.max_side_len == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_side_len",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParsingOptions {
    pub base_confidence: f64,
    /// Matched case-insensitively, in order; the text after the first match is the author.
    pub author_tokens: Vec<String>,
    /// Score out of 100 above which a runner-up line is reported as an alternative title.
    pub alternative_title_threshold: f64,
}

impl Default for ParsingOptions {
    fn default() -> Self {
        Self {
            base_confidence: 0.35,
            author_tokens: vec!["by".into(), "author".into(), "edited by".into()],
            alternative_title_threshold: 90.0,
        }
    }
}

impl ParsingOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.base_confidence) {
            return Err(ConfigError::OutOfRange {
                field: "base_confidence",
                value: self.base_confidence,
                low: 0.0,
                high: 1.0,
            });
        }
        if !(0.0..=100.0).contains(&self.alternative_title_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "alternative_title_threshold",
                value: self.alternative_title_threshold,
                low: 0.0,
                high: 100.0,
            });
        }
        if self.author_tokens.iter().any(|it| it.trim().is_empty()) {
            return Err(ConfigError::BlankAuthorToken);
        }
        Ok(())
    }
}
