//! Bounded pool of recognition engines and the multi-orientation read.
//!
//! A [`RecognitionEngine`] owns `P` engine instances and a semaphore with `P`
//! permits. Every call holds one permit and one exclusively borrowed instance
//! for its whole duration, so at most `P` recognitions run at once no matter
//! how many pipeline runs share the engine.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use image::DynamicImage;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{recognizer::TextRecognizer, Error, RecognitionResult, Result};

/// Rotations tried for every segment, clockwise degrees.
pub const ORIENTATIONS: [u16; 3] = [0, 90, 270];

/// The recognition stage as seen by the pipeline.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Reads one segment's encoded image. Fails only with [`Error::Cancelled`] or when the stage
    /// itself breaks; engine faults come back as an empty result.
    async fn recognize(
        &self,
        image_data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RecognitionResult>;
}

type Factory<R> = dyn Fn() -> Result<R> + Send + Sync;

/// Idle engines plus the factory that tops them up. Only touched from blocking threads.
struct Pool<R> {
    idle: Mutex<Vec<R>>,
    factory: Box<Factory<R>>,
}

impl<R: TextRecognizer> Pool<R> {
    fn checkout(&self) -> Result<R> {
        let engine = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match engine {
            Some(engine) => Ok(engine),
            None => {
                log::debug!("Recognition pool empty, creating an extra engine");
                (self.factory)()
            }
        }
    }

    fn checkin(&self, engine: R) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(engine);
    }

    /// Borrows an engine for one full read. A panicking engine is dropped, not returned.
    fn read(&self, image_data: &[u8], cancel: &CancellationToken) -> Result<RecognitionResult> {
        let mut engine = match self.checkout() {
            Ok(engine) => engine,
            Err(err) => {
                log::warn!("Unable to create a recognition engine: {err}");
                return Ok(RecognitionResult::default());
            }
        };
        let outcome = read_orientations(&mut engine, image_data, cancel);
        // Returned even after a fault; the next call fully resets the instance's buffers.
        self.checkin(engine);
        outcome
    }
}

pub struct RecognitionEngine<R: TextRecognizer> {
    pool: Arc<Pool<R>>,
    gate: Semaphore,
}

impl<R: TextRecognizer> RecognitionEngine<R> {
    /// Creates `parallelism` engines up front. `factory` is kept to replace instances when the
    /// pool is momentarily empty.
    #[instrument(skip(factory))]
    pub fn new(
        parallelism: usize,
        factory: impl Fn() -> Result<R> + Send + Sync + 'static,
    ) -> Result<Self> {
        let parallelism = parallelism.max(1);
        let engines = (0..parallelism)
            .map(|_| factory())
            .collect::<Result<Vec<_>>>()?;
        log::debug!("Recognition pool ready with {parallelism} engines");
        Ok(Self {
            pool: Arc::new(Pool {
                idle: Mutex::new(engines),
                factory: Box::new(factory),
            }),
            gate: Semaphore::new(parallelism),
        })
    }

    /// Engines currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl<R: TextRecognizer> Recognizer for RecognitionEngine<R> {
    #[instrument(level = "debug", skip_all, fields(bytes = image_data.len()))]
    async fn recognize(
        &self,
        image_data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RecognitionResult> {
        if image_data.is_empty() {
            return Ok(RecognitionResult::default());
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.gate.acquire() => permit
                .map_err(|_| Error::Recognition("recognition gate is closed".into()))?,
        };

        let pool = self.pool.clone();
        let data = image_data.to_vec();
        let token = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || pool.read(&data, &token)).await?;

        match outcome {
            Ok(result) => Ok(result),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                log::warn!("Text recognition failed: {err}");
                Ok(RecognitionResult::default())
            }
        }
    }
}

/// Runs `engine` over the segment at every orientation and keeps the most confident read.
#[instrument(level = "debug", skip_all)]
pub(crate) fn read_orientations<R: TextRecognizer>(
    engine: &mut R,
    image_data: &[u8],
    cancel: &CancellationToken,
) -> Result<RecognitionResult> {
    let image = image::load_from_memory(image_data)?;

    let mut attempts = Vec::with_capacity(ORIENTATIONS.len());
    let mut confidence_sum = 0.0;
    let mut best: Option<(String, f64)> = None;

    for degrees in ORIENTATIONS {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let oriented = rotate(&image, degrees);
        let page = engine.recognize(&oriented)?;
        log::trace!(
            "Orientation {degrees}° read {} chars at {:.3}",
            page.text.len(),
            page.confidence
        );

        confidence_sum += page.confidence;
        let beats_best = best
            .as_ref()
            .map_or(page.confidence > 0.0, |(_, conf)| page.confidence > *conf);
        if beats_best && !page.text.trim().is_empty() {
            best = Some((page.text.clone(), page.confidence));
        }
        attempts.push(page.text);
    }

    Ok(match best {
        Some((text, _)) => RecognitionResult {
            text: text.trim().to_string(),
            confidence: confidence_sum / attempts.len() as f64,
            attempts,
        },
        None => RecognitionResult {
            text: String::new(),
            confidence: 0.0,
            attempts,
        },
    })
}

fn rotate(image: &DynamicImage, degrees: u16) -> DynamicImage {
    match degrees {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread::{self, ThreadId};
    use std::time::Duration;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{util::encode_png, PageText};

    fn png(width: u32, height: u32) -> Vec<u8> {
        encode_png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([200, 200, 200]),
        )))
        .unwrap()
    }

    /// Answers each call from a script, one entry per orientation.
    struct Scripted {
        script: VecDeque<Result<PageText>>,
    }

    impl Scripted {
        fn new(pages: Vec<Result<PageText>>) -> Self {
            Self {
                script: pages.into(),
            }
        }
    }

    fn page(text: &str, confidence: f64) -> Result<PageText> {
        Ok(PageText {
            text: text.into(),
            confidence,
        })
    }

    impl TextRecognizer for Scripted {
        fn recognize(&mut self, _image: &DynamicImage) -> Result<PageText> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Ok(PageText::default()))
        }
    }

    #[test]
    fn keeps_most_confident_non_empty_read() {
        let mut engine = Scripted::new(vec![
            page("D0NE", 0.3),
            page("", 0.9),
            page(" DUNE\nFrank Herbert ", 0.6),
        ]);
        let result =
            read_orientations(&mut engine, &png(20, 80), &CancellationToken::new()).unwrap();

        assert_eq!(result.text, "DUNE\nFrank Herbert");
        assert!((result.confidence - 0.6).abs() < 1e-9);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[1], "");
    }

    #[test]
    fn no_text_means_zero_confidence() {
        let mut engine = Scripted::new(vec![page("", 0.4), page("  ", 0.2), page("", 0.1)]);
        let result =
            read_orientations(&mut engine, &png(10, 10), &CancellationToken::new()).unwrap();

        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.attempts.len(), 3);
    }

    #[test]
    fn stops_between_attempts_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut engine = Scripted::new(vec![page("A", 0.5)]);
        let result = read_orientations(&mut engine, &png(10, 10), &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn engine_fault_becomes_empty_result_and_engine_is_reused() {
        let _ = env_logger::builder().is_test(true).try_init();

        let engine = RecognitionEngine::new(1, || {
            Ok(Scripted::new(vec![Err(Error::Recognition(
                "native fault".into(),
            ))]))
        })
        .unwrap();
        let result = engine
            .recognize(&png(16, 16), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, RecognitionResult::default());
        assert_eq!(engine.idle_count(), 1);
    }

    #[tokio::test]
    async fn undecodable_segment_becomes_empty_result() {
        let engine = RecognitionEngine::new(2, || Ok(Scripted::new(vec![]))).unwrap();
        let result = engine
            .recognize(b"definitely not a png", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(engine.idle_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_wait_for_the_gate() {
        let engine = RecognitionEngine::new(1, || Ok(Scripted::new(vec![]))).unwrap();
        let _held = engine.gate.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        let data = png(8, 8);
        let waiter = engine.recognize(&data, &cancel);
        cancel.cancel();
        assert!(matches!(waiter.await, Err(Error::Cancelled)));
        assert_eq!(engine.idle_count(), 1);
    }

    /// Panics on the first read of any instance, then reads normally.
    struct PanicsOnce {
        panicked: Arc<AtomicBool>,
    }

    impl TextRecognizer for PanicsOnce {
        fn recognize(&mut self, _image: &DynamicImage) -> Result<PageText> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("native engine crashed");
            }
            page("DUNE", 0.7)
        }
    }

    #[tokio::test]
    async fn panicked_engine_is_replaced_off_the_async_thread() {
        let panicked = Arc::new(AtomicBool::new(false));
        let created = Arc::new(AtomicUsize::new(0));
        let created_on = Arc::new(Mutex::new(Vec::<ThreadId>::new()));
        let engine = {
            let (panicked, created, created_on) =
                (panicked.clone(), created.clone(), created_on.clone());
            RecognitionEngine::new(1, move || {
                created.fetch_add(1, Ordering::SeqCst);
                created_on.lock().unwrap().push(thread::current().id());
                Ok(PanicsOnce {
                    panicked: panicked.clone(),
                })
            })
            .unwrap()
        };
        let data = png(12, 40);

        let first = engine.recognize(&data, &CancellationToken::new()).await;
        assert!(matches!(first, Err(Error::Worker(_))));
        assert_eq!(engine.idle_count(), 0);

        let second = engine
            .recognize(&data, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.text, "DUNE");
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(engine.idle_count(), 1);

        let created_on = created_on.lock().unwrap();
        assert_eq!(created_on[0], thread::current().id());
        assert_ne!(created_on[1], thread::current().id());
    }

    struct Slow {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TextRecognizer for Slow {
        fn recognize(&mut self, _image: &DynamicImage) -> Result<PageText> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(PageText {
                text: "TITLE".into(),
                confidence: 0.5,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn gate_bounds_concurrent_calls() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let engine = {
            let (active, peak, created) = (active.clone(), peak.clone(), created.clone());
            Arc::new(
                RecognitionEngine::new(2, move || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Ok(Slow {
                        active: active.clone(),
                        peak: peak.clone(),
                    })
                })
                .unwrap(),
            )
        };

        let data = png(12, 40);
        let calls = (0..8).map(|_| {
            let engine = engine.clone();
            let data = data.clone();
            tokio::spawn(async move {
                engine
                    .recognize(&data, &CancellationToken::new())
                    .await
                    .unwrap()
            })
        });
        for call in calls.collect::<Vec<_>>() {
            let result = call.await.unwrap();
            assert_eq!(result.text, "TITLE");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(engine.idle_count(), 2);
    }
}
