use std::{sync::Arc, time::Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    genre::{GenreClassifier, KeywordGenreClassifier},
    parsing::BookParser,
    recognition::{Recognizer, ORIENTATIONS},
    segmentation::Segmenter,
    Candidate, Diagnostics, Error, PipelineResult, RecognitionResult, Result, Segment,
};

/// Turns one shelf photo into ordered book candidates.
///
/// Segments are processed one after the other. The recognizer is the only
/// part shared between concurrent runs, so wrap the pipeline in an `Arc` to
/// serve several uploads at once.
pub struct Pipeline<S, R> {
    segmenter: Arc<S>,
    recognizer: R,
    parser: BookParser,
    classifier: Box<dyn GenreClassifier>,
}

impl<S: Segmenter + 'static, R: Recognizer> Pipeline<S, R> {
    pub fn new(segmenter: S, recognizer: R, parser: BookParser) -> Self {
        Self {
            segmenter: Arc::new(segmenter),
            recognizer,
            parser,
            classifier: Box::new(KeywordGenreClassifier),
        }
    }

    pub fn with_classifier(mut self, classifier: impl GenreClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    /// Reads the whole image from `image` and runs it through the pipeline.
    pub async fn process(
        &self,
        mut image: impl AsyncRead + Unpin,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let mut data = Vec::new();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            read = image.read_to_end(&mut data) => read?,
        };
        self.process_bytes(data, cancel).await
    }

    /// Fails only when segmentation rejects the image or the run is cancelled. Segments that
    /// fail later are left out of the candidates and described in the diagnostics notes.
    #[instrument(skip_all, fields(bytes = image_data.len(), run_id = tracing::field::Empty))]
    pub async fn process_bytes(
        &self,
        image_data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        Span::current().record("run_id", tracing::field::display(run_id));

        let segments = {
            let segmenter = self.segmenter.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || segmenter.segment(&image_data, &cancel))
                .await??
        };
        log::info!(
            "Segmentation produced {} segments for image {run_id}",
            segments.len()
        );

        let mut diagnostics = DiagnosticsBuilder::new(segments.len());
        let mut candidates = Vec::with_capacity(segments.len());
        // Each crop is dropped once its segment is done.
        for (index, segment) in segments.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.process_segment(&segment, cancel).await {
                Ok(candidate) => candidates.push(candidate),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    log::error!("Failed to process segment {index} for image {run_id}: {err}");
                    diagnostics.add_note(format!("Segment {index}: {err}"));
                }
            }
        }

        diagnostics.set_elapsed(start.elapsed().as_millis() as u64);
        let diagnostics = diagnostics.build();
        log::debug!(
            "Run {run_id} finished with {} candidates in {}ms",
            candidates.len(),
            diagnostics.elapsed_ms
        );
        Ok(PipelineResult {
            run_id,
            candidates,
            diagnostics,
        })
    }

    async fn process_segment(
        &self,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<Candidate> {
        let recognition = self.recognizer.recognize(&segment.image_data, cancel).await?;
        let mut candidate = self.parser.parse(segment.bounding_box, &recognition);
        candidate.genres = self
            .classifier
            .classify(&candidate.title, &candidate.raw_text)
            .into_iter()
            .map(String::from)
            .collect();
        if let Some(note) = rotation_note(&recognition) {
            candidate.notes.push(note);
        }
        Ok(candidate)
    }
}

fn rotation_note(recognition: &RecognitionResult) -> Option<String> {
    if recognition.attempts.len() <= 1 {
        return None;
    }
    let labels = (0..recognition.attempts.len())
        .map(|index| match ORIENTATIONS.get(index) {
            Some(degrees) => format!("{degrees}°"),
            None => "other".to_string(),
        })
        .collect::<Vec<_>>();
    Some(format!("OCR tried rotations: {}", labels.join(", ")))
}

/// Segment count is fixed up front so later failures can't change it.
struct DiagnosticsBuilder {
    segment_count: usize,
    elapsed_ms: u64,
    notes: Vec<String>,
}

impl DiagnosticsBuilder {
    fn new(segment_count: usize) -> Self {
        Self {
            segment_count,
            elapsed_ms: 0,
            notes: Vec::new(),
        }
    }

    fn add_note(&mut self, note: String) {
        self.notes.push(note);
    }

    fn set_elapsed(&mut self, elapsed_ms: u64) {
        self.elapsed_ms = elapsed_ms;
    }

    fn build(self) -> Diagnostics {
        Diagnostics {
            segment_count: self.segment_count,
            elapsed_ms: self.elapsed_ms,
            notes: self.notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{config::ParsingOptions, Rect};

    /// Hands out `count` fake segments, or a fixed error.
    struct FixedSegmenter {
        count: usize,
        fail: bool,
    }

    impl Segmenter for FixedSegmenter {
        fn segment(&self, _image_data: &[u8], _cancel: &CancellationToken) -> Result<Vec<Segment>> {
            if self.fail {
                return Err(Error::ImageTooLarge {
                    pixels: 100,
                    limit: 10,
                });
            }
            Ok((0..self.count)
                .map(|i| Segment {
                    bounding_box: Rect::new(i as i32 * 50, 0, 40, 300),
                    image_data: vec![i as u8],
                })
                .collect())
        }
    }

    /// Reads the segment's first byte as its index and answers from `texts`.
    /// Indices listed in `failing` produce an error.
    struct IndexedRecognizer {
        texts: Vec<&'static str>,
        failing: Vec<usize>,
        calls: AtomicUsize,
        cancel_after: Option<usize>,
    }

    impl IndexedRecognizer {
        fn new(texts: Vec<&'static str>) -> Self {
            Self {
                texts,
                failing: Vec::new(),
                calls: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl Recognizer for IndexedRecognizer {
        async fn recognize(
            &self,
            image_data: &[u8],
            cancel: &CancellationToken,
        ) -> Result<RecognitionResult> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.cancel_after == Some(calls) {
                cancel.cancel();
            }
            let index = image_data[0] as usize;
            if self.failing.contains(&index) {
                return Err(Error::Recognition("boom".into()));
            }
            let text = self.texts[index];
            Ok(RecognitionResult {
                text: text.into(),
                confidence: 0.7,
                attempts: vec![text.into(), String::new(), String::new()],
            })
        }
    }

    fn pipeline(
        count: usize,
        recognizer: IndexedRecognizer,
    ) -> Pipeline<FixedSegmenter, IndexedRecognizer> {
        Pipeline::new(
            FixedSegmenter { count, fail: false },
            recognizer,
            BookParser::new(ParsingOptions::default()),
        )
    }

    #[tokio::test]
    async fn failing_segment_is_isolated() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut recognizer = IndexedRecognizer::new(vec![
            "DUNE\nby Frank Herbert",
            "IGNORED",
            "THE HOBBIT\nby J. R. R. Tolkien",
        ]);
        recognizer.failing = vec![1];

        let result = pipeline(3, recognizer)
            .process(&b"image"[..], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.diagnostics.segment_count, 3);
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(result.candidates[0].title, "Dune");
        assert_eq!(result.candidates[1].title, "The Hobbit");
        assert_eq!(result.candidates[1].bounding_box.x, 100);
        assert_eq!(result.diagnostics.notes.len(), 1);
        assert!(result.diagnostics.notes[0].starts_with("Segment 1:"));
        assert!(result.diagnostics.notes[0].contains("boom"));
    }

    #[tokio::test]
    async fn candidates_carry_genres_and_rotation_notes() {
        let result = pipeline(1, IndexedRecognizer::new(vec!["THE DRAGON WIZARD\nby Someone"]))
            .process(&b"image"[..], &CancellationToken::new())
            .await
            .unwrap();

        let candidate = &result.candidates[0];
        assert_eq!(candidate.genres, vec!["Fantasy".to_string()]);
        assert!(candidate
            .notes
            .contains(&"OCR tried rotations: 0°, 90°, 270°".to_string()));
        assert!((0.0..=0.99).contains(&candidate.confidence));
    }

    #[tokio::test]
    async fn every_segment_failing_still_reports_count() {
        let mut recognizer = IndexedRecognizer::new(vec!["A", "B"]);
        recognizer.failing = vec![0, 1];

        let result = pipeline(2, recognizer)
            .process(&b"image"[..], &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.candidates.is_empty());
        assert_eq!(result.diagnostics.segment_count, 2);
        assert_eq!(result.diagnostics.notes.len(), 2);
    }

    #[tokio::test]
    async fn segmentation_failure_is_fatal() {
        let pipeline = Pipeline::new(
            FixedSegmenter {
                count: 0,
                fail: true,
            },
            IndexedRecognizer::new(vec![]),
            BookParser::default(),
        );
        let result = pipeline
            .process(&b"image"[..], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ImageTooLarge { .. })));
    }

    #[tokio::test]
    async fn cancellation_between_segments_discards_partial_results() {
        let mut recognizer = IndexedRecognizer::new(vec!["A", "B", "C"]);
        recognizer.cancel_after = Some(1);
        let pipeline = pipeline(3, recognizer);

        let result = pipeline
            .process(&b"image"[..], &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(pipeline.recognizer().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_segments_means_empty_result() {
        let result = pipeline(0, IndexedRecognizer::new(vec![]))
            .process(&b""[..], &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.candidates.is_empty());
        assert_eq!(result.diagnostics.segment_count, 0);
        assert!(result.diagnostics.notes.is_empty());
    }

    #[test]
    fn single_attempt_gets_no_rotation_note() {
        let recognition = RecognitionResult {
            text: "A".into(),
            confidence: 0.5,
            attempts: vec!["A".into()],
        };
        assert_eq!(rotation_note(&recognition), None);
    }
}
