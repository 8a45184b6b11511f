use std::cmp::Reverse;
use std::collections::HashSet;

use tracing::instrument;

use crate::{config::ParsingOptions, fuzzy, Candidate, RecognitionResult, Rect};

pub const NO_TEXT_NOTE: &str = "OCR returned no text";
pub const UNPARSABLE_NOTE: &str = "Unable to parse OCR lines";
pub const ALTERNATIVE_TITLE_PREFIX: &str = "Alternative title candidate:";

const MAX_CONFIDENCE: f64 = 0.99;
const TITLE_LENGTH_BONUS_CAP: f64 = 0.4;
const AUTHOR_BONUS: f64 = 0.2;
const MAX_BYLINE_WORDS: usize = 4;
const MAX_BYLINE_WORD_LEN: usize = 12;
const ALTERNATIVE_POOL: usize = 3;

/// Turns recognized spine text into a title/author guess with a confidence score.
#[derive(Debug, Clone, Default)]
pub struct BookParser {
    options: ParsingOptions,
}

impl BookParser {
    pub fn new(options: ParsingOptions) -> Self {
        Self { options }
    }

    #[instrument(level = "debug", skip(self, recognition))]
    pub fn parse(&self, bounding_box: Rect, recognition: &RecognitionResult) -> Candidate {
        let mut candidate = Candidate {
            bounding_box,
            raw_text: recognition.text.clone(),
            ..Default::default()
        };

        if recognition.text.trim().is_empty() {
            log::debug!("OCR returned empty text for bounding box {bounding_box:?}");
            candidate.notes.push(NO_TEXT_NOTE.into());
            return candidate;
        }

        let lines = normalize_lines(&recognition.text);
        if lines.is_empty() {
            log::debug!("OCR produced no parsable lines for bounding box {bounding_box:?}");
            candidate.notes.push(UNPARSABLE_NOTE.into());
            return candidate;
        }

        let byline = self.find_byline(&lines);
        let title_index = longest_line(&lines, byline.as_ref().map(|(index, _)| *index));
        let probable_title = &lines[title_index];
        let author = match byline {
            Some((_, author)) => Some(author),
            None => shortest_byline(&lines).map(str::to_string),
        };

        candidate.title = to_title_case(probable_title);
        candidate.author = author.as_deref().map(to_title_case).unwrap_or_default();
        candidate.confidence =
            self.confidence(&candidate.title, &candidate.author, recognition.confidence);

        if let Some(alternative) = self.alternative_title(probable_title, &lines) {
            candidate
                .notes
                .push(format!("{ALTERNATIVE_TITLE_PREFIX} {alternative}"));
        }

        candidate
    }

    /// First line containing an author token with something after it, as (line index, author).
    fn find_byline(&self, lines: &[String]) -> Option<(usize, String)> {
        lines.iter().enumerate().find_map(|(index, line)| {
            let end = self
                .options
                .author_tokens
                .iter()
                .find_map(|token| find_ignore_case(line, token))?;
            let author = line[end..].trim();
            (!author.is_empty()).then(|| (index, author.to_string()))
        })
    }

    fn confidence(&self, title: &str, author: &str, recognition_confidence: f64) -> f64 {
        let mut confidence = self.options.base_confidence;
        if !title.is_empty() {
            confidence += TITLE_LENGTH_BONUS_CAP.min(title.chars().count() as f64 / 50.0);
        }
        if !author.is_empty() {
            confidence += AUTHOR_BONUS;
        }
        if recognition_confidence > 0.0 {
            confidence = (confidence + recognition_confidence) / 2.0;
        }
        confidence.clamp(0.0, MAX_CONFIDENCE)
    }

    /// OCR sometimes reads the same spine text twice with small differences.
    fn alternative_title<'a>(&self, title: &str, lines: &'a [String]) -> Option<&'a str> {
        if lines.len() <= 1 {
            return None;
        }
        let top = fuzzy::extract_top(title, lines, ALTERNATIVE_POOL);
        let (runner_up, score) = *top.get(1)?;
        (score > self.options.alternative_title_threshold && runner_up != title)
            .then_some(runner_up)
    }
}

fn is_permitted(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '\'' | '&' | ',' | ':' | ';' | '-' | '.' | ' ')
}

/// Splits into lines, blanks out unexpected characters, and drops empty or repeated lines.
fn normalize_lines(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(['\r', '\n'])
        .map(|line| {
            line.chars()
                .map(|c| if is_permitted(c) { c } else { ' ' })
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|line| line.chars().any(char::is_alphanumeric))
        .filter(|line| seen.insert(line.clone()))
        .collect()
}

/// Longest line, first one on ties. `skip` is ignored when it is the only line.
fn longest_line(lines: &[String], skip: Option<usize>) -> usize {
    let pick = |skip: Option<usize>| {
        lines
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != skip)
            .min_by_key(|(_, line)| Reverse(line.chars().count()))
            .map(|(index, _)| index)
    };
    pick(skip).or_else(|| pick(None)).unwrap_or(0)
}

/// Shortest short, byline-looking line. This can be the title line itself.
fn shortest_byline(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .map(String::as_str)
        .filter(|line| {
            let words = line.split_whitespace().collect::<Vec<_>>();
            line.chars().any(char::is_alphabetic)
                && words.len() <= MAX_BYLINE_WORDS
                && words
                    .iter()
                    .all(|word| word.chars().count() <= MAX_BYLINE_WORD_LEN)
        })
        .min_by_key(|line| line.chars().count())
}

/// Byte offset just past the first case-insensitive occurrence of `needle`.
fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.char_indices().find_map(|(start, _)| {
        let mut rest = haystack[start..].char_indices();
        for expected in needle.chars() {
            let (_, actual) = rest.next()?;
            if !actual.to_lowercase().eq(expected.to_lowercase()) {
                return None;
            }
        }
        Some(rest.next().map_or(haystack.len(), |(offset, _)| start + offset))
    })
}

/// Lower-cases everything, then upper-cases the first letter of each whitespace-separated word.
/// Scripts without case pass through unchanged.
pub fn to_title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut word_start = true;
    for c in value.trim().chars() {
        if c.is_whitespace() {
            word_start = true;
            out.push(c);
        } else if word_start {
            word_start = false;
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str, confidence: f64) -> Candidate {
        BookParser::default().parse(
            Rect::new(0, 0, 10, 10),
            &RecognitionResult {
                text: text.into(),
                confidence,
                attempts: vec![text.into()],
            },
        )
    }

    #[test]
    fn empty_text_gets_zero_confidence_and_single_note() {
        let candidate = parse("", 0.9);
        assert_eq!(candidate.confidence, 0.0);
        assert_eq!(candidate.notes, vec![NO_TEXT_NOTE.to_string()]);
        assert!(candidate.title.is_empty());
        assert!(candidate.author.is_empty());
        assert_eq!(candidate.bounding_box, Rect::new(0, 0, 10, 10));

        assert_eq!(parse("  \n\t ", 0.9).notes, vec![NO_TEXT_NOTE.to_string()]);
    }

    #[test]
    fn symbol_noise_is_unparsable() {
        let candidate = parse("!!! @@@ ###", 0.6);
        assert_eq!(candidate.confidence, 0.0);
        assert_eq!(candidate.notes, vec![UNPARSABLE_NOTE.to_string()]);
        assert!(candidate.title.is_empty());
        assert!(candidate.author.is_empty());
        assert_eq!(candidate.raw_text, "!!! @@@ ###");
    }

    #[test]
    fn extracts_author_after_token() {
        let candidate = parse("THE GREAT GATSBY\nby F. Scott Fitzgerald", 0.85);
        assert_eq!(candidate.title, "The Great Gatsby");
        assert_eq!(candidate.author, "F. Scott Fitzgerald");
        assert!(candidate.notes.is_empty());
    }

    #[test]
    fn preserves_accented_letters() {
        let candidate = parse("CIEN AÑOS DE SOLEDAD\nby GABRIEL GARCÍA MÁRQUEZ", 0.8);
        assert_eq!(candidate.title, "Cien Años De Soledad");
        assert_eq!(candidate.author, "Gabriel García Márquez");
    }

    #[test]
    fn preserves_uncased_scripts() {
        let candidate = parse("百年孤独", 0.5);
        assert_eq!(candidate.title, "百年孤独");
        // A lone short line also satisfies the byline fallback.
        assert_eq!(candidate.author, "百年孤独");
    }

    #[test]
    fn strips_punctuation_but_keeps_letters() {
        let candidate = parse("LES MISÉRABLES!!!\nBY VICTOR HUGO", 0.75);
        assert_eq!(candidate.title, "Les Misérables");
        assert_eq!(candidate.author, "Victor Hugo");
    }

    #[test]
    fn confidence_blends_length_author_and_recognition() {
        let parser = BookParser::new(ParsingOptions {
            base_confidence: 0.3,
            ..Default::default()
        });
        let candidate = parser.parse(
            Rect::default(),
            &RecognitionResult {
                text: "A VERY LONG AND DESCRIPTIVE TITLE FOR TESTING\nBY FRANK HERBERT".into(),
                confidence: 0.8,
                attempts: Vec::new(),
            },
        );
        assert!((candidate.confidence - 0.85).abs() < 1e-4);
        assert_eq!(candidate.author, "Frank Herbert");
    }

    #[test]
    fn confidence_never_reaches_one() {
        let parser = BookParser::new(ParsingOptions {
            base_confidence: 1.0,
            ..Default::default()
        });
        let candidate = parser.parse(
            Rect::default(),
            &RecognitionResult {
                text: "AN EXTREMELY LONG TITLE THAT KEEPS GOING AND GOING ON\nby Someone".into(),
                confidence: 1.0,
                attempts: Vec::new(),
            },
        );
        assert_eq!(candidate.confidence, 0.99);
    }

    #[test]
    fn zero_recognition_confidence_is_not_averaged_in() {
        let candidate = parse("DUNE", 0.0);
        // 0.35 base + 4/50 for the title + 0.2 for the fallback author.
        assert_eq!(candidate.title, "Dune");
        assert_eq!(candidate.author, "Dune");
        assert!((candidate.confidence - 0.63).abs() < 1e-9);
    }

    #[test]
    fn long_single_line_has_no_author() {
        let candidate = parse("A VERY LONG AND DESCRIPTIVE SPINE TITLE", 0.0);
        assert_eq!(candidate.title, "A Very Long And Descriptive Spine Title");
        assert!(candidate.author.is_empty());
    }

    #[test]
    fn flags_reordered_duplicate_title() {
        let candidate = parse("The Lord Of The Rings\nLord of the Rings\nby J R R Tolkien", 0.6);
        assert_eq!(candidate.title, "The Lord Of The Rings");
        assert_eq!(candidate.author, "J R R Tolkien");
        assert_eq!(
            candidate.notes,
            vec![format!("{ALTERNATIVE_TITLE_PREFIX} Lord of the Rings")]
        );
    }

    #[test]
    fn flags_near_duplicate_title_lines() {
        let candidate = parse(
            "Harry Potter and the Philosopher's Stone\nHarry Potter & the Philosopher's Stone\nby J.K. Rowling",
            0.7,
        );
        assert_eq!(candidate.title, "Harry Potter And The Philosopher's Stone");
        assert_eq!(candidate.author, "J.k. Rowling");
        assert!(candidate
            .notes
            .iter()
            .any(|it| it.starts_with(ALTERNATIVE_TITLE_PREFIX)));
    }

    #[test]
    fn falls_back_to_short_byline() {
        let candidate = parse("THE LORD OF THE RINGS\nJ. R. R. TOLKIEN\nTOLKIEN", 0.0);
        assert_eq!(candidate.title, "The Lord Of The Rings");
        assert_eq!(candidate.author, "Tolkien");
    }

    #[test]
    fn drops_duplicate_lines_case_sensitively() {
        assert_eq!(
            normalize_lines("Dune\nDune\nDUNE\n\n  --  \n"),
            vec!["Dune".to_string(), "DUNE".to_string()]
        );
    }

    #[test]
    fn title_case_handles_cases_and_spacing() {
        assert_eq!(to_title_case("tHE  hobbit"), "The  Hobbit");
        assert_eq!(to_title_case("o'brien"), "O'brien");
        assert_eq!(to_title_case("   "), "");
    }

    #[test]
    fn token_search_ignores_case() {
        assert_eq!(find_ignore_case("Edited BY Someone", "by"), Some(9));
        assert_eq!(find_ignore_case("GATSBY", "by"), Some(6));
        assert_eq!(find_ignore_case("Dune", "by"), None);
    }
}
