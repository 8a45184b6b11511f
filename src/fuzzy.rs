//! Similarity scoring for near-duplicate OCR lines.
//!
//! [`weighted_ratio`] takes the best of several scorers so reordered words
//! ("The Lord of the Rings" / "Lord of the Rings, The") and dropped words
//! still score high, while unrelated lines stay low.

/// Ratios of the token and partial scorers are scaled down by this much.
const UNBASE_SCALE: f64 = 0.95;
/// Length ratio from which the partial scorers are used.
const PARTIAL_FROM: f64 = 1.5;

/// Indel similarity of two strings on a 0..=100 scale, ignoring case and surrounding whitespace.
///
/// `100 * (1 - (insertions + deletions) / (len(a) + len(b)))`, which is the same as
/// `200 * lcs / (len(a) + len(b))`.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a = a.trim().chars().flat_map(char::to_lowercase).collect::<Vec<_>>();
    let b = b.trim().chars().flat_map(char::to_lowercase).collect::<Vec<_>>();
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    indel_ratio(&a, &b)
}

/// Composite score on a 0..=100 scale, rounded to a whole number.
///
/// Both strings are lower-cased and stripped of everything except letters, digits and
/// whitespace. Similar lengths use the best of the plain, token-sort and token-set ratios;
/// clearly different lengths use the partial variants instead, scaled down further.
pub fn weighted_ratio(a: &str, b: &str) -> f64 {
    let a = preprocess(a);
    let b = preprocess(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let base = indel_ratio(&a, &b);
    let (shorter, longer) = if a.len() <= b.len() {
        (a.len(), b.len())
    } else {
        (b.len(), a.len())
    };
    let len_ratio = longer as f64 / shorter as f64;

    let score = if len_ratio < PARTIAL_FROM {
        base.max(token_sort(&a, &b, indel_ratio) * UNBASE_SCALE)
            .max(token_set(&a, &b, indel_ratio) * UNBASE_SCALE)
    } else {
        let partial_scale = if len_ratio < 8.0 { 0.9 } else { 0.6 };
        base.max(partial_ratio(&a, &b) * partial_scale)
            .max(token_sort(&a, &b, partial_ratio) * UNBASE_SCALE * partial_scale)
            .max(token_set(&a, &b, partial_ratio) * UNBASE_SCALE * partial_scale)
    };
    score.round()
}

/// Scores every choice against `query` with [`weighted_ratio`] and returns the `limit` best,
/// highest first. Equal scores keep their input order.
pub fn extract_top<'a>(query: &str, choices: &'a [String], limit: usize) -> Vec<(&'a str, f64)> {
    let mut scored = choices
        .iter()
        .map(|choice| (choice.as_str(), weighted_ratio(query, choice)))
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);
    scored
}

fn preprocess(s: &str) -> Vec<char> {
    let cleaned = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect::<String>();
    cleaned.trim().chars().collect()
}

fn indel_ratio(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    200.0 * lcs_len(a, b) as f64 / total as f64
}

/// Best [`indel_ratio`] of the shorter string against every same-length window of the longer.
fn partial_ratio(a: &[char], b: &[char]) -> f64 {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.is_empty() {
        return 0.0;
    }
    longer
        .windows(shorter.len())
        .map(|window| indel_ratio(shorter, window))
        .fold(0.0, f64::max)
}

fn tokens(s: &[char]) -> Vec<String> {
    let mut tokens = s
        .iter()
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    tokens.sort();
    tokens
}

fn joined(tokens: &[String]) -> Vec<char> {
    tokens.join(" ").chars().collect()
}

/// Compares the strings with their words sorted.
fn token_sort(a: &[char], b: &[char], scorer: fn(&[char], &[char]) -> f64) -> f64 {
    scorer(&joined(&tokens(a)), &joined(&tokens(b)))
}

/// Compares the shared words against each side's shared-plus-remaining words.
fn token_set(a: &[char], b: &[char], scorer: fn(&[char], &[char]) -> f64) -> f64 {
    let mut a_tokens = tokens(a);
    let mut b_tokens = tokens(b);
    a_tokens.dedup();
    b_tokens.dedup();

    let shared = a_tokens
        .iter()
        .filter(|it| b_tokens.contains(it))
        .cloned()
        .collect::<Vec<_>>();
    let only_a = a_tokens
        .iter()
        .filter(|it| !shared.contains(it))
        .cloned()
        .collect::<Vec<_>>();
    let only_b = b_tokens
        .iter()
        .filter(|it| !shared.contains(it))
        .cloned()
        .collect::<Vec<_>>();

    let shared_text = shared.join(" ");
    let with = |rest: &[String]| -> Vec<char> {
        [shared_text.as_str(), rest.join(" ").as_str()]
            .join(" ")
            .trim()
            .chars()
            .collect()
    };
    let shared_chars = shared_text.chars().collect::<Vec<_>>();
    let combined_a = with(&only_a);
    let combined_b = with(&only_b);

    scorer(&shared_chars, &combined_a)
        .max(scorer(&shared_chars, &combined_b))
        .max(scorer(&combined_a, &combined_b))
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_ignoring_case_scores_full() {
        assert_eq!(ratio("Dune", "DUNE "), 100.0);
        assert_eq!(ratio("", ""), 100.0);
        assert_eq!(weighted_ratio("Dune", "dune!"), 100.0);
    }

    #[test]
    fn near_duplicate_scores_above_ninety() {
        let score = ratio(
            "Harry Potter and the Philosopher's Stone",
            "Harry Potter & the Philosopher's Stone",
        );
        assert!(score > 90.0 && score < 100.0, "{score}");
        assert!(ratio("Dune", "by Frank Herbert") < 50.0);
    }

    #[test]
    fn reordered_words_score_above_ninety() {
        assert!(ratio("The Lord Of The Rings", "Lord of the Rings") < 90.0);
        assert_eq!(
            weighted_ratio("The Lord Of The Rings", "Lord of the Rings"),
            95.0
        );
        assert_eq!(
            weighted_ratio("Lord of the Rings, The", "The Lord of the Rings"),
            95.0
        );
    }

    #[test]
    fn unrelated_lines_stay_low() {
        assert!(weighted_ratio("The Great Gatsby", "by F. Scott Fitzgerald") < 60.0);
        assert!(weighted_ratio("The Lord Of The Rings", "by J R R Tolkien") < 60.0);
        assert_eq!(weighted_ratio("Dune", "!!!"), 0.0);
    }

    #[test]
    fn very_different_lengths_never_pass_ninety() {
        // Partial matches are capped below the alternative-title threshold.
        assert!(weighted_ratio("Dune", "Dune Messiah") <= 90.0);
        assert!(weighted_ratio("Rings", "The Lord of the Rings") <= 90.0);
    }

    #[test]
    fn extract_top_orders_by_score() {
        let choices = vec![
            "by Frank Herbert".to_string(),
            "Dune Messiah".to_string(),
            "Dune".to_string(),
        ];
        let top = extract_top("Dune", &choices, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "Dune");
        assert_eq!(top[1].0, "Dune Messiah");
    }
}
