use std::collections::BTreeSet;

/// Tags a candidate with genre labels derived from its text.
pub trait GenreClassifier: Send + Sync {
    /// Never fails; an empty set means nothing matched.
    fn classify(&self, title: &str, raw_text: &str) -> BTreeSet<&'static str>;
}

const KEYWORDS: &[(&str, &str)] = &[
    ("dragon", "Fantasy"),
    ("wizard", "Fantasy"),
    ("spaceship", "Science Fiction"),
    ("galaxy", "Science Fiction"),
    ("murder", "Mystery"),
    ("detective", "Mystery"),
    ("love", "Romance"),
    ("recipe", "Cooking"),
    ("history", "History"),
    ("biography", "Biography"),
];

/// Case-insensitive substring match against a fixed keyword table.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordGenreClassifier;

impl GenreClassifier for KeywordGenreClassifier {
    fn classify(&self, title: &str, raw_text: &str) -> BTreeSet<&'static str> {
        [title, raw_text]
            .into_iter()
            .filter(|text| !text.trim().is_empty())
            .map(str::to_lowercase)
            .flat_map(|text| {
                KEYWORDS
                    .iter()
                    .filter(move |(keyword, _)| text.contains(keyword))
                    .map(|(_, genre)| *genre)
            })
            .collect()
    }
}
