//! Catalog lookup seam. The crate ships no HTTP client; callers plug one in
//! and can reuse [`books_from_search`] to map an Open Library `search.json` body.

use std::cmp::Reverse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BookMetadata {
    pub title: String,
    pub author: Option<String>,
    pub publish_year: Option<i32>,
    pub isbn: Option<String>,
    pub cover_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Unable to reach the book lookup service. Please try again later.")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("lookup was cancelled")]
    Cancelled,
}

/// Maps a free-text query to catalog records.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// A blank query yields an empty list without contacting the catalog.
    async fn lookup(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<BookMetadata>, LookupError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub docs: Vec<SearchDoc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchDoc {
    pub title: Option<String>,
    pub author_name: Option<Vec<String>>,
    pub first_publish_year: Option<i32>,
    pub isbn: Option<Vec<String>>,
    #[serde(rename = "cover_i")]
    pub cover_id: Option<i64>,
}

/// Newest first, missing years last, at most five records.
pub fn books_from_search(response: SearchResponse) -> Vec<BookMetadata> {
    let mut docs = response.docs;
    docs.sort_by_key(|doc| Reverse(doc.first_publish_year));
    docs.into_iter()
        .take(MAX_RESULTS)
        .map(|doc| BookMetadata {
            title: doc.title.unwrap_or_default(),
            author: doc.author_name.and_then(|names| names.into_iter().next()),
            publish_year: doc.first_publish_year,
            isbn: doc.isbn.and_then(|isbns| isbns.into_iter().next()),
            cover_url: doc
                .cover_id
                .map(|id| format!("https://covers.openlibrary.org/b/id/{id}-M.jpg")),
        })
        .collect()
}
