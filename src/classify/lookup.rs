//! Metadata lookup contract and the TMDB implementation.
//!
//! A lookup answers `query(title, year, category)` with an ordered list of
//! matches. An empty list means "not found"; a [`LookupError`] means the
//! service could not answer, which is a different thing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use super::MediaCategory;

/// Default TMDB API base URL.
const DEFAULT_TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

/// Default request timeout for lookups (15 seconds).
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// One result from the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupMatch {
    /// Service-specific identifier.
    pub match_id: String,
    /// Canonical title.
    pub title: String,
    /// Release (or first air) year.
    pub year: Option<u16>,
    /// Category the match belongs to.
    pub category: MediaCategory,
}

/// Errors from a metadata lookup. "No results" is not an error.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The request never got an answer (DNS, connect, timeout).
    #[error("metadata service unreachable: {source}")]
    Network {
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a temporary failure (429, 5xx).
    #[error("metadata service error (HTTP {status})")]
    Service {
        /// The status code.
        status: u16,
    },

    /// The service rejected the request (bad key, bad query).
    #[error("metadata service rejected the request (HTTP {status})")]
    Rejected {
        /// The status code.
        status: u16,
    },

    /// The response body could not be understood.
    #[error("invalid metadata response: {message}")]
    InvalidResponse {
        /// What was wrong.
        message: String,
    },

    /// No API key or endpoint configured.
    #[error("metadata lookup not configured: {message}")]
    NotConfigured {
        /// What is missing.
        message: String,
    },
}

impl LookupError {
    /// Returns whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Service { .. })
    }
}

/// Title/year/category metadata service.
///
/// # Object Safety
///
/// This trait uses `async_trait` so the classifier can hold an
/// `Arc<dyn MetadataLookup>`.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Returns the lookup's name (e.g., "tmdb").
    fn name(&self) -> &str;

    /// Searches for `title`, optionally narrowed by `year`, within `category`.
    async fn query(
        &self,
        title: &str,
        year: Option<u16>,
        category: MediaCategory,
    ) -> Result<Vec<LookupMatch>, LookupError>;
}

// ==================== TmdbLookup ====================

#[derive(Debug, Deserialize)]
struct TmdbSearchResponse {
    #[serde(default)]
    results: Vec<TmdbResult>,
}

#[derive(Debug, Deserialize)]
struct TmdbResult {
    id: u64,
    /// Movies carry `title`, shows carry `name`.
    title: Option<String>,
    name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
}

/// Searches The Movie Database (`search/movie`, `search/tv`).
pub struct TmdbLookup {
    client: Client,
    base_url: String,
    api_key: String,
}

impl TmdbLookup {
    /// Creates a lookup against the public TMDB API.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotConfigured`] for an empty key, or
    /// [`LookupError::Network`] if the HTTP client cannot be built.
    #[instrument(skip_all)]
    pub fn new(api_key: impl Into<String>) -> Result<Self, LookupError> {
        Self::build(api_key.into(), DEFAULT_TMDB_BASE_URL.to_string())
    }

    /// Creates a lookup with a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Same as [`TmdbLookup::new`].
    #[instrument(skip_all, fields(base_url))]
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, LookupError> {
        Self::build(api_key.into(), base_url.into())
    }

    fn build(api_key: String, base_url: String) -> Result<Self, LookupError> {
        if api_key.trim().is_empty() {
            return Err(LookupError::NotConfigured {
                message: "TMDB API key is empty".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|source| LookupError::Network { source })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl std::fmt::Debug for TmdbLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmdbLookup")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MetadataLookup for TmdbLookup {
    fn name(&self) -> &str {
        "tmdb"
    }

    #[instrument(skip(self), fields(lookup = "tmdb"))]
    async fn query(
        &self,
        title: &str,
        year: Option<u16>,
        category: MediaCategory,
    ) -> Result<Vec<LookupMatch>, LookupError> {
        let (endpoint, year_param) = match category {
            MediaCategory::Movie => ("search/movie", "year"),
            MediaCategory::TvShow => ("search/tv", "first_air_date_year"),
            MediaCategory::Unmatched => return Ok(Vec::new()),
        };
        let mut params = vec![
            ("api_key", self.api_key.clone()),
            ("query", title.to_string()),
            ("include_adult", "false".to_string()),
            ("language", "en-US".to_string()),
            ("page", "1".to_string()),
        ];
        if let Some(year) = year {
            params.push((year_param, year.to_string()));
        }

        let url = Url::parse_with_params(&format!("{}/{endpoint}", self.base_url), &params)
            .map_err(|e| LookupError::NotConfigured {
                message: format!("invalid TMDB base URL: {e}"),
            })?;

        debug!(endpoint, "calling TMDB search");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| LookupError::Network { source })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            404 => return Ok(Vec::new()),
            429 | 500..=599 => {
                warn!(status, "TMDB temporarily unavailable");
                return Err(LookupError::Service { status });
            }
            _ => return Err(LookupError::Rejected { status }),
        }

        let body: TmdbSearchResponse =
            response
                .json()
                .await
                .map_err(|e| LookupError::InvalidResponse {
                    message: e.to_string(),
                })?;

        let matches: Vec<LookupMatch> = body
            .results
            .into_iter()
            .filter_map(|result| {
                let (name, date) = match category {
                    MediaCategory::TvShow => (result.name.or(result.title), result.first_air_date),
                    _ => (result.title.or(result.name), result.release_date),
                };
                Some(LookupMatch {
                    match_id: result.id.to_string(),
                    title: name.filter(|n| !n.trim().is_empty())?,
                    year: date.as_deref().and_then(year_from_date),
                    category,
                })
            })
            .collect();

        debug!(count = matches.len(), "TMDB search returned");
        Ok(matches)
    }
}

// ==================== DisabledLookup ====================

/// Lookup used when no metadata service is configured. Every query fails
/// with [`LookupError::NotConfigured`], so every file goes to manual
/// resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLookup;

#[async_trait]
impl MetadataLookup for DisabledLookup {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn query(
        &self,
        _title: &str,
        _year: Option<u16>,
        _category: MediaCategory,
    ) -> Result<Vec<LookupMatch>, LookupError> {
        Err(LookupError::NotConfigured {
            message: "no TMDB API key".to_string(),
        })
    }
}

/// Reads the year from `YYYY-MM-DD`.
fn year_from_date(date: &str) -> Option<u16> {
    date.get(..4)?.parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn test_year_from_date() {
        assert_eq!(year_from_date("2010-07-16"), Some(2010));
        assert_eq!(year_from_date(""), None);
        assert_eq!(year_from_date("soon"), None);
    }

    #[test]
    fn test_lookup_error_retryable() {
        assert!(LookupError::Service { status: 503 }.is_retryable());
        assert!(!LookupError::Rejected { status: 401 }.is_retryable());
        assert!(
            !LookupError::InvalidResponse {
                message: "x".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_tmdb_lookup_rejects_empty_key() {
        assert!(matches!(
            TmdbLookup::new("  "),
            Err(LookupError::NotConfigured { .. })
        ));
    }

    #[test]
    fn test_tmdb_lookup_debug_redacts_key() {
        let lookup = TmdbLookup::new("secret-key").unwrap();
        let debug = format!("{lookup:?}");
        assert!(!debug.contains("secret-key"));
    }

    #[tokio::test]
    async fn test_disabled_lookup_is_not_retryable() {
        let err = DisabledLookup
            .query("Anything", None, MediaCategory::Movie)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotConfigured { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_tmdb_movie_search_maps_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .and(query_param("query", "Inception"))
            .and(query_param("year", "2010"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"id": 27205, "title": "Inception", "release_date": "2010-07-15"},
                    {"id": 1, "title": "", "release_date": "2010-01-01"}
                ]
            })))
            .mount(&server)
            .await;

        let lookup = TmdbLookup::with_base_url("key", server.uri()).unwrap();
        let matches = lookup
            .query("Inception", Some(2010), MediaCategory::Movie)
            .await
            .unwrap();

        assert_eq!(
            matches,
            vec![LookupMatch {
                match_id: "27205".to_string(),
                title: "Inception".to_string(),
                year: Some(2010),
                category: MediaCategory::Movie,
            }]
        );
    }

    #[tokio::test]
    async fn test_tmdb_tv_search_uses_name_and_first_air_date() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/tv"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"id": 61889, "name": "Marvel's Daredevil", "first_air_date": "2015-04-10"}]
            })))
            .mount(&server)
            .await;

        let lookup = TmdbLookup::with_base_url("key", server.uri()).unwrap();
        let matches = lookup
            .query("Daredevil", None, MediaCategory::TvShow)
            .await
            .unwrap();
        assert_eq!(matches[0].title, "Marvel's Daredevil");
        assert_eq!(matches[0].year, Some(2015));
        assert_eq!(matches[0].category, MediaCategory::TvShow);
    }

    #[tokio::test]
    async fn test_tmdb_server_error_is_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let lookup = TmdbLookup::with_base_url("key", server.uri()).unwrap();
        let result = lookup.query("Anything", None, MediaCategory::Movie).await;
        assert!(matches!(result, Err(LookupError::Service { status: 503 })));
    }

    #[tokio::test]
    async fn test_tmdb_not_found_is_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let lookup = TmdbLookup::with_base_url("key", server.uri()).unwrap();
        let matches = lookup
            .query("Nothing", None, MediaCategory::Movie)
            .await
            .unwrap();
        assert!(matches.is_empty());
    }
}
