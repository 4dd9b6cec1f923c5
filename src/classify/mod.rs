//! Classification of completed downloads into movies and TV shows.
//!
//! # Overview
//!
//! A filename is parsed into a candidate title, year and season/episode
//! markers ([`parse_filename`]). Episode markers make it a TV candidate,
//! anything else a movie candidate. The candidate is looked up through a
//! [`MetadataLookup`], the matches are scored ([`scoring`]) and the result is
//! either a confident [`ClassificationCandidate`] or one routed to manual
//! resolution with a [`ManualReason`].
//!
//! Lookup service errors are retried a bounded number of times. When retries
//! run out the file still goes to manual resolution; it is never dropped.

mod lookup;
mod parser;
pub mod scoring;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::download::{FailureType, RetryDecision, RetryPolicy};

pub use lookup::{DisabledLookup, LookupError, LookupMatch, MetadataLookup, TmdbLookup};
pub use parser::{ParsedName, parse_filename};
pub use scoring::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_TIE_BREAK_MARGIN, Decision, ScoredMatch};

/// Default number of lookup retries after the first attempt.
pub const DEFAULT_LOOKUP_MAX_RETRIES: u32 = 2;

/// Default fixed delay between lookup attempts (2 seconds).
pub const DEFAULT_LOOKUP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Library section a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    /// Feature film.
    Movie,
    /// Episode of a series.
    TvShow,
    /// Could not be classified.
    Unmatched,
}

impl MediaCategory {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::TvShow => "tv_show",
            Self::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" | "film" => Ok(Self::Movie),
            "tv" | "tv_show" | "show" | "series" => Ok(Self::TvShow),
            "unmatched" => Ok(Self::Unmatched),
            other => Err(format!("unknown category '{other}' (expected movie or tv)")),
        }
    }
}

/// Result of classifying one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationCandidate {
    /// Parsed title (empty when the name could not be parsed).
    pub title: String,
    /// Parsed year.
    pub year: Option<u16>,
    /// Parsed season.
    pub season: Option<u32>,
    /// Parsed episode.
    pub episode: Option<u32>,
    /// Score of the best match, `0.0` without one.
    pub score: f64,
    /// Resolved category; [`MediaCategory::Unmatched`] unless confident.
    pub category: MediaCategory,
    /// Highest-scoring match, if any.
    pub best_match: Option<LookupMatch>,
}

impl ClassificationCandidate {
    fn unparsed() -> Self {
        Self {
            title: String::new(),
            year: None,
            season: None,
            episode: None,
            score: 0.0,
            category: MediaCategory::Unmatched,
            best_match: None,
        }
    }

    fn from_parsed(parsed: &ParsedName) -> Self {
        Self {
            title: parsed.title.clone(),
            year: parsed.year,
            season: parsed.season,
            episode: parsed.episode,
            score: 0.0,
            category: MediaCategory::Unmatched,
            best_match: None,
        }
    }

    /// Title used for placement: the match's canonical title if any.
    #[must_use]
    pub fn display_title(&self) -> &str {
        self.best_match
            .as_ref()
            .map_or(self.title.as_str(), |m| m.title.as_str())
    }

    /// Year used for placement: the match's year, else the parsed one.
    #[must_use]
    pub fn display_year(&self) -> Option<u16> {
        self.best_match.as_ref().and_then(|m| m.year).or(self.year)
    }
}

/// Why a file needs an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManualReason {
    /// Best score below the confidence threshold.
    LowConfidence {
        /// The best score.
        score: f64,
    },
    /// Several matches within the tie-break margin.
    Ambiguous {
        /// Number of equally plausible matches.
        count: usize,
    },
    /// Lookup returned no results.
    NoMatches,
    /// Lookup kept failing.
    LookupUnavailable {
        /// Last error seen.
        detail: String,
    },
    /// No title could be read from the filename.
    UnparseableName,
}

impl fmt::Display for ManualReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowConfidence { score } => {
                write!(f, "low confidence (best score {score:.2})")
            }
            Self::Ambiguous { count } => write!(f, "ambiguous: {count} equally plausible matches"),
            Self::NoMatches => f.write_str("no matches found"),
            Self::LookupUnavailable { detail } => {
                write!(f, "metadata lookup unavailable: {detail}")
            }
            Self::UnparseableName => f.write_str("could not read a title from the filename"),
        }
    }
}

/// Outcome of [`Classifier::classify`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Classification {
    /// Safe to place automatically.
    Confident(ClassificationCandidate),
    /// Needs an operator decision.
    NeedsManual {
        /// Best effort candidate.
        candidate: ClassificationCandidate,
        /// Why.
        reason: ManualReason,
    },
}

impl Classification {
    /// The candidate, whichever way it went.
    #[must_use]
    pub fn candidate(&self) -> &ClassificationCandidate {
        match self {
            Self::Confident(candidate) | Self::NeedsManual { candidate, .. } => candidate,
        }
    }
}

/// Classifier tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    /// Minimum score for an automatic decision.
    pub confidence_threshold: f64,
    /// Score delta below which matches are equally plausible.
    pub tie_break_margin: f64,
    /// Retries after the first failed lookup.
    pub lookup_max_retries: u32,
    /// Fixed delay between lookup attempts.
    pub lookup_retry_delay: Duration,
}

impl ClassifierSettings {
    /// Retry budget for lookup service errors.
    #[must_use]
    pub fn lookup_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.lookup_max_retries, self.lookup_retry_delay)
    }
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            tie_break_margin: DEFAULT_TIE_BREAK_MARGIN,
            lookup_max_retries: DEFAULT_LOOKUP_MAX_RETRIES,
            lookup_retry_delay: DEFAULT_LOOKUP_RETRY_DELAY,
        }
    }
}

/// Parses, looks up and scores filenames.
pub struct Classifier {
    lookup: Arc<dyn MetadataLookup>,
    settings: ClassifierSettings,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("lookup", &self.lookup.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Classifier {
    /// Creates a classifier over a lookup.
    #[must_use]
    pub fn new(lookup: Arc<dyn MetadataLookup>, settings: ClassifierSettings) -> Self {
        Self { lookup, settings }
    }

    /// Returns the classifier settings.
    #[must_use]
    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    /// Classifies one filename.
    #[instrument(skip(self), fields(lookup = self.lookup.name()))]
    pub async fn classify(&self, filename: &str) -> Classification {
        let Some(parsed) = parse_filename(filename) else {
            return Classification::NeedsManual {
                candidate: ClassificationCandidate::unparsed(),
                reason: ManualReason::UnparseableName,
            };
        };

        let category = if parsed.is_episode() {
            MediaCategory::TvShow
        } else {
            MediaCategory::Movie
        };
        let mut candidate = ClassificationCandidate::from_parsed(&parsed);

        let matches = match self.query_with_retry(&parsed, category).await {
            Ok(matches) => matches,
            Err(e) => {
                return Classification::NeedsManual {
                    candidate,
                    reason: ManualReason::LookupUnavailable {
                        detail: e.to_string(),
                    },
                };
            }
        };

        let ranked = scoring::rank(&parsed.title, parsed.year, matches);
        let decision = scoring::decide(
            &ranked,
            self.settings.confidence_threshold,
            self.settings.tie_break_margin,
        );
        if let Some(top) = ranked.first() {
            candidate.score = top.score;
            candidate.best_match = Some(top.item.clone());
        }
        debug!(?decision, matches = ranked.len(), "scored lookup matches");

        match decision {
            Decision::Confident { .. } => {
                candidate.category = category;
                info!(title = %candidate.display_title(), %category, score = candidate.score, "classified");
                Classification::Confident(candidate)
            }
            Decision::LowConfidence { score } => Classification::NeedsManual {
                candidate,
                reason: ManualReason::LowConfidence { score },
            },
            Decision::Ambiguous { count } => Classification::NeedsManual {
                candidate,
                reason: ManualReason::Ambiguous { count },
            },
            Decision::NoMatches => Classification::NeedsManual {
                candidate,
                reason: ManualReason::NoMatches,
            },
        }
    }

    async fn query_with_retry(
        &self,
        parsed: &ParsedName,
        category: MediaCategory,
    ) -> Result<Vec<LookupMatch>, LookupError> {
        let policy = self.settings.lookup_retry();
        let mut retries = 0;
        loop {
            let error = match self
                .lookup
                .query(&parsed.title, parsed.year, category)
                .await
            {
                Ok(matches) => return Ok(matches),
                Err(e) => e,
            };
            let failure_type = if error.is_retryable() {
                FailureType::Transient
            } else {
                FailureType::Fatal
            };
            match policy.should_retry(failure_type, retries) {
                RetryDecision::Retry { delay, attempt } => {
                    warn!(
                        error = %error,
                        attempt,
                        max_retries = policy.max_retries(),
                        "metadata lookup failed, retrying"
                    );
                    retries = attempt;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %error, %reason, "metadata lookup unavailable");
                    return Err(error);
                }
            }
        }
    }
}
