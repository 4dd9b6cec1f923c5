//! Match scoring and the confident/ambiguous decision.
//!
//! A match's score blends title similarity (normalized Levenshtein over
//! normalized titles) with year proximity. The decision is a pure function of
//! the ranked scores, the confidence threshold and the tie-break margin.

use serde::Serialize;

use super::LookupMatch;

/// Weight of title similarity when a year was parsed; the rest goes to the year.
const TITLE_WEIGHT: f64 = 0.8;

/// Default minimum score for an automatic decision.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.80;

/// Default score delta below which two matches count as equally plausible.
pub const DEFAULT_TIE_BREAK_MARGIN: f64 = 0.05;

/// A lookup match with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMatch {
    /// The match.
    pub item: LookupMatch,
    /// Score in `0.0..=1.0`.
    pub score: f64,
}

/// Outcome of ranking a set of scored matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The top match clears the threshold and no runner-up is close.
    Confident {
        /// Index of the chosen match in the ranked list.
        index: usize,
    },
    /// The top match is below the threshold.
    LowConfidence {
        /// Best score seen.
        score: f64,
    },
    /// Two or more matches lie within the tie-break margin of the top score.
    Ambiguous {
        /// Matches within the margin, the top one included.
        count: usize,
    },
    /// The lookup returned nothing.
    NoMatches,
}

/// Lowercases and keeps alphanumeric words, dropping a leading article.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    let lowered: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else if c == '\'' {
                '\0'
            } else {
                ' '
            }
        })
        .filter(|c| *c != '\0')
        .collect();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let words = match words.as_slice() {
        ["the", rest @ ..] if !rest.is_empty() => rest,
        all => all,
    };
    words.join(" ")
}

/// Title similarity in `0.0..=1.0`.
#[must_use]
pub fn title_similarity(parsed: &str, candidate: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_title(parsed), &normalize_title(candidate))
}

/// Year proximity factor: exact 1.0, off by one 0.8, unknown 0.5, else 0.
#[must_use]
pub fn year_factor(parsed: u16, candidate: Option<u16>) -> f64 {
    match candidate {
        Some(year) if year == parsed => 1.0,
        Some(year) if year.abs_diff(parsed) == 1 => 0.8,
        Some(_) => 0.0,
        None => 0.5,
    }
}

/// Scores one match against the parsed title and year.
#[must_use]
pub fn score_match(title: &str, year: Option<u16>, candidate: &LookupMatch) -> f64 {
    let similarity = title_similarity(title, &candidate.title);
    match year {
        Some(year) => {
            TITLE_WEIGHT * similarity + (1.0 - TITLE_WEIGHT) * year_factor(year, candidate.year)
        }
        None => similarity,
    }
}

/// Scores and ranks matches, best first. Equal scores keep lookup order.
#[must_use]
pub fn rank(title: &str, year: Option<u16>, matches: Vec<LookupMatch>) -> Vec<ScoredMatch> {
    let mut scored: Vec<ScoredMatch> = matches
        .into_iter()
        .map(|item| ScoredMatch {
            score: score_match(title, year, &item),
            item,
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

/// Decides over a ranked list.
///
/// Any runner-up within `margin` of the top score makes the result
/// ambiguous, even when the top score clears the threshold.
#[must_use]
pub fn decide(ranked: &[ScoredMatch], threshold: f64, margin: f64) -> Decision {
    let Some(top) = ranked.first() else {
        return Decision::NoMatches;
    };

    let close = ranked
        .iter()
        .filter(|other| top.score - other.score <= margin)
        .count();
    if close > 1 {
        return Decision::Ambiguous { count: close };
    }

    if top.score < threshold {
        return Decision::LowConfidence { score: top.score };
    }

    Decision::Confident { index: 0 }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::classify::MediaCategory;

    fn movie(id: &str, title: &str, year: Option<u16>) -> LookupMatch {
        LookupMatch {
            match_id: id.to_string(),
            title: title.to_string(),
            year,
            category: MediaCategory::Movie,
        }
    }

    fn scored(score: f64) -> ScoredMatch {
        ScoredMatch {
            item: movie("x", "x", None),
            score,
        }
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("The Matrix"), "matrix");
        assert_eq!(normalize_title("Marvel's Daredevil"), "marvels daredevil");
        assert_eq!(normalize_title("Spider-Man: No Way Home"), "spider man no way home");
        assert_eq!(normalize_title("The"), "the");
    }

    #[test]
    fn test_title_similarity_bounds() {
        assert!((title_similarity("Inception", "inception") - 1.0).abs() < f64::EPSILON);
        assert!(title_similarity("Inception", "Interstellar") < 0.6);
    }

    #[test]
    fn test_year_factor() {
        assert!((year_factor(2010, Some(2010)) - 1.0).abs() < f64::EPSILON);
        assert!((year_factor(2010, Some(2011)) - 0.8).abs() < f64::EPSILON);
        assert!(year_factor(2010, Some(1990)).abs() < f64::EPSILON);
        assert!((year_factor(2010, None) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_match_blends_year() {
        let exact = score_match("Cleaner", Some(2025), &movie("1", "Cleaner", Some(2025)));
        let near = score_match("Cleaner", Some(2025), &movie("2", "Cleaner", Some(2024)));
        assert!((exact - 1.0).abs() < 1e-9);
        assert!((near - 0.96).abs() < 1e-9);
    }

    #[test]
    fn test_rank_orders_best_first() {
        let ranked = rank(
            "Inception",
            Some(2010),
            vec![
                movie("1", "Inception: The Cobol Job", Some(2010)),
                movie("2", "Inception", Some(2010)),
            ],
        );
        assert_eq!(ranked[0].item.match_id, "2");
    }

    #[test]
    fn test_decide_confident_when_clear_winner() {
        let ranked = vec![scored(0.95), scored(0.60)];
        assert_eq!(decide(&ranked, 0.80, 0.05), Decision::Confident { index: 0 });
    }

    #[test]
    fn test_decide_tie_within_margin_is_ambiguous() {
        // 0.91 vs 0.89 with a 0.05 margin
        let ranked = vec![scored(0.91), scored(0.89)];
        assert_eq!(decide(&ranked, 0.80, 0.05), Decision::Ambiguous { count: 2 });
    }

    #[test]
    fn test_decide_tie_is_ambiguous_even_below_threshold() {
        let ranked = vec![scored(0.50), scored(0.49), scored(0.10)];
        assert_eq!(decide(&ranked, 0.80, 0.05), Decision::Ambiguous { count: 2 });
    }

    #[test]
    fn test_decide_low_confidence() {
        let ranked = vec![scored(0.70)];
        assert_eq!(
            decide(&ranked, 0.80, 0.05),
            Decision::LowConfidence { score: 0.70 }
        );
    }

    #[test]
    fn test_decide_no_matches() {
        assert_eq!(decide(&[], 0.80, 0.05), Decision::NoMatches);
    }
}
