//! Release-name parsing.
//!
//! Extracts a candidate title, year and season/episode markers from names like:
//! - `Daredevil.S01E05.1080p.WEB-DL.x264-GROUP.mkv`
//! - `Cleaner.2025.2160p.WEB.h265.mkv`
//! - `The Office 2x03 Office Olympics.avi`
//! - `[Sub] Show Season 1 Episode 2 (720p).mp4`

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::download::filename::split_extension;

/// Extensions stripped before parsing; anything else is left in place so a
/// trailing year such as `Cleaner.2025` is not mistaken for one.
const MEDIA_EXTENSIONS: [&str; 14] = [
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "ts", "m2ts", "webm", "mpg", "mpeg", "flv", "srt",
    "part",
];

#[allow(clippy::expect_used)]
static BRACKETED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\{[^}]*\}").expect("bracketed group regex is valid"));

#[allow(clippy::expect_used)]
static RELEASE_GROUP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-([A-Za-z0-9]{2,})$").expect("release group regex is valid")
});

#[allow(clippy::expect_used)]
static QUALITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:2160p|1080[pi]|720p|576p|480p|4k|uhd|blu-?ray|bdrip|brrip|web-?dl|web-?rip|web|hdtv|dvdrip|hdrip|dvd|remux|x ?26[45]|h ?26[45]|hevc|avc|xvid|divx|10bit|hdr10|hdr|dv|aac\d?|ac3|ddp?\d?|dts(?:-hd)?|truehd|atmos|proper|repack|extended|unrated|remastered|internal|limited|multi|subbed|dubbed)\b",
    )
    .expect("quality tag regex is valid")
});

#[allow(clippy::expect_used)]
static SXXEXX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2}) ?E(\d{1,3})\b").expect("SxxEyy regex is valid")
});

#[allow(clippy::expect_used)]
static NXNN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").expect("NxNN regex is valid")
});

#[allow(clippy::expect_used)]
static VERBOSE_EPISODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSeason ?(\d{1,2}) ?(?:-|,)? ?Episode ?(\d{1,3})\b")
        .expect("verbose episode regex is valid")
});

#[allow(clippy::expect_used)]
static YEAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("year regex is valid"));

/// Tokens extracted from a filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedName {
    /// Candidate title with separators normalized to spaces.
    pub title: String,
    /// Year adjacent to the title.
    pub year: Option<u16>,
    /// Season number, for episodes.
    pub season: Option<u32>,
    /// Episode number, for episodes.
    pub episode: Option<u32>,
    /// Trailing `-GROUP` tag, if present.
    pub release_group: Option<String>,
}

impl ParsedName {
    /// True when season/episode markers were found.
    #[must_use]
    pub fn is_episode(&self) -> bool {
        self.season.is_some() && self.episode.is_some()
    }
}

/// Parses a release-style filename. Returns `None` when no title survives.
#[must_use]
pub fn parse_filename(filename: &str) -> Option<ParsedName> {
    let (stem, ext) = split_extension(filename.trim());
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    let mut name = if MEDIA_EXTENSIONS.contains(&ext.as_str()) {
        stem.to_string()
    } else {
        filename.trim().to_string()
    };
    // A `.part` temp suffix may hide the real extension.
    if ext == "part" {
        let (inner, inner_ext) = split_extension(&name);
        if MEDIA_EXTENSIONS.contains(&inner_ext.trim_start_matches('.').to_ascii_lowercase().as_str()) {
            name = inner.to_string();
        }
    }

    let name = BRACKETED_PATTERN.replace_all(&name, " ").into_owned();

    // Only a tag after quality markers counts, so `Spider-Man` keeps its name.
    let release_group = RELEASE_GROUP_PATTERN
        .captures(&name)
        .and_then(|caps| caps.get(1))
        .filter(|m| QUALITY_PATTERN.is_match(&name[..m.start()]))
        .map(|m| m.as_str().to_string())
        .filter(|group| !YEAR_PATTERN.is_match(group) && !QUALITY_PATTERN.is_match(group));
    let name = match &release_group {
        Some(group) => name[..name.len() - group.len() - 1].to_string(),
        None => name,
    };

    let normalized = normalize_separators(&name);

    let (prefix, season, episode) = match find_episode(&normalized) {
        Some((start, season, episode)) => (&normalized[..start], Some(season), Some(episode)),
        None => {
            let cut = QUALITY_PATTERN
                .find(&normalized)
                .map_or(normalized.len(), |m| m.start());
            (&normalized[..cut], None, None)
        }
    };

    let (title, year) = split_title_year(prefix);
    let title = clean_title(&title);
    if title.is_empty() {
        debug!(filename, "no title in filename");
        return None;
    }

    let parsed = ParsedName {
        title,
        year,
        season,
        episode,
        release_group,
    };
    debug!(
        filename,
        title = %parsed.title,
        year = ?parsed.year,
        season = ?parsed.season,
        episode = ?parsed.episode,
        "parsed filename"
    );
    Some(parsed)
}

/// Returns (match start, season, episode) for the first episode marker.
fn find_episode(text: &str) -> Option<(usize, u32, u32)> {
    [&*SXXEXX_PATTERN, &*NXNN_PATTERN, &*VERBOSE_EPISODE_PATTERN]
        .into_iter()
        .find_map(|pattern| {
            let caps = pattern.captures(text)?;
            let start = caps.get(0)?.start();
            let season = caps.get(1)?.as_str().parse().ok()?;
            let episode = caps.get(2)?.as_str().parse().ok()?;
            Some((start, season, episode))
        })
}

/// Splits a trailing year off the title. The last year with text before it
/// wins, so `Blade Runner 2049 2017` keeps `2049` in the title.
fn split_title_year(prefix: &str) -> (String, Option<u16>) {
    let last = YEAR_PATTERN
        .captures_iter(prefix)
        .filter_map(|caps| caps.get(1))
        .filter(|m| !prefix[..m.start()].trim().is_empty())
        .last();
    match last {
        Some(m) => (prefix[..m.start()].to_string(), m.as_str().parse().ok()),
        None => (prefix.to_string(), None),
    }
}

fn normalize_separators(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '.' | '_' | '(' | ')' => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean_title(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '-' || c == ' ' || c == ',')
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sxxexx_episode() {
        let parsed = parse_filename("Daredevil.S01E05.1080p.WEB-DL.x264-GROUP.mkv").unwrap();
        assert_eq!(parsed.title, "Daredevil");
        assert_eq!(parsed.season, Some(1));
        assert_eq!(parsed.episode, Some(5));
        assert_eq!(parsed.release_group.as_deref(), Some("GROUP"));
        assert!(parsed.is_episode());
    }

    #[test]
    fn test_parse_nxnn_episode() {
        let parsed = parse_filename("The Office 2x03 Office Olympics.avi").unwrap();
        assert_eq!(parsed.title, "The Office");
        assert_eq!(parsed.season, Some(2));
        assert_eq!(parsed.episode, Some(3));
    }

    #[test]
    fn test_parse_verbose_episode_with_brackets() {
        let parsed = parse_filename("[Sub] Show Name Season 1 Episode 12 (720p).mp4").unwrap();
        assert_eq!(parsed.title, "Show Name");
        assert_eq!(parsed.season, Some(1));
        assert_eq!(parsed.episode, Some(12));
    }

    #[test]
    fn test_parse_episode_with_show_year() {
        let parsed = parse_filename("Doctor.Who.2005.S01E01.Rose.mkv").unwrap();
        assert_eq!(parsed.title, "Doctor Who");
        assert_eq!(parsed.year, Some(2005));
        assert!(parsed.is_episode());
    }

    #[test]
    fn test_parse_movie_with_year_and_tags() {
        let parsed = parse_filename("Inception.2010.1080p.BluRay.x264-SPARKS.mkv").unwrap();
        assert_eq!(parsed.title, "Inception");
        assert_eq!(parsed.year, Some(2010));
        assert!(!parsed.is_episode());
    }

    #[test]
    fn test_parse_movie_year_without_extension() {
        let parsed = parse_filename("Cleaner.2025").unwrap();
        assert_eq!(parsed.title, "Cleaner");
        assert_eq!(parsed.year, Some(2025));
    }

    #[test]
    fn test_parse_movie_with_parenthesized_year() {
        let parsed = parse_filename("The Matrix (1999).mp4").unwrap();
        assert_eq!(parsed.title, "The Matrix");
        assert_eq!(parsed.year, Some(1999));
    }

    #[test]
    fn test_parse_title_containing_number_keeps_it() {
        let parsed = parse_filename("Blade.Runner.2049.2017.2160p.mkv").unwrap();
        assert_eq!(parsed.title, "Blade Runner 2049");
        assert_eq!(parsed.year, Some(2017));
    }

    #[test]
    fn test_parse_hyphenated_title_is_not_a_release_group() {
        let parsed = parse_filename("Spider-Man.mkv").unwrap();
        assert_eq!(parsed.title, "Spider-Man");
        assert!(parsed.release_group.is_none());
    }

    #[test]
    fn test_parse_year_only_title_is_kept() {
        let parsed = parse_filename("1917.mkv").unwrap();
        assert_eq!(parsed.title, "1917");
        assert_eq!(parsed.year, None);
    }

    #[test]
    fn test_parse_unparseable_name() {
        assert!(parse_filename("1080p.x264.mkv").is_none());
        assert!(parse_filename("S01E01.mkv").is_none());
    }
}
