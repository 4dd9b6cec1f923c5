//! Placement of classified files into the library tree.
//!
//! Layout:
//! - movies: `<movies_root>/Title (Year)/<file>`
//! - TV: `<tv_root>/Show/Season NN/<file>`
//! - unmatched: `<unmatched_root>/<file>`
//!
//! Files are moved with a hard link + remove, falling back to an exclusive
//! copy + remove when the temp directory and the library are on different
//! filesystems. Both steps fail on an occupied destination, so a library file
//! is never overwritten, even when two placements race for the same name.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::classify::{ClassificationCandidate, MediaCategory};
use crate::download::filename::{sanitize_dir_component, sanitize_filename, suffixed_candidates};

/// What to do when the destination already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave the file where it is and report the conflict.
    #[default]
    Report,
    /// Place the file as `name (2).ext`, `name (3).ext`, ...
    RenameWithSuffix,
}

/// Errors from placing a file.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The destination is occupied; the file was not moved.
    #[error("destination already exists: {destination}")]
    Conflict {
        /// The occupied destination.
        destination: PathBuf,
    },

    /// File system error while creating directories or moving the file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl PlacementError {
    /// Creates an IO error for `path`.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Library roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryRoots {
    /// Movies root.
    pub movies: PathBuf,
    /// TV shows root.
    pub tv: PathBuf,
    /// Holding location for unclassified files.
    pub unmatched: PathBuf,
}

impl LibraryRoots {
    /// Roots under one base directory: `movies/`, `tv/`, `unmatched/`.
    #[must_use]
    pub fn under(base: &Path) -> Self {
        Self {
            movies: base.join("movies"),
            tv: base.join("tv"),
            unmatched: base.join("unmatched"),
        }
    }
}

/// Where a file should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementTarget {
    /// Library section.
    pub category: MediaCategory,
    /// Movie or show title.
    pub title: String,
    /// Release year (movies).
    pub year: Option<u16>,
    /// Season number (TV).
    pub season: Option<u32>,
}

impl PlacementTarget {
    /// Target for a confident classification.
    #[must_use]
    pub fn from_candidate(candidate: &ClassificationCandidate) -> Self {
        Self {
            category: candidate.category,
            title: candidate.display_title().to_string(),
            year: candidate.display_year(),
            season: candidate.season,
        }
    }

    /// Target for the unmatched root.
    #[must_use]
    pub fn unmatched() -> Self {
        Self {
            category: MediaCategory::Unmatched,
            title: String::new(),
            year: None,
            season: None,
        }
    }
}

/// Moves files into the library.
#[derive(Debug, Clone)]
pub struct PlacementExecutor {
    roots: LibraryRoots,
    policy: ConflictPolicy,
}

impl PlacementExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(roots: LibraryRoots, policy: ConflictPolicy) -> Self {
        Self { roots, policy }
    }

    /// Returns the library roots.
    #[must_use]
    pub fn roots(&self) -> &LibraryRoots {
        &self.roots
    }

    /// Directory a target resolves to.
    #[must_use]
    pub fn directory_for(&self, target: &PlacementTarget) -> PathBuf {
        match target.category {
            MediaCategory::Movie => {
                let name = match target.year {
                    Some(year) => format!("{} ({year})", target.title),
                    None => target.title.clone(),
                };
                self.roots.movies.join(sanitize_dir_component(&name))
            }
            MediaCategory::TvShow => {
                let show = self.roots.tv.join(sanitize_dir_component(&target.title));
                match target.season {
                    Some(season) => show.join(format!("Season {season:02}")),
                    None => show,
                }
            }
            MediaCategory::Unmatched => self.roots.unmatched.clone(),
        }
    }

    /// Moves `source` to the target directory as `filename`.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::Conflict`] when the destination exists and
    /// the policy is [`ConflictPolicy::Report`] (the file is left at
    /// `source`), or [`PlacementError::Io`] if the move fails.
    #[instrument(skip(self, source), fields(category = %target.category))]
    pub async fn place(
        &self,
        source: &Path,
        filename: &str,
        target: &PlacementTarget,
    ) -> Result<PathBuf, PlacementError> {
        let dir = self.directory_for(target);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PlacementError::io(&dir, e))?;

        let filename = sanitize_filename(filename);
        let destination = dir.join(&filename);
        match move_no_clobber(source, &destination).await {
            Ok(()) => {
                info!(destination = %destination.display(), "file placed");
                return Ok(destination);
            }
            Err(MoveError::Occupied) => {}
            Err(MoveError::Failed(e)) => return Err(e),
        }

        if self.policy == ConflictPolicy::Report {
            warn!(destination = %destination.display(), "destination exists, file left in place");
            return Err(PlacementError::Conflict { destination });
        }
        for candidate in suffixed_candidates(&dir, &filename) {
            match move_no_clobber(source, &candidate).await {
                Ok(()) => {
                    info!(destination = %candidate.display(), "file placed under suffixed name");
                    return Ok(candidate);
                }
                Err(MoveError::Occupied) => {}
                Err(MoveError::Failed(e)) => return Err(e),
            }
        }
        Err(PlacementError::Conflict { destination })
    }

    /// Moves `source` to the unmatched root.
    ///
    /// # Errors
    ///
    /// Same as [`PlacementExecutor::place`].
    pub async fn move_to_unmatched(
        &self,
        source: &Path,
        filename: &str,
    ) -> Result<PathBuf, PlacementError> {
        self.place(source, filename, &PlacementTarget::unmatched())
            .await
    }
}

enum MoveError {
    /// Something already exists at the destination.
    Occupied,
    Failed(PlacementError),
}

fn failed(path: &Path, source: io::Error) -> MoveError {
    MoveError::Failed(PlacementError::io(path, source))
}

/// Moves `source` to `destination` unless something already exists there.
async fn move_no_clobber(source: &Path, destination: &Path) -> Result<(), MoveError> {
    match tokio::fs::hard_link(source, destination).await {
        Ok(()) => {
            return tokio::fs::remove_file(source)
                .await
                .map_err(|e| failed(source, e));
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(MoveError::Occupied),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(failed(source, e)),
        Err(e) => debug!(error = %e, "hard link unavailable, copying"),
    }
    copy_no_clobber(source, destination).await
}

async fn copy_no_clobber(source: &Path, destination: &Path) -> Result<(), MoveError> {
    let mut reader = tokio::fs::File::open(source)
        .await
        .map_err(|e| failed(source, e))?;
    let mut writer = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(MoveError::Occupied),
        Err(e) => return Err(failed(destination, e)),
    };

    let copied = async {
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        writer.sync_all().await
    }
    .await;
    drop(writer);
    if let Err(e) = copied {
        if let Err(cleanup) = tokio::fs::remove_file(destination).await {
            warn!(path = %destination.display(), error = %cleanup, "failed to remove partial copy");
        }
        return Err(failed(destination, e));
    }

    tokio::fs::remove_file(source)
        .await
        .map_err(|e| failed(source, e))
}
