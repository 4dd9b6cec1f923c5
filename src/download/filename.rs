//! Filename sanitization and path derivation for temp files and library entries.
//!
//! Declared filenames come from the messaging side and cannot be trusted, so
//! every name is reduced to a single safe path segment before it touches the
//! filesystem.

use std::path::{Component, Path, PathBuf};

/// Used when a declared name sanitizes down to nothing.
const FALLBACK_FILENAME: &str = "download.bin";

/// Sanitizes a declared filename into one safe path segment.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |`) and control characters with `_`. Dot-only names are
/// rewritten so they cannot climb out of the target directory.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.trim_matches('_').is_empty() {
        return FALLBACK_FILENAME.to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Sanitizes a library directory name such as `Inception (2010)` or `Season 01`.
///
/// Spaces and parentheses survive; separators and reserved characters are
/// dropped, and trailing dots or spaces are trimmed.
#[must_use]
pub fn sanitize_dir_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['.', ' ']).trim_start();
    if trimmed.is_empty() || !is_safe_filename_segment(trimmed) {
        return "Unknown".to_string();
    }
    trimmed.to_string()
}

/// Splits `name.ext` into (`name`, `.ext`); names without a dot have no extension.
#[must_use]
pub fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}

/// Builds `name (n).ext` for conflict renames.
#[must_use]
pub fn with_numeric_suffix(filename: &str, n: u32) -> String {
    let (stem, ext) = split_extension(filename);
    format!("{stem} ({n}){ext}")
}

/// Conflict-rename candidates `name (2).ext` through `name (999).ext`, in order.
pub fn suffixed_candidates(dir: &Path, filename: &str) -> impl Iterator<Item = PathBuf> {
    let dir = dir.to_path_buf();
    let filename = filename.to_string();
    (2..1000).map(move |n| dir.join(with_numeric_suffix(&filename, n)))
}

/// Temp path for one queued item: `<temp_dir>/<id>_<sanitized filename>.part`.
///
/// The id prefix keeps two items with the same declared name apart.
#[must_use]
pub fn temp_path_for(temp_dir: &Path, id: u64, filename: &str) -> PathBuf {
    temp_dir.join(format!("{id}_{}.part", sanitize_filename(filename)))
}

fn is_safe_filename_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}
