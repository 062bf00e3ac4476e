//! File selection and source-capture engine.
//!
//! An ordered rule list decides which files under a source root belong
//! to a run's reproducible snapshot. Rules are evaluated in
//! declaration order and the last applicable rule wins; a path no rule
//! applies to is not selected. Selected files are copied under a
//! destination root and summarized by a deterministic content digest.

mod digest;
mod rules;
mod textfile;

pub use digest::files_digest;
pub use rules::{
    exclude, exclude_regex, include, include_regex, FileSelect, FileSelectRule, RuleError,
    RuleType,
};
pub use textfile::is_text_file;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracker_core::ensure_dir;

pub const MAX_DEFAULT_SOURCECODE_FILE_SIZE: u64 = 1024 * 1024;
pub const MAX_DEFAULT_SOURCECODE_COUNT: usize = 100;

/// Sentinel file marking a directory that must never be captured.
pub const NOCOPY_SENTINEL: &str = ".tracker-nocopy";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capturing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Default selection for sourcecode capture: prune hidden, cache,
/// opted-out, and virtualenv directories, then take text files under
/// the size ceiling, capped at a global file count.
pub fn base_sourcecode_rules() -> Vec<FileSelectRule> {
    vec![
        exclude(&["__pycache__"]).with_type(RuleType::Dir),
        exclude(&[".*"]).with_type(RuleType::Dir),
        exclude(&["*"])
            .with_type(RuleType::Dir)
            .with_sentinel(NOCOPY_SENTINEL),
        exclude(&["*"])
            .with_type(RuleType::Dir)
            .with_sentinel("bin/activate"),
        include(&["*"])
            .with_type(RuleType::Text)
            .size_lt(MAX_DEFAULT_SOURCECODE_FILE_SIZE + 1)
            .max_matches(MAX_DEFAULT_SOURCECODE_COUNT),
    ]
}

/// Copies every selected file under `src_root` to the same relative
/// path under `dest_root`, returning the copied relative paths in
/// traversal order.
///
/// A source file vanishing between selection and copy is tolerated
/// (the tree may be shrinking while we walk it); any other I/O failure
/// propagates.
pub fn copytree(
    src_root: &Path,
    dest_root: &Path,
    select: &mut FileSelect,
) -> Result<Vec<PathBuf>, CaptureError> {
    let mut copied = Vec::new();
    copy_dir(src_root, dest_root, Path::new(""), select, &mut copied)?;
    Ok(copied)
}

fn copy_dir(
    src_root: &Path,
    dest_root: &Path,
    relroot: &Path,
    select: &mut FileSelect,
    copied: &mut Vec<PathBuf>,
) -> Result<(), CaptureError> {
    let dir = src_root.join(relroot);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        // The directory itself vanished mid-walk.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CaptureError::io(&dir, e)),
    };
    let mut names: Vec<(String, bool)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            e.file_name().into_string().ok().map(|n| (n, is_dir))
        })
        .collect();
    names.sort();

    for (name, is_dir) in names {
        let relpath = relroot.join(&name);
        if is_dir {
            if select.prune_dir(src_root, &relpath) {
                tracing::debug!(path = %relpath.display(), "skipping directory");
                continue;
            }
            copy_dir(src_root, dest_root, &relpath, select, copied)?;
        } else if select.select_file(src_root, &relpath) {
            copy_file(src_root, dest_root, &relpath)?;
            copied.push(relpath);
        }
    }
    Ok(())
}

fn copy_file(src_root: &Path, dest_root: &Path, relpath: &Path) -> Result<(), CaptureError> {
    let src = src_root.join(relpath);
    let dest = dest_root.join(relpath);
    if let Some(parent) = dest.parent() {
        ensure_dir(parent).map_err(|e| CaptureError::io(parent, e))?;
    }
    match fs::copy(&src, &dest) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %src.display(), "source vanished during capture");
            Ok(())
        }
        Err(e) => Err(CaptureError::io(&src, e)),
    }
}
