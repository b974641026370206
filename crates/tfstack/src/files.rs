//! discovery of descriptor files
//!
//! A path argument is one of
//! - a file: used as is
//! - a directory: every descriptor file inside (optionally recursive, hidden directories skipped)
//! - a glob (`stacks/*/main.hcl`): every matching descriptor file
//!
//! Auto import files (`common_auto.hcl`) are never returned, they are picked up by
//! [crate::auto_import::AutoImports] for the descriptor next to them.
use crate::util;
use globset::{GlobBuilder, GlobMatcher};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Marker in file names of auto import files
const AUTO_IMPORT_MARKER: &str = "_auto";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatcher {
    extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    /// Only the directory itself
    Flat,
    /// The directory and all non-hidden sub directories
    Recursive,
}

impl FileMatcher {
    /// `extension` without the leading dot
    pub fn new(extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            extension: extension.trim_start_matches('.').to_lowercase(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext.to_string_lossy().to_lowercase() == self.extension)
    }

    /// File name contains `_auto` (any case) and has the descriptor extension
    pub fn is_auto_import(&self, path: &Path) -> bool {
        self.has_extension(path)
            && path.file_stem().is_some_and(|stem| {
                stem.to_string_lossy()
                    .to_lowercase()
                    .contains(AUTO_IMPORT_MARKER)
            })
    }

    /// A descriptor file that is not an auto import
    pub fn is_descriptor(&self, path: &Path) -> bool {
        self.has_extension(path) && !self.is_auto_import(path)
    }

    /// Find descriptor files for a path argument, sorted by path
    pub fn find(&self, path: &Path, recursion: Recursion) -> Result<Vec<PathBuf>, FindError> {
        if is_glob(path) {
            return self.find_glob(path);
        }

        let metadata = std::fs::metadata(path).map_err(|source| FindError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if metadata.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }

        let max_depth = match recursion {
            Recursion::Flat => 1,
            Recursion::Recursive => usize::MAX,
        };

        let walker = WalkDir::new(path)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir() && util::is_hidden(entry.file_name()))
            });

        self.collect(path, walker)
    }

    fn find_glob(&self, pattern: &Path) -> Result<Vec<PathBuf>, FindError> {
        let pattern_string = pattern.to_string_lossy().to_string();
        let matcher = GlobBuilder::new(&pattern_string)
            .literal_separator(true)
            .build()
            .map_err(|source| FindError::Glob {
                pattern: pattern_string.clone(),
                source,
            })?
            .compile_matcher();

        let root = glob_root(pattern);
        tracing::debug!(pattern=%pattern_string, root=%root.display(), "searching files by glob");

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && util::SKIPPED_DIRECTORIES
                        .iter()
                        .any(|skipped| entry.file_name() == *skipped))
            });

        let found = self.collect(&root, walker)?;
        Ok(filter_matching(found, &matcher))
    }

    fn collect(
        &self,
        root: &Path,
        walker: impl Iterator<Item = walkdir::Result<walkdir::DirEntry>>,
    ) -> Result<Vec<PathBuf>, FindError> {
        let mut found = vec![];
        for entry in walker {
            let entry = entry.map_err(|source| FindError::Walk {
                path: root.to_path_buf(),
                source,
            })?;

            if entry.file_type().is_file() && self.is_descriptor(entry.path()) {
                found.push(entry.into_path());
            }
        }

        found.sort();
        Ok(found)
    }
}

fn filter_matching(paths: Vec<PathBuf>, matcher: &GlobMatcher) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|path| matcher.is_match(path))
        .collect()
}

fn is_glob(path: &Path) -> bool {
    path.to_string_lossy()
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | '{'))
}

/// Longest leading part of a glob without any pattern characters
fn glob_root(pattern: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in pattern.components() {
        if let Component::Normal(part) = component {
            if is_glob(Path::new(part)) {
                break;
            }
        }
        root.push(component.as_os_str());
    }

    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FindError {
    #[error("{}: unable to access path", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: unable to list directory", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("invalid glob `{pattern}`")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}
