//! sibling files merged into every descriptor of a directory
use crate::descriptor::{Descriptor, ParseError};
use crate::files::FileMatcher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Per directory cache of parsed auto import files
///
/// Lookups for the same directory return the same parsed partials for the lifetime of
/// the instance.
#[derive(Debug)]
pub struct AutoImports {
    matcher: FileMatcher,
    cache: Mutex<HashMap<PathBuf, Arc<Vec<Descriptor>>>>,
}

impl AutoImports {
    pub fn new(matcher: FileMatcher) -> Self {
        Self {
            matcher,
            cache: Mutex::default(),
        }
    }

    /// Auto import partials of `directory` sorted by file name
    ///
    /// No matching files is an empty list.
    pub fn find(&self, directory: &Path) -> Result<Arc<Vec<Descriptor>>, AutoImportError> {
        // held for the whole lookup so a directory is only parsed once
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(cached) = cache.get(directory) {
            tracing::debug!(directory=%directory.display(), count=cached.len(), "auto imports from cache");
            return Ok(Arc::clone(cached));
        }

        let mut paths = vec![];
        let entries = std::fs::read_dir(directory).map_err(|source| AutoImportError::Io {
            path: directory.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| AutoImportError::Io {
                path: directory.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && self.matcher.is_auto_import(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let partials = paths
            .iter()
            .map(|path| Descriptor::load(path))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(directory=%directory.display(), count=partials.len(), "loaded auto imports");

        let partials = Arc::new(partials);
        cache.insert(directory.to_path_buf(), Arc::clone(&partials));
        Ok(partials)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AutoImportError {
    #[error("{}: unable to list auto imports", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}
