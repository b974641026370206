use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directories never copied along with a module or unit
pub(crate) const SKIPPED_DIRECTORIES: [&str; 3] = [".tfstack", ".terraform", ".git"];

/// Lexically resolve `.` and `..` without touching the filesystem
///
/// `..` at the root stays at the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Resolve `path` relative to `base` unless it is absolute
pub fn resolve_relative(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&base.join(path))
    }
}

pub(crate) fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Recursively copy `from` into `to`, skipping tool and vcs directories
///
/// A single file is copied into `to` under its own name.
pub fn copy_tree(from: &Path, to: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(to)?;

    if from.is_file() {
        let name = from.file_name().unwrap_or(from.as_os_str());
        return std::fs::copy(from, to.join(name));
    }

    let mut copied = 0;
    let walker = WalkDir::new(from).min_depth(1).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && SKIPPED_DIRECTORIES
                .iter()
                .any(|skipped| entry.file_name() == *skipped))
    });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copied += std::fs::copy(entry.path(), &target)?;
        }
    }

    tracing::debug!(from=%from.display(), to=%to.display(), bytes=copied, "copied tree");
    Ok(copied)
}
