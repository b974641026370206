//! fetching module sources and hook scripts
//!
//! The shape of the source string decides how it is fetched:
//!
//! | source                                        | kind       |
//! |-----------------------------------------------|------------|
//! | `/abs/path`, `./rel`, `../rel`, `modules/x`     | local copy |
//! | `git::https://host/repo.git?ref=v1.2`         | git clone  |
//! | `https://host/file.sh`                        | download   |
//! | `hashicorp/consul/aws`                        | registry (rejected) |
use crate::exec::{ExecError, ExecOptions, ProcessExecutor};
use crate::util;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static REGISTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z][0-9A-Za-z_-]*/[0-9A-Za-z][0-9A-Za-z_-]*/[0-9a-z]+$")
        .expect("registry pattern is valid")
});

/// Directory inside the destination a repository is cloned into before copying
const CLONE_DIR: &str = ".tfstack-source";

pub trait SourceGetter: Send + Sync {
    /// Place the content of `source` inside `destination`
    ///
    /// A single file lands as `destination/<file name>`, a directory tree is merged into
    /// `destination`.
    fn get(&self, source: &str, destination: &Path, version: Option<&str>) -> Result<(), GetError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Local(PathBuf),
    Git {
        url: String,
        reference: Option<String>,
    },
    Http(String),
    Registry(String),
}

impl SourceKind {
    pub fn detect(source: &str) -> Result<Self, GetError> {
        if let Some(rest) = source.strip_prefix("git::") {
            let (url, reference) = match rest.split_once("?ref=") {
                Some((url, reference)) => (url, Some(reference.to_string())),
                None => (rest, None),
            };

            let path_part = url.split_once("://").map_or(url, |(_, rest)| rest);
            if path_part.contains("//") {
                return Err(GetError::Unsupported {
                    location: source.to_string(),
                    reason: "sub-directories of repositories",
                });
            }

            return Ok(SourceKind::Git {
                url: url.to_string(),
                reference,
            });
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(SourceKind::Http(source.to_string()));
        }

        if !source.starts_with(['/', '.']) && REGISTRY.is_match(source) {
            return Ok(SourceKind::Registry(source.to_string()));
        }

        if source.contains("::") {
            return Err(GetError::Unsupported {
                location: source.to_string(),
                reason: "this fetcher",
            });
        }

        Ok(SourceKind::Local(PathBuf::from(source)))
    }
}

/// Local copies plus `git` and `curl` through the process executor
pub struct Getter {
    executor: Arc<dyn ProcessExecutor>,
    timeout: Duration,
}

impl Getter {
    pub fn new(executor: Arc<dyn ProcessExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn copy_local(&self, from: &Path, destination: &Path) -> Result<(), GetError> {
        if !from.exists() {
            return Err(GetError::NotFound {
                path: from.to_path_buf(),
            });
        }

        let copied = util::copy_tree(from, destination).map_err(|source| GetError::Io {
            path: from.to_path_buf(),
            source,
        })?;
        tracing::debug!(from=%from.display(), to=%destination.display(), copied, "copied local source");
        Ok(())
    }

    fn clone_repository(
        &self,
        url: &str,
        reference: Option<&str>,
        destination: &Path,
    ) -> Result<(), GetError> {
        let checkout = destination.join(CLONE_DIR);
        if checkout.exists() {
            std::fs::remove_dir_all(&checkout).map_err(|source| GetError::Io {
                path: checkout.clone(),
                source,
            })?;
        }

        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        if let Some(reference) = reference {
            args.push("--branch".to_string());
            args.push(reference.to_string());
        }
        args.push(url.to_string());
        args.push(checkout.display().to_string());

        self.executor.execute(
            ExecOptions {
                timeout: Some(self.timeout),
                ..Default::default()
            },
            "git",
            &args,
        )?;

        if !checkout.is_dir() {
            return Err(GetError::NotFound { path: checkout });
        }
        util::copy_tree(&checkout, destination).map_err(|source| GetError::Io {
            path: checkout.clone(),
            source,
        })?;
        std::fs::remove_dir_all(&checkout).map_err(|source| GetError::Io {
            path: checkout,
            source,
        })?;
        Ok(())
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), GetError> {
        let target = destination.join(file_name(url));
        self.executor.execute(
            ExecOptions {
                timeout: Some(self.timeout),
                ..Default::default()
            },
            "curl",
            &[
                "-fsSL".to_string(),
                "-o".to_string(),
                target.display().to_string(),
                url.to_string(),
            ],
        )?;
        Ok(())
    }
}

impl SourceGetter for Getter {
    #[tracing::instrument(level = "debug", skip(self))]
    fn get(&self, source: &str, destination: &Path, version: Option<&str>) -> Result<(), GetError> {
        std::fs::create_dir_all(destination).map_err(|err| GetError::Io {
            path: destination.to_path_buf(),
            source: err,
        })?;

        match SourceKind::detect(source)? {
            SourceKind::Local(path) => self.copy_local(&path, destination),
            SourceKind::Git { url, reference } => {
                self.clone_repository(&url, reference.as_deref().or(version), destination)
            }
            SourceKind::Http(url) => self.download(&url, destination),
            SourceKind::Registry(_) => Err(GetError::Unsupported {
                location: source.to_string(),
                reason: "registry modules",
            }),
        }
    }
}

/// Last path segment of a source string, without query
pub fn file_name(source: &str) -> String {
    let without_query = source.split('?').next().unwrap_or(source);
    without_query
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}

#[derive(thiserror::Error, Debug)]
pub enum GetError {
    #[error("fetching {reason} is not supported (`{location}`)")]
    Unsupported {
        location: String,
        reason: &'static str,
    },
    #[error("source {} does not exist", .path.display())]
    NotFound { path: PathBuf },
    #[error("{}: unable to copy source", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[cfg(test)]
pub(crate) mod fake {
    //! getter that writes a placeholder file instead of fetching
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingGetter {
        pub requests: Mutex<Vec<(String, PathBuf)>>,
    }

    impl SourceGetter for RecordingGetter {
        fn get(
            &self,
            source: &str,
            destination: &Path,
            _version: Option<&str>,
        ) -> Result<(), GetError> {
            self.requests
                .lock()
                .unwrap()
                .push((source.to_string(), destination.to_path_buf()));
            std::fs::create_dir_all(destination).unwrap();
            std::fs::write(destination.join(file_name(source)), "#!/bin/sh\n").unwrap();
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::RecordingExecutor;
    use pretty_assertions::assert_eq;

    #[test]
    fn detection() {
        assert_eq!(
            SourceKind::detect("../modules/network").unwrap(),
            SourceKind::Local("../modules/network".into())
        );
        assert_eq!(
            SourceKind::detect("git::https://example.com/infra.git?ref=v1.2.0").unwrap(),
            SourceKind::Git {
                url: "https://example.com/infra.git".into(),
                reference: Some("v1.2.0".into())
            }
        );
        assert_eq!(
            SourceKind::detect("https://example.com/scripts/lint.sh").unwrap(),
            SourceKind::Http("https://example.com/scripts/lint.sh".into())
        );
        assert_eq!(
            SourceKind::detect("hashicorp/consul/aws").unwrap(),
            SourceKind::Registry("hashicorp/consul/aws".into())
        );
        assert_eq!(
            SourceKind::detect("modules/network").unwrap(),
            SourceKind::Local("modules/network".into())
        );
    }

    #[test]
    fn unsupported_sources() {
        assert!(matches!(
            SourceKind::detect("git::https://example.com/infra.git//modules/vpc"),
            Err(GetError::Unsupported { .. })
        ));
        assert!(matches!(
            SourceKind::detect("s3::https://bucket/module.zip"),
            Err(GetError::Unsupported { .. })
        ));
    }

    #[test]
    fn file_names() {
        assert_eq!(file_name("https://example.com/a/lint.sh?x=1"), "lint.sh");
        assert_eq!(file_name("/scripts/check.sh"), "check.sh");
    }

    #[test]
    fn copies_local_directory() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("main.tf"), "# module").unwrap();
        std::fs::create_dir(source.path().join(".git")).unwrap();
        let destination = tempfile::tempdir().unwrap();

        let getter = Getter::new(Arc::new(RecordingExecutor::succeeding()), Duration::from_secs(1));
        getter
            .get(
                &source.path().display().to_string(),
                &destination.path().join("module"),
                None,
            )
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(destination.path().join("module/main.tf")).unwrap(),
            "# module"
        );
        assert!(!destination.path().join("module/.git").exists());
    }

    #[test]
    fn missing_local_source() {
        let destination = tempfile::tempdir().unwrap();
        let getter = Getter::new(Arc::new(RecordingExecutor::succeeding()), Duration::from_secs(1));
        assert!(matches!(
            getter.get("/does/not/exist", destination.path(), None),
            Err(GetError::NotFound { .. })
        ));
    }

    #[test]
    fn git_clone_uses_version() {
        let destination = tempfile::tempdir().unwrap();
        let executor = Arc::new(RecordingExecutor::succeeding());
        let getter = Getter::new(executor.clone(), Duration::from_secs(1));

        // the fake clone creates nothing
        let result = getter.get(
            "git::https://example.com/infra.git",
            destination.path(),
            Some("v2"),
        );
        assert!(matches!(result, Err(GetError::NotFound { .. })));

        let checkout = destination.path().join(CLONE_DIR);
        assert_eq!(
            executor.lines(),
            vec![format!(
                "git clone --depth 1 --branch v2 https://example.com/infra.git {}",
                checkout.display()
            )]
        );
    }

    #[test]
    fn download_with_curl() {
        let destination = tempfile::tempdir().unwrap();
        let executor = Arc::new(RecordingExecutor::succeeding());
        let getter = Getter::new(executor.clone(), Duration::from_secs(1));

        getter
            .get("https://example.com/lint.sh", destination.path(), None)
            .unwrap();

        assert_eq!(
            executor.lines(),
            vec![format!(
                "curl -fsSL -o {} https://example.com/lint.sh",
                destination.path().join("lint.sh").display()
            )]
        );
        assert_eq!(
            executor.invocations.lock().unwrap()[0].working_dir,
            None
        );
    }

    #[test]
    fn registry_rejected() {
        let destination = tempfile::tempdir().unwrap();
        let getter = Getter::new(Arc::new(RecordingExecutor::succeeding()), Duration::from_secs(1));
        assert!(matches!(
            getter.get("hashicorp/consul/aws", destination.path(), None),
            Err(GetError::Unsupported { .. })
        ));
    }
}
