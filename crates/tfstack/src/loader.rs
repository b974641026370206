//! loading descriptors and resolving their dependencies
//!
//! Every descriptor file becomes one [Unit]. Units live in an arena ([Units]) and refer to their
//! dependencies by [UnitId], loading the same file twice yields the same unit.
//!
//! Loading runs in rounds: round 0 loads the path arguments, every following round loads the
//! dependencies of the units added in the previous round. Units still waiting for their
//! dependencies after `max_depth` rounds fail the whole load.
use crate::auto_import::{AutoImportError, AutoImports};
use crate::context::{self, FileContext};
use crate::descriptor::{Descriptor, MergeError, ParseError, ValidationError};
use crate::files::{FileMatcher, FindError, Recursion};
use crate::util;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::ops::Index;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Stable index of a [Unit] in [Units]
pub type UnitId = usize;

/// A loaded descriptor with its resolved dependencies
#[derive(Debug)]
pub struct Unit {
    pub id: UnitId,
    /// Absolute path of the primary descriptor file
    pub path: PathBuf,
    pub descriptor: Descriptor,
    /// Where the module is prepared and the provisioner runs
    pub working_dir: PathBuf,
    /// dependency name -> unit
    pub dependencies: IndexMap<String, UnitId>,
    environment: RwLock<IndexMap<String, String>>,
}

impl Unit {
    /// File name without extension
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn directory(&self) -> &Path {
        self.descriptor.directory()
    }

    pub fn file_context(&self) -> FileContext {
        FileContext::new(self.path.clone())
    }

    /// Snapshot of the environment variables
    pub fn environment(&self) -> IndexMap<String, String> {
        self.environment
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Add or replace environment variables
    pub fn extend_environment(&self, variables: impl IntoIterator<Item = (String, String)>) {
        let mut environment = self
            .environment
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (key, value) in variables {
            tracing::debug!(unit=%self.path.display(), %key, "setting environment variable");
            environment.insert(key, value);
        }
    }
}

/// Arena of loaded units
#[derive(Debug, Default)]
pub struct Units {
    units: Vec<Unit>,
    by_path: HashMap<PathBuf, UnitId>,
    roots: Vec<UnitId>,
}

impl Units {
    pub fn get(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn by_path(&self, path: &Path) -> Option<&Unit> {
        self.by_path.get(path).map(|id| &self.units[*id])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units requested by path arguments (not only loaded as a dependency)
    pub fn roots(&self) -> impl Iterator<Item = &Unit> {
        self.roots.iter().map(|id| &self.units[*id])
    }

    /// The unit a named dependency of `unit` resolved to
    pub fn dependency(&self, unit: &Unit, name: &str) -> Option<&Unit> {
        unit.dependencies.get(name).map(|id| &self.units[*id])
    }

    fn insert(&mut self, unit: Unit) -> UnitId {
        let id = self.units.len();
        self.by_path.insert(unit.path.clone(), id);
        self.units.push(Unit { id, ..unit });
        id
    }
}

#[cfg(test)]
impl Units {
    /// Units named `/work/<name>.hcl` with dependencies by name, without touching the filesystem
    pub(crate) fn fake(units: &[(&str, &[&str])]) -> Units {
        let mut arena = Units::default();
        for (name, _) in units {
            let path = PathBuf::from(format!("/work/{name}.hcl"));
            let id = arena.insert(Unit {
                id: 0,
                path: path.clone(),
                descriptor: Descriptor {
                    path,
                    ..Default::default()
                },
                working_dir: PathBuf::from(format!("/work/.tfstack/{name}")),
                dependencies: IndexMap::new(),
                environment: RwLock::default(),
            });
            arena.roots.push(id);
        }

        for (id, (_, dependencies)) in units.iter().enumerate() {
            for dependency in *dependencies {
                let target = units
                    .iter()
                    .position(|(name, _)| name == dependency)
                    .expect("dependency must be declared");
                arena.units[id]
                    .dependencies
                    .insert(dependency.to_string(), target);
            }
        }

        arena
    }

    /// Units from already parsed descriptors, dependency sources are matched against the
    /// descriptor paths (`../network.hcl`)
    pub(crate) fn from_descriptors(descriptors: Vec<Descriptor>) -> Units {
        let mut arena = Units::default();
        for descriptor in descriptors {
            let file = FileContext::new(descriptor.path.clone());
            let environment = evaluate_environment(&descriptor, &file).unwrap();
            let id = arena.insert(Unit {
                id: 0,
                path: descriptor.path.clone(),
                working_dir: file.directory().join(".tfstack").join(file.name()),
                descriptor,
                dependencies: IndexMap::new(),
                environment: RwLock::new(environment),
            });
            arena.roots.push(id);
        }

        for id in 0..arena.len() {
            let directory = arena[id].directory().to_path_buf();
            let resolved: Vec<(String, UnitId)> = arena[id]
                .descriptor
                .dependencies
                .iter()
                .map(|dependency| {
                    let source = dependency.source.as_deref().unwrap_or_default();
                    let target = util::resolve_relative(&directory, source);
                    let target = arena.by_path[&target];
                    (dependency.name.clone(), target)
                })
                .collect();
            arena.units[id].dependencies.extend(resolved);
        }

        arena
    }
}

impl Index<UnitId> for Units {
    type Output = Unit;

    fn index(&self, id: UnitId) -> &Self::Output {
        &self.units[id]
    }
}

pub struct Loader {
    matcher: FileMatcher,
    auto_imports: AutoImports,
    working_dir_name: String,
}

impl Loader {
    pub fn new(matcher: FileMatcher, working_dir_name: impl Into<String>) -> Self {
        Self {
            auto_imports: AutoImports::new(matcher.clone()),
            matcher,
            working_dir_name: working_dir_name.into(),
        }
    }

    /// Load all descriptors found for `paths` and everything they depend on
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn load(&self, paths: &[PathBuf], max_depth: usize) -> Result<Units, LoadError> {
        let current_dir = std::env::current_dir().map_err(|source| LoadError::Io {
            path: PathBuf::from("."),
            source,
        })?;

        let mut units = Units::default();

        for path in paths {
            let absolute = util::normalize_path(&current_dir.join(path));
            let files = self.matcher.find(&absolute, Recursion::Recursive)?;
            if files.is_empty() {
                return Err(LoadError::NoDescriptors { path: absolute });
            }

            for file in files {
                let id = self.load_unit(&mut units, &file)?;
                if !units.roots.contains(&id) {
                    units.roots.push(id);
                }
            }
        }

        let mut resolved = 0;
        for depth in 0..max_depth {
            let pending = resolved..units.len();
            if pending.is_empty() {
                break;
            }
            tracing::debug!(depth, count = pending.len(), "resolving dependencies");
            resolved = pending.end;

            for id in pending {
                self.resolve_dependencies(&mut units, id)?;
            }
        }

        if let Some(unresolved) = units.units[resolved..]
            .iter()
            .find(|unit| !unit.descriptor.dependencies.is_empty())
        {
            return Err(LoadError::MaxDependencyDepthExceeded {
                path: unresolved.path.clone(),
                max_depth,
            });
        }

        tracing::info!(count = units.len(), "loaded units");
        Ok(units)
    }

    fn resolve_dependencies(&self, units: &mut Units, id: UnitId) -> Result<(), LoadError> {
        let directory = units[id].directory().to_path_buf();
        let declared: Vec<(String, String)> = units[id]
            .descriptor
            .dependencies
            .iter()
            .map(|dependency| {
                (
                    dependency.name.clone(),
                    dependency.source.clone().unwrap_or_default(),
                )
            })
            .collect();

        for (name, source) in declared {
            let target = util::resolve_relative(&directory, &source);
            let files = match self.matcher.find(&target, Recursion::Flat) {
                Err(FindError::Io { .. }) => vec![],
                found => found?,
            };

            let [file] = files.as_slice() else {
                return Err(LoadError::DependencySingleFile {
                    path: units[id].path.clone(),
                    name,
                    target: source,
                    found: files.len(),
                });
            };

            let dependency = self.load_unit(units, file)?;
            tracing::debug!(unit=%units[id].path.display(), %name, dependency=%units[dependency].path.display(), "resolved dependency");
            units.units[id].dependencies.insert(name, dependency);
        }

        Ok(())
    }

    /// Parse, merge and validate one file, reusing an already loaded unit
    fn load_unit(&self, units: &mut Units, file: &Path) -> Result<UnitId, LoadError> {
        let path = file.canonicalize().map_err(|source| LoadError::Io {
            path: file.to_path_buf(),
            source,
        })?;

        if let Some(id) = units.by_path.get(&path) {
            return Ok(*id);
        }

        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut partials: Vec<Descriptor> = self.auto_imports.find(&directory)?.to_vec();
        partials.push(Descriptor::load(&path)?);

        let descriptor = Descriptor::merge(partials)?;
        descriptor.validate()?;

        let file = FileContext::new(path.clone());
        let environment = evaluate_environment(&descriptor, &file)?;

        let working_dir = directory
            .join(&self.working_dir_name)
            .join(file.name());

        let id = units.insert(Unit {
            id: 0,
            path,
            descriptor,
            working_dir,
            dependencies: IndexMap::new(),
            environment: RwLock::new(environment),
        });

        Ok(id)
    }
}

/// Evaluate the `environment_variables` block in the context of its file
fn evaluate_environment(
    descriptor: &Descriptor,
    file: &FileContext,
) -> Result<IndexMap<String, String>, LoadError> {
    let Some(variables) = &descriptor.environment_variables else {
        return Ok(IndexMap::new());
    };

    let ctx = file.eval_context();
    variables
        .iter()
        .map(|(name, expr)| {
            let value = context::evaluate(expr, &ctx).map_err(|message| LoadError::Environment {
                path: descriptor.path.clone(),
                name: name.clone(),
                message,
            })?;

            let value = Value::from(value)
                .as_env_string()
                .ok_or_else(|| LoadError::Environment {
                    path: descriptor.path.clone(),
                    name: name.clone(),
                    message: "value must be a string, number or bool".to_string(),
                })?;

            Ok((name.clone(), value))
        })
        .collect()
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("{}: no descriptor files found", .path.display())]
    NoDescriptors { path: PathBuf },
    #[error("{}: dependency `{name}` (`{target}`) must resolve to exactly one file but found {found}", .path.display())]
    DependencySingleFile {
        path: PathBuf,
        name: String,
        target: String,
        found: usize,
    },
    #[error("{}: dependencies nested deeper than {max_depth} levels", .path.display())]
    MaxDependencyDepthExceeded { path: PathBuf, max_depth: usize },
    #[error("{}: unable to evaluate environment variable `{name}`: {message}", .path.display())]
    Environment {
        path: PathBuf,
        name: String,
        message: String,
    },
    #[error("{}: unable to access file", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Find(#[from] FindError),
    #[error(transparent)]
    AutoImport(#[from] AutoImportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unable to merge descriptors")]
    Merge(#[from] MergeError),
    #[error("invalid descriptor")]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn loader() -> Loader {
        Loader::new(FileMatcher::new("hcl"), ".tfstack")
    }

    fn unit_with_dependencies(dependencies: &[(&str, &str)]) -> String {
        let mut content = String::from("module { source = \"./module\" }\n");
        for (name, source) in dependencies {
            content.push_str(&format!("dependency \"{name}\" {{ source = \"{source}\" }}\n"));
        }
        content
    }

    #[test]
    fn loads_dependencies_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "core/main.hcl", &unit_with_dependencies(&[]));
        write(
            dir.path(),
            "network/main.hcl",
            &unit_with_dependencies(&[("core", "../core")]),
        );
        write(
            dir.path(),
            "app/main.hcl",
            &unit_with_dependencies(&[("core", "../core/main.hcl"), ("network", "../network")]),
        );

        let units = loader()
            .load(&[dir.path().join("app"), dir.path().join("network")], 10)
            .unwrap();

        assert_eq!(units.len(), 3);
        let app = units.roots().next().unwrap();
        let network = units.dependency(app, "network").unwrap();
        let core_from_app = units.dependency(app, "core").unwrap();
        let core_from_network = units.dependency(network, "core").unwrap();
        assert_eq!(core_from_app.id, core_from_network.id);
        assert_eq!(units.roots().count(), 2);
        assert_eq!(
            app.working_dir,
            app.directory().join(".tfstack").join("main")
        );
    }

    #[test]
    fn auto_imports_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "app/common_auto.hcl",
            r#"
            module { source = "./module" }
            environment_variables {
              NAME = source.name
              LEVEL = 3
            }
            "#,
        );
        write(dir.path(), "app/dev.hcl", r#"inputs { a = 1 }"#);

        let units = loader().load(&[dir.path().join("app")], 10).unwrap();
        let unit = &units[0];

        assert_eq!(unit.name(), "dev");
        assert!(unit.descriptor.module.is_some());
        assert_eq!(
            unit.environment(),
            IndexMap::from([
                ("NAME".to_string(), "dev".to_string()),
                ("LEVEL".to_string(), "3".to_string())
            ])
        );
    }

    #[test]
    fn dependency_must_be_a_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "many/one.hcl", &unit_with_dependencies(&[]));
        write(dir.path(), "many/two.hcl", &unit_with_dependencies(&[]));
        write(
            dir.path(),
            "app/main.hcl",
            &unit_with_dependencies(&[("many", "../many"), ("none", "../none/*.hcl")]),
        );

        let err = loader().load(&[dir.path().join("app")], 10).unwrap_err();
        assert!(matches!(
            err,
            LoadError::DependencySingleFile { ref name, found: 2, .. } if name == "many"
        ));

        write(
            dir.path(),
            "app/main.hcl",
            &unit_with_dependencies(&[("missing", "../missing")]),
        );
        let err = loader().load(&[dir.path().join("app")], 10).unwrap_err();
        assert!(matches!(
            err,
            LoadError::DependencySingleFile { found: 0, .. }
        ));
    }

    #[test]
    fn depth_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/main.hcl", &unit_with_dependencies(&[("b", "../b")]));
        write(dir.path(), "b/main.hcl", &unit_with_dependencies(&[("c", "../c")]));
        write(dir.path(), "c/main.hcl", &unit_with_dependencies(&[]));

        assert!(loader().load(&[dir.path().join("a")], 2).is_ok());
        assert!(matches!(
            loader().load(&[dir.path().join("a")], 1),
            Err(LoadError::MaxDependencyDepthExceeded { max_depth: 1, .. })
        ));
    }

    #[test]
    fn cycles_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/main.hcl", &unit_with_dependencies(&[("b", "../b")]));
        write(dir.path(), "b/main.hcl", &unit_with_dependencies(&[("a", "../a")]));

        let units = loader().load(&[dir.path().join("a")], 10).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units.dependency(&units[1], "a").unwrap().id, 0);
    }

    #[test]
    fn validation_failures_abort() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app/main.hcl", r#"inputs { a = 1 }"#);

        assert!(matches!(
            loader().load(&[dir.path().join("app")], 10),
            Err(LoadError::Validation(ValidationError::ModuleRequired { .. }))
        ));
    }
}
