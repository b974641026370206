//! provisioner input generated for a unit
//!
//! Only what `inputs` actually references gets generated:
//!
//! 1. [extract_traversals] lists the `dependency.*` and `data.*` references
//! 2. every dependency becomes a remote state lookup with one output per reference into it,
//!    the data blocks of the unit become one artifact with one output per `data.*` reference
//! 3. each artifact runs in a scratch directory (`init`, `apply`, `output -json`) and the outputs
//!    are folded into a [ValueTree]
//! 4. `inputs` is evaluated with `dependency` and `data` taken from that tree
//!
//! A dependency that was never deployed makes the unit unresolvable, not the run fail.
mod artifact;
pub mod output;

pub use output::OutputError;

use crate::context::{self, FileContext};
use crate::descriptor::{Attributes, Backend, DataBlock};
use crate::exec::{ExecError, ExecOptions, ProcessExecutor};
use crate::loader::{Unit, UnitId, Units};
use crate::provisioner::{self, Provisioner};
use crate::traversal::{extract_traversals, Root, TraversalRef};
use crate::tree::{TreeError, ValueTree};
use crate::value::Value;
use hcl::Body;
use indexmap::IndexMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

/// Written into the unit's working directory next to the module
pub const OVERRIDE_FILE: &str = "tfstack_backend_override.tf";
pub const VARIABLES_FILE: &str = "terraform.tfvars";
const ARTIFACT_FILE: &str = "main.tf";

/// Diagnostics of lookups into something not deployed yet
const TOLERATED: [&str; 4] = [
    "no remote state found",
    "unable to find remote state",
    "unsupported attribute",
    "no stored state was found",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactKind {
    Dependency { name: String, unit: UnitId },
    Data,
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Dependency { name, .. } => write!(f, "dependency `{name}`"),
            ArtifactKind::Data => write!(f, "data sources"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactContent {
    Body(Body),
    /// Known to be unresolvable without running anything
    Unresolvable(String),
}

/// Configuration run to obtain dependency or data values
#[derive(Debug, Clone)]
pub struct DependencyArtifact {
    pub kind: ArtifactKind,
    /// Scratch directory
    pub directory: PathBuf,
    pub content: ArtifactContent,
    /// References answered by the outputs of this artifact
    pub outputs: Vec<TraversalRef>,
    pub environment: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Realized {
    Values(ValueTree),
    Unresolved(String),
}

/// Values for the references of a unit
#[derive(Debug, Default)]
pub struct Resolution {
    pub values: ValueTree,
    /// Why a dependency or data lookup could not be resolved
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

pub struct Generator {
    executor: Arc<dyn ProcessExecutor>,
    provisioner: Provisioner,
    binary: String,
    provider_versions: IndexMap<String, String>,
}

impl Generator {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        provisioner: Provisioner,
        binary: impl Into<String>,
        provider_versions: IndexMap<String, String>,
    ) -> Self {
        Self {
            executor,
            provisioner,
            binary: binary.into(),
            provider_versions,
        }
    }

    /// Backend override for the unit's module, `None` without a backend block
    pub fn generate_overrides(&self, unit: &Unit) -> Result<Option<String>, GenerateError> {
        let Some(backend) = &unit.descriptor.backend else {
            return Ok(None);
        };

        let attributes = evaluate_attributes(&unit.file_context(), &backend.attributes)
            .map_err(|(name, message)| GenerateError::Evaluation {
                path: unit.path.clone(),
                name: format!("backend.{name}"),
                message,
            })?;

        let body = artifact::backend_override(&backend.backend_type, attributes);
        let rendered = hcl::to_string(&body).map_err(|source| GenerateError::Render {
            path: unit.path.clone(),
            source,
        })?;
        tracing::debug!(unit=%unit.path.display(), %rendered, "generated backend override");
        Ok(Some(rendered))
    }

    /// Artifacts answering `traversals`
    ///
    /// One per declared dependency and one for the data blocks when the unit has any.
    pub fn generate_dependency_artifacts(
        &self,
        units: &Units,
        unit: &Unit,
        traversals: &[TraversalRef],
    ) -> Result<Vec<DependencyArtifact>, GenerateError> {
        let mut by_dependency: IndexMap<&str, Vec<TraversalRef>> = IndexMap::new();
        let mut data_references = vec![];

        for reference in traversals {
            match reference.root() {
                Some(Root::Dependency { name }) => {
                    if !unit.dependencies.contains_key(name) {
                        return Err(GenerateError::UnknownDependency {
                            path: unit.path.clone(),
                            name: name.to_string(),
                        });
                    }
                    by_dependency
                        .entry(name)
                        .or_default()
                        .push(reference.clone());
                }
                Some(Root::Data { data_type, name }) => {
                    if !unit
                        .descriptor
                        .data
                        .iter()
                        .any(|data| data.key() == (data_type, name))
                    {
                        return Err(GenerateError::UnknownData {
                            path: unit.path.clone(),
                            data: format!("{data_type}.{name}"),
                        });
                    }
                    data_references.push(reference.clone());
                }
                None => {}
            }
        }

        let mut artifacts = vec![];

        if !unit.descriptor.data.is_empty() {
            let body = artifact::data_sources(
                self.provisioner.compatibility_shim(&self.providers(unit)),
                &evaluate_data_blocks(unit)?,
                &data_references,
            );
            artifacts.push(DependencyArtifact {
                kind: ArtifactKind::Data,
                directory: unit.working_dir.join("data"),
                content: ArtifactContent::Body(body),
                outputs: data_references,
                environment: unit.environment(),
            });
        }

        for (name, id) in &unit.dependencies {
            let dependency = &units[*id];
            let references = by_dependency.shift_remove(name.as_str()).unwrap_or_default();

            let separate = unit
                .descriptor
                .dependency(name)
                .and_then(|declared| declared.separate_environment)
                .unwrap_or(false);
            let environment = if separate {
                dependency.environment()
            } else {
                let mut environment = unit.environment();
                environment.extend(dependency.environment());
                environment
            };

            let content = match self.remote_state_config(unit, name, dependency)? {
                Some((backend_type, config)) => ArtifactContent::Body(artifact::remote_state(
                    name,
                    &backend_type,
                    config,
                    &references,
                )),
                None => ArtifactContent::Unresolvable(format!(
                    "{} has no backend",
                    dependency.path.display()
                )),
            };

            artifacts.push(DependencyArtifact {
                kind: ArtifactKind::Dependency {
                    name: name.clone(),
                    unit: *id,
                },
                directory: unit.working_dir.join("dependencies").join(name),
                content,
                outputs: references,
                environment,
            });
        }

        Ok(artifacts)
    }

    /// Backend of the dependency merged with the override of the `dependency` block
    ///
    /// Each part is evaluated in the file it was written in.
    fn remote_state_config(
        &self,
        unit: &Unit,
        name: &str,
        dependency: &Unit,
    ) -> Result<Option<(String, Value)>, GenerateError> {
        let evaluate = |backend: &Backend, owner: &Unit, label: String| {
            evaluate_attributes(&owner.file_context(), &backend.attributes)
                .map(Value::from)
                .map_err(|(key, message)| GenerateError::Evaluation {
                    path: owner.path.clone(),
                    name: format!("{label}.{key}"),
                    message,
                })
        };

        let base = dependency.descriptor.backend.as_ref();
        let overlay = unit
            .descriptor
            .dependency(name)
            .and_then(|declared| declared.backend.as_ref());

        let config = match (base, overlay) {
            (None, None) => return Ok(None),
            (Some(base), None) => (
                base.backend_type.clone(),
                evaluate(base, dependency, "backend".to_string())?,
            ),
            (None, Some(overlay)) => (
                overlay.backend_type.clone(),
                evaluate(overlay, unit, format!("dependency.{name}.backend"))?,
            ),
            (Some(base), Some(overlay)) => {
                let overlay_value = evaluate(overlay, unit, format!("dependency.{name}.backend"))?;
                if base.backend_type == overlay.backend_type {
                    let mut merged = evaluate(base, dependency, "backend".to_string())?;
                    merged.merge(overlay_value);
                    (base.backend_type.clone(), merged)
                } else {
                    tracing::debug!(unit=%unit.path.display(), dependency=%name, "backend override replaces backend of different type");
                    (overlay.backend_type.clone(), overlay_value)
                }
            }
        };

        Ok(Some(config))
    }

    /// Providers of the unit's data sources with their configured version constraints
    fn providers(&self, unit: &Unit) -> IndexMap<String, Option<String>> {
        unit.descriptor
            .data
            .iter()
            .map(|data| provisioner::provider_of(&data.data_type))
            .filter(|provider| *provider != "terraform")
            .map(|provider| {
                (
                    provider.to_string(),
                    self.provider_versions.get(provider).cloned(),
                )
            })
            .collect()
    }

    /// Run an artifact and collect its outputs
    #[tracing::instrument(level = "debug", skip_all, fields(artifact = %artifact.kind))]
    pub fn realize(&self, artifact: &DependencyArtifact) -> Result<Realized, GenerateError> {
        if artifact.outputs.is_empty() {
            tracing::debug!("nothing referenced, not running");
            return Ok(Realized::Values(ValueTree::new()));
        }

        let body = match &artifact.content {
            ArtifactContent::Body(body) => body,
            ArtifactContent::Unresolvable(reason) => {
                return Ok(Realized::Unresolved(reason.clone()))
            }
        };

        let rendered = hcl::to_string(body).map_err(|source| GenerateError::Render {
            path: artifact.directory.clone(),
            source,
        })?;
        std::fs::create_dir_all(&artifact.directory)
            .and_then(|()| std::fs::write(artifact.directory.join(ARTIFACT_FILE), &rendered))
            .map_err(|source| GenerateError::Io {
                path: artifact.directory.clone(),
                source,
            })?;
        tracing::debug!(directory=%artifact.directory.display(), %rendered, "wrote artifact");

        for args in [self.provisioner.init_args(), self.provisioner.apply_args()] {
            if let Err(error) = self.run(artifact, &args, None) {
                return self.tolerate(artifact, error);
            }
        }

        let mut json = String::new();
        let mut on_stdout = |line: &str| {
            json.push_str(line);
            json.push('\n');
        };
        if let Err(error) = self.run(artifact, &self.provisioner.output_args(), Some(&mut on_stdout)) {
            return self.tolerate(artifact, error);
        }

        let values = output::parse_outputs(&json).map_err(|source| GenerateError::Output {
            artifact: artifact.kind.to_string(),
            source,
        })?;
        Ok(Realized::Values(values))
    }

    fn run<'a>(
        &self,
        artifact: &'a DependencyArtifact,
        args: &[String],
        stdout: Option<crate::exec::LineProcessor<'a>>,
    ) -> Result<(), ExecError> {
        self.executor.execute(
            ExecOptions {
                working_dir: Some(&artifact.directory),
                env: artifact.environment.clone(),
                stdout,
                ..Default::default()
            },
            &self.binary,
            args,
        )
    }

    /// Failures of lookups into undeployed dependencies are expected
    fn tolerate(
        &self,
        artifact: &DependencyArtifact,
        error: ExecError,
    ) -> Result<Realized, GenerateError> {
        let diagnostics = error.stderr().unwrap_or_default().to_lowercase();
        if let Some(phrase) = TOLERATED.iter().find(|phrase| diagnostics.contains(*phrase)) {
            tracing::warn!(artifact=%artifact.kind, %phrase, "could not resolve");
            return Ok(Realized::Unresolved(format!("{}: {phrase}", artifact.kind)));
        }

        Err(GenerateError::Exec {
            artifact: artifact.kind.to_string(),
            source: error,
        })
    }

    /// Values for every dependency and data reference of the unit's inputs
    #[tracing::instrument(level = "debug", skip_all, fields(unit = %unit.path.display()))]
    pub fn resolve(&self, units: &Units, unit: &Unit) -> Result<Resolution, GenerateError> {
        let traversals = unit
            .descriptor
            .inputs
            .as_ref()
            .map(extract_traversals)
            .unwrap_or_default();

        let mut resolution = Resolution::default();
        for artifact in self.generate_dependency_artifacts(units, unit, &traversals)? {
            match self.realize(&artifact)? {
                Realized::Values(values) => resolution
                    .values
                    .extend(values)
                    .map_err(|source| GenerateError::Tree {
                        path: unit.path.clone(),
                        source,
                    })?,
                Realized::Unresolved(reason) => {
                    tracing::warn!(unit=%unit.path.display(), artifact=%artifact.kind, %reason, "could not fully resolve");
                    resolution.unresolved.push(reason);
                }
            }
        }

        Ok(resolution)
    }

    /// `inputs` evaluated against the resolved values, one attribute per input
    pub fn generate_variables(
        &self,
        unit: &Unit,
        values: &ValueTree,
    ) -> Result<String, GenerateError> {
        let Some(inputs) = &unit.descriptor.inputs else {
            return Ok(String::new());
        };

        let mut ctx = unit.file_context().eval_context();
        for (root, value) in values.roots() {
            ctx.declare_var(hcl::Identifier::unchecked(root), hcl::Value::from(value));
        }

        let evaluated = inputs
            .iter()
            .map(|(name, expr)| {
                context::evaluate(expr, &ctx)
                    .map(|value| (name.clone(), Value::from(value)))
                    .map_err(|message| GenerateError::Evaluation {
                        path: unit.path.clone(),
                        name: format!("inputs.{name}"),
                        message,
                    })
            })
            .collect::<Result<IndexMap<_, _>, _>>()?;

        let rendered =
            hcl::to_string(&artifact::variables(evaluated)).map_err(|source| {
                GenerateError::Render {
                    path: unit.path.clone(),
                    source,
                }
            })?;
        tracing::debug!(unit=%unit.path.display(), %rendered, "generated variables");
        Ok(rendered)
    }
}

/// Evaluate attributes to values, the error names the failing attribute
fn evaluate_attributes(
    file: &FileContext,
    attributes: &Attributes,
) -> Result<IndexMap<String, Value>, (String, String)> {
    let ctx = file.eval_context();
    attributes
        .iter()
        .map(|(key, expr)| {
            context::evaluate(expr, &ctx)
                .map(|value| (key.clone(), Value::from(value)))
                .map_err(|message| (key.clone(), message))
        })
        .collect()
}

/// Data blocks of the unit with their attributes evaluated in the unit's file
///
/// Attributes referring to data sources stay as written, the provisioner resolves those
/// inside the artifact.
fn evaluate_data_blocks(unit: &Unit) -> Result<Vec<DataBlock>, GenerateError> {
    let ctx = unit.file_context().eval_context();
    unit.descriptor
        .data
        .iter()
        .map(|block| {
            let body = evaluate_body(&block.body, &ctx).map_err(|(key, message)| {
                GenerateError::Evaluation {
                    path: unit.path.clone(),
                    name: format!("data.{}.{}.{key}", block.data_type, block.name),
                    message,
                }
            })?;
            Ok(DataBlock {
                body,
                ..block.clone()
            })
        })
        .collect()
}

fn evaluate_body(body: &Body, ctx: &hcl::eval::Context) -> Result<Body, (String, String)> {
    body.clone()
        .into_iter()
        .try_fold(Body::builder(), |builder, structure| -> Result<_, (String, String)> {
            let structure = match structure {
                hcl::Structure::Attribute(attribute) if refers_to_data(&attribute) => {
                    hcl::Structure::Attribute(attribute)
                }
                hcl::Structure::Attribute(attribute) => {
                    let value = context::evaluate(&attribute.expr, ctx)
                        .map_err(|message| (attribute.key.to_string(), message))?;
                    hcl::Structure::Attribute(hcl::Attribute::new(
                        attribute.key,
                        hcl::Expression::from(Value::from(value)),
                    ))
                }
                hcl::Structure::Block(block) => {
                    let body = evaluate_body(&block.body, ctx).map_err(|(key, message)| {
                        (format!("{}.{key}", block.identifier), message)
                    })?;
                    hcl::Structure::Block(hcl::Block { body, ..block })
                }
            };
            Ok(builder.add_structure(structure))
        })
        .map(|builder| builder.build())
}

fn refers_to_data(attribute: &hcl::Attribute) -> bool {
    let attributes = Attributes::from([(attribute.key.to_string(), attribute.expr.clone())]);
    extract_traversals(&attributes)
        .iter()
        .any(|reference| matches!(reference.root(), Some(Root::Data { .. })))
}

#[derive(thiserror::Error, Debug)]
pub enum GenerateError {
    #[error("{}: `inputs` references undeclared dependency `{name}`", .path.display())]
    UnknownDependency { path: PathBuf, name: String },
    #[error("{}: `inputs` references undeclared data source `{data}`", .path.display())]
    UnknownData { path: PathBuf, data: String },
    #[error("{}: unable to evaluate `{name}`: {message}", .path.display())]
    Evaluation {
        path: PathBuf,
        name: String,
        message: String,
    },
    #[error("{}: unable to render generated configuration", .path.display())]
    Render {
        path: PathBuf,
        #[source]
        source: hcl::Error,
    },
    #[error("{}: unable to write generated configuration", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to look up {artifact}")]
    Exec {
        artifact: String,
        #[source]
        source: ExecError,
    },
    #[error("unable to read the outputs of {artifact}")]
    Output {
        artifact: String,
        #[source]
        source: OutputError,
    },
    #[error("{}: conflicting resolved values", .path.display())]
    Tree {
        path: PathBuf,
        #[source]
        source: TreeError,
    },
}
