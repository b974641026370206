//! running a provisioner command over a stack of units
use crate::config::{Config, ConfigError};
use crate::exec::{ExecError, ExecOptions, ProcessExecutor};
use crate::files::FileMatcher;
use crate::generate::{GenerateError, Generator, OVERRIDE_FILE, VARIABLES_FILE};
use crate::graph::{ExecutionGraph, GraphError};
use crate::hooks::{Event, HookError, HookRuntime};
use crate::loader::{LoadError, Loader, Unit, UnitId, Units};
use crate::provisioner::{Provisioner, ProvisionerError};
use crate::source::{GetError, SourceGetter};
use crate::util;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Receives provisioner output lines as `(unit name, line)`
pub type OutputSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Command that runs in teardown order
const TEARDOWN_COMMAND: &str = "destroy";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn skipped(&self) -> impl Iterator<Item = &UnitReport> {
        self.units
            .iter()
            .filter(|unit| matches!(unit.outcome, Outcome::Skipped { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub path: PathBuf,
    pub name: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    Completed,
    Skipped { reason: String },
}

/// Generated variables of one unit, see [Runner::inputs]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Inputs {
    Resolved { variables: String },
    Unresolved { reasons: Vec<String> },
}

pub struct Runner {
    config: Config,
    executor: Arc<dyn ProcessExecutor>,
    getter: Arc<dyn SourceGetter>,
    output: OutputSink,
}

impl Runner {
    pub fn new(
        config: Config,
        executor: Arc<dyn ProcessExecutor>,
        getter: Arc<dyn SourceGetter>,
    ) -> Self {
        Self {
            config,
            executor,
            getter,
            output: Arc::new(|unit, line| println!("[{unit}] {line}")),
        }
    }

    pub fn with_output(self, output: OutputSink) -> Self {
        Self { output, ..self }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn load(&self, paths: &[PathBuf]) -> Result<Units, RunError> {
        let loader = Loader::new(
            FileMatcher::new(self.config.file_extension.as_str()),
            self.config.working_dir.as_str(),
        );
        Ok(loader.load(paths, self.config.max_depth)?)
    }

    fn generator(&self) -> Result<Generator, RunError> {
        let provisioner = Provisioner::detect(self.executor.as_ref(), &self.config.provisioner)?;
        Ok(Generator::new(
            self.executor.clone(),
            provisioner,
            self.config.provisioner.as_str(),
            self.config.provider_versions.clone(),
        ))
    }

    /// Run `command` for every unit found for `paths`, dependencies first
    /// (dependents first for `destroy`)
    pub fn run(
        &self,
        paths: &[PathBuf],
        command: &str,
        args: &[String],
    ) -> Result<RunReport, RunError> {
        let units = self.load(paths)?;
        let graph = ExecutionGraph::build(&units)?;
        let generator = self.generator()?;
        let hooks = HookRuntime::new(
            self.executor.clone(),
            self.getter.clone(),
            self.config.cache_dir_for(paths),
        );

        let reverse = command == TEARDOWN_COMMAND;
        let reports = Mutex::new(vec![]);
        let skipped = Mutex::new(HashSet::new());

        let visit = |unit: &Unit| -> Result<(), RunError> {
            let blockers: Vec<UnitId> = if reverse {
                graph.dependents(unit.id)
            } else {
                unit.dependencies.values().copied().collect()
            };

            let blocked_by = {
                let skipped = lock(&skipped);
                blockers.into_iter().find(|id| skipped.contains(id))
            };

            let outcome = match blocked_by {
                Some(blocker) => Outcome::Skipped {
                    reason: format!("{} was skipped", units[blocker].path.display()),
                },
                None => self.run_unit(&units, unit, &generator, &hooks, command, args)?,
            };

            if let Outcome::Skipped { reason } = &outcome {
                tracing::warn!(unit=%unit.path.display(), %reason, "skipping unit");
                lock(&skipped).insert(unit.id);
            }
            lock(&reports).push(UnitReport {
                path: unit.path.clone(),
                name: unit.name(),
                outcome,
            });
            Ok(())
        };

        graph.walk(reverse, visit)?;

        let report = RunReport {
            units: reports.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
        tracing::info!(
            units = report.units.len(),
            skipped = report.skipped().count(),
            command,
            "run finished"
        );
        Ok(report)
    }

    #[tracing::instrument(level = "info", skip_all, fields(unit = %unit.path.display(), %command))]
    fn run_unit(
        &self,
        units: &Units,
        unit: &Unit,
        generator: &Generator,
        hooks: &HookRuntime,
        command: &str,
        args: &[String],
    ) -> Result<Outcome, RunError> {
        self.prepare_module(unit)?;
        hooks.run_hooks(unit, Event::Prepare, command)?;

        if let Some(overrides) = generator.generate_overrides(unit)? {
            write(&unit.working_dir.join(OVERRIDE_FILE), &overrides)?;
        }

        let resolution = generator.resolve(units, unit)?;
        if !resolution.is_complete() {
            return Ok(Outcome::Skipped {
                reason: format!("could not resolve {}", resolution.unresolved.join(", ")),
            });
        }

        let variables = generator.generate_variables(unit, &resolution.values)?;
        write(&unit.working_dir.join(VARIABLES_FILE), &variables)?;

        tracing::info!("running provisioner");
        let name = unit.name();
        let mut on_stdout = |line: &str| (self.output)(&name, line);
        let mut on_stderr = |line: &str| (self.output)(&name, line);
        let command_line: Vec<String> = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect();

        self.executor
            .execute(
                ExecOptions {
                    working_dir: Some(&unit.working_dir),
                    env: unit.environment(),
                    stdout: Some(&mut on_stdout),
                    stderr: Some(&mut on_stderr),
                    timeout: None,
                },
                &self.config.provisioner,
                &command_line,
            )
            .map_err(|source| RunError::Provision {
                path: unit.path.clone(),
                source,
            })?;

        hooks.run_hooks(unit, Event::Finish, command)?;
        Ok(Outcome::Completed)
    }

    /// Create the working directory and copy the module into it
    fn prepare_module(&self, unit: &Unit) -> Result<(), RunError> {
        std::fs::create_dir_all(&unit.working_dir).map_err(|source| RunError::Io {
            path: unit.working_dir.clone(),
            source,
        })?;

        let Some(module) = &unit.descriptor.module else {
            return Ok(());
        };
        let source = module.source.as_deref().unwrap_or_default();
        let source = if source.starts_with('.') {
            util::resolve_relative(unit.directory(), source)
                .display()
                .to_string()
        } else {
            source.to_string()
        };

        tracing::debug!(%source, working_dir=%unit.working_dir.display(), "preparing module");
        self.getter
            .get(&source, &unit.working_dir, module.version.as_deref())
            .map_err(|err| RunError::Module {
                path: unit.path.clone(),
                source: err,
            })
    }

    /// Generated variables of every unit, resolving dependencies without running the
    /// provisioner command itself
    pub fn inputs(&self, paths: &[PathBuf]) -> Result<IndexMap<PathBuf, Inputs>, RunError> {
        let units = self.load(paths)?;
        let graph = ExecutionGraph::build(&units)?;
        let generator = self.generator()?;

        let mut inputs = IndexMap::new();
        for unit in graph.order() {
            let resolution = generator.resolve(&units, unit)?;
            let entry = if resolution.is_complete() {
                Inputs::Resolved {
                    variables: generator.generate_variables(unit, &resolution.values)?,
                }
            } else {
                Inputs::Unresolved {
                    reasons: resolution.unresolved,
                }
            };
            inputs.insert(unit.path.clone(), entry);
        }
        Ok(inputs)
    }
}

fn write(path: &Path, content: &str) -> Result<(), RunError> {
    tracing::debug!(path=%path.display(), "writing generated file");
    std::fs::write(path, content).map_err(|source| RunError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unable to load units")]
    Load(#[from] LoadError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("unable to determine the provisioner")]
    Provisioner(#[from] ProvisionerError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error("{}: unable to prepare module", .path.display())]
    Module {
        path: PathBuf,
        #[source]
        source: GetError,
    },
    #[error("{}: provisioner failed", .path.display())]
    Provision {
        path: PathBuf,
        #[source]
        source: ExecError,
    },
    #[error("{}: unable to write file", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::fake::{self, Invocation, RecordingExecutor};
    use crate::generate::output::encode_name;
    use crate::source::Getter;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn write_file(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// `network` <- `app` <- `web`, each with a local module
    fn stack(root: &Path) {
        for module in ["network", "app", "web"] {
            write_file(root, &format!("modules/{module}/main.tf"), "# module");
        }
        write_file(
            root,
            "network.hcl",
            r#"
            module { source = "./modules/network" }
            backend "local" {
              path = "${source.name}.tfstate"
            }
            "#,
        );
        write_file(
            root,
            "app.hcl",
            r#"
            module { source = "./modules/app" }
            dependency "network" {
              source = "./network.hcl"
            }
            inputs {
              vnet_id = dependency.network.outputs.vnet_id
            }
            "#,
        );
        write_file(
            root,
            "web.hcl",
            r#"
            module { source = "./modules/web" }
            dependency "app" {
              source = "./app.hcl"
            }
            "#,
        );
    }

    /// Replies like a deployed stack, `failing` lists working directory suffixes whose
    /// applies report missing state
    fn provisioner(failing: &'static [&'static str]) -> impl Fn(&Invocation) -> Result<Vec<String>, ExecError> {
        move |invocation: &Invocation| {
            let working_dir = invocation.working_dir.clone().unwrap_or_default();
            match invocation.args[0].as_str() {
                "version" => Ok(vec!["Terraform v1.5.7".to_string()]),
                "apply" if failing.iter().any(|suffix| working_dir.ends_with(suffix)) => {
                    Err(fake::failure("terraform", "Error: No stored state was found"))
                }
                "apply" => Ok(vec!["Apply complete!".to_string()]),
                "output" => {
                    let json = serde_json::json!({
                        encode_name("dependency.network.outputs.vnet_id"): {
                            "sensitive": false,
                            "type": "string",
                            "value": "vnet-1"
                        }
                    });
                    Ok(vec![json.to_string()])
                }
                _ => Ok(vec![]),
            }
        }
    }

    fn runner(executor: Arc<RecordingExecutor>) -> (Runner, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(vec![]));
        let sink = lines.clone();
        let runner = Runner::new(
            Config::default(),
            executor.clone(),
            Arc::new(Getter::new(executor, Duration::from_secs(5))),
        )
        .with_output(Arc::new(move |unit, line| {
            sink.lock().unwrap().push(format!("[{unit}] {line}"))
        }));
        (runner, lines)
    }

    fn outcomes(report: &RunReport) -> Vec<(String, Outcome)> {
        report
            .units
            .iter()
            .map(|unit| (unit.name.clone(), unit.outcome.clone()))
            .collect()
    }

    /// `(unit working dir name, line)` of every direct provisioner run of `command`
    fn provisioner_runs(executor: &RecordingExecutor, command: &str) -> Vec<(String, String)> {
        executor
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|invocation| invocation.args.first().map(String::as_str) == Some(command))
            .filter_map(|invocation| {
                let working_dir = invocation.working_dir.clone()?;
                // dependency artifacts live below the unit's working directory
                let parent = working_dir.parent()?.file_name()?.to_string_lossy().to_string();
                (parent == ".tfstack").then(|| {
                    (
                        working_dir.file_name().unwrap().to_string_lossy().to_string(),
                        invocation.line(),
                    )
                })
            })
            .collect()
    }

    #[test]
    fn applies_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        stack(dir.path());
        let executor = Arc::new(RecordingExecutor::new(provisioner(&[])));
        let (runner, lines) = runner(executor.clone());

        let report = runner
            .run(&[dir.path().to_path_buf()], "apply", &["-auto-approve".to_string()])
            .unwrap();

        assert_eq!(
            outcomes(&report),
            vec![
                ("network".to_string(), Outcome::Completed),
                ("app".to_string(), Outcome::Completed),
                ("web".to_string(), Outcome::Completed),
            ]
        );
        assert_eq!(
            provisioner_runs(&executor, "apply"),
            vec![
                ("network".to_string(), "terraform apply -auto-approve".to_string()),
                ("app".to_string(), "terraform apply -auto-approve".to_string()),
                ("web".to_string(), "terraform apply -auto-approve".to_string()),
            ]
        );
        assert_eq!(
            lines.lock().unwrap().clone(),
            vec![
                "[network] Apply complete!",
                "[app] Apply complete!",
                "[web] Apply complete!"
            ]
        );

        let working_dir = dir.path().join(".tfstack");
        assert!(working_dir.join("network/main.tf").is_file());
        let backend =
            std::fs::read_to_string(working_dir.join("network").join(OVERRIDE_FILE)).unwrap();
        assert!(backend.contains("network.tfstate"));
        let variables =
            std::fs::read_to_string(working_dir.join("app").join(VARIABLES_FILE)).unwrap();
        assert_eq!(variables.trim(), r#"vnet_id = "vnet-1""#);
    }

    #[test]
    fn unresolved_units_skip_their_dependents() {
        let dir = tempfile::tempdir().unwrap();
        stack(dir.path());
        let executor = Arc::new(RecordingExecutor::new(provisioner(&["dependencies/network"])));
        let (runner, _) = runner(executor.clone());

        let report = runner
            .run(&[dir.path().to_path_buf()], "plan", &[])
            .unwrap();

        assert_eq!(report.skipped().count(), 2);
        assert_eq!(report.units[0].outcome, Outcome::Completed);
        assert!(matches!(
            &report.units[1].outcome,
            Outcome::Skipped { reason } if reason.contains("no stored state was found")
        ));
        assert!(matches!(
            &report.units[2].outcome,
            Outcome::Skipped { reason } if reason.ends_with("app.hcl was skipped")
        ));
        assert_eq!(
            provisioner_runs(&executor, "plan"),
            vec![("network".to_string(), "terraform plan".to_string())]
        );
    }

    #[test]
    fn destroy_runs_dependents_first() {
        let dir = tempfile::tempdir().unwrap();
        stack(dir.path());
        let executor = Arc::new(RecordingExecutor::new(provisioner(&[])));
        let (runner, _) = runner(executor.clone());

        let report = runner
            .run(&[dir.path().to_path_buf()], "destroy", &[])
            .unwrap();

        assert_eq!(report.skipped().count(), 0);
        assert_eq!(
            provisioner_runs(&executor, "destroy"),
            vec![
                ("web".to_string(), "terraform destroy".to_string()),
                ("app".to_string(), "terraform destroy".to_string()),
                ("network".to_string(), "terraform destroy".to_string()),
            ]
        );
    }

    #[test]
    fn failing_provisioner_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        stack(dir.path());
        let executor = Arc::new(RecordingExecutor::new(|invocation| {
            match invocation.args[0].as_str() {
                "version" => Ok(vec!["Terraform v1.5.7".to_string()]),
                "validate" => Err(fake::failure("terraform", "Error: Invalid block")),
                _ => Ok(vec![]),
            }
        }));
        let (runner, _) = runner(executor.clone());

        let err = runner
            .run(&[dir.path().join("network.hcl")], "validate", &[])
            .unwrap_err();
        assert!(matches!(err, RunError::Provision { ref path, .. } if path.ends_with("network.hcl")));
    }

    #[test]
    fn failure_stops_independent_units() {
        let dir = tempfile::tempdir().unwrap();
        for unit in ["alpha", "beta"] {
            write_file(dir.path(), &format!("modules/{unit}/main.tf"), "# module");
            write_file(
                dir.path(),
                &format!("{unit}.hcl"),
                &format!(r#"module {{ source = "./modules/{unit}" }}"#),
            );
        }
        let executor = Arc::new(RecordingExecutor::new(|invocation| {
            match invocation.args[0].as_str() {
                "version" => Ok(vec!["Terraform v1.5.7".to_string()]),
                "apply" => Err(fake::failure("terraform", "Error: quota exceeded")),
                _ => Ok(vec![]),
            }
        }));
        let (runner, _) = runner(executor.clone());

        let err = runner
            .run(&[dir.path().to_path_buf()], "apply", &[])
            .unwrap_err();
        assert!(matches!(err, RunError::Provision { ref path, .. } if path.ends_with("alpha.hcl")));
        assert_eq!(
            provisioner_runs(&executor, "apply"),
            vec![("alpha".to_string(), "terraform apply".to_string())]
        );
    }

    #[test]
    fn hooks_run_around_the_provisioner() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "modules/solo/main.tf", "# module");
        write_file(
            dir.path(),
            "solo.hcl",
            r#"
            module { source = "./modules/solo" }
            hook "login" {
              trigger = "prepare"
              command = "login"
              set_env = true
            }
            hook "notify" {
              trigger = "finish:apply"
              command = "notify"
            }
            "#,
        );
        let executor = Arc::new(RecordingExecutor::new(|invocation| {
            match invocation.command.as_str() {
                "login" => Ok(vec!["TOKEN=secret".to_string()]),
                _ if invocation.args.first().map(String::as_str) == Some("version") => {
                    Ok(vec!["Terraform v1.5.7".to_string()])
                }
                _ => Ok(vec![]),
            }
        }));
        let (runner, _) = runner(executor.clone());

        runner
            .run(&[dir.path().to_path_buf()], "plan", &[])
            .unwrap();
        assert_eq!(
            executor.lines(),
            vec!["terraform version", "login", "terraform plan"]
        );
        let plan = executor.invocations.lock().unwrap()[2].clone();
        assert_eq!(plan.env.get("TOKEN").map(String::as_str), Some("secret"));

        runner
            .run(&[dir.path().to_path_buf()], "apply", &[])
            .unwrap();
        assert_eq!(
            executor.lines()[3..].to_vec(),
            vec!["terraform version", "login", "terraform apply", "notify"]
        );
    }

    #[test]
    fn inputs_without_running() {
        let dir = tempfile::tempdir().unwrap();
        stack(dir.path());
        let executor = Arc::new(RecordingExecutor::new(provisioner(&[])));
        let (runner, _) = runner(executor.clone());

        let inputs = runner.inputs(&[dir.path().join("app.hcl")]).unwrap();
        assert_eq!(
            inputs.keys().cloned().collect::<Vec<_>>(),
            vec![dir.path().join("network.hcl"), dir.path().join("app.hcl")]
        );
        assert!(matches!(
            &inputs[&dir.path().join("app.hcl")],
            Inputs::Resolved { variables } if variables.trim() == r#"vnet_id = "vnet-1""#
        ));
        assert!(provisioner_runs(&executor, "plan").is_empty());
        assert!(!dir.path().join(".tfstack/app").join(VARIABLES_FILE).exists());
    }
}
