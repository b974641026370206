//! checks on merged descriptors
use super::Descriptor;
use crate::hooks::Trigger;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

static ENVIRONMENT_VARIABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("environment variable name pattern is valid")
});

impl Descriptor {
    /// Check a merged descriptor
    ///
    /// Partial descriptors (auto imports) are not expected to pass on their own.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let path = || self.path.clone();

        if self
            .module
            .as_ref()
            .and_then(|module| module.source.as_deref())
            .map_or(true, str::is_empty)
        {
            return Err(ValidationError::ModuleRequired { path: path() });
        }

        for dependency in &self.dependencies {
            if dependency.source.as_deref().map_or(true, str::is_empty) {
                return Err(ValidationError::DependencySourceRequired {
                    path: path(),
                    name: dependency.name.clone(),
                });
            }
        }

        for name in self.environment_variables.iter().flat_map(|env| env.keys()) {
            if !ENVIRONMENT_VARIABLE_NAME.is_match(name) {
                return Err(ValidationError::EnvironmentVariableInvalidName {
                    path: path(),
                    name: name.clone(),
                });
            }
        }

        for hook in &self.hooks {
            match (&hook.command, &hook.script) {
                (None, None) => {
                    return Err(ValidationError::HookCommandOrScriptRequired {
                        path: path(),
                        hook: hook.hook_type.clone(),
                    })
                }
                (Some(_), Some(_)) => {
                    return Err(ValidationError::HookCommandAndScriptBothDefined {
                        path: path(),
                        hook: hook.hook_type.clone(),
                    })
                }
                _ => {}
            }

            let trigger = hook.trigger.clone().unwrap_or_default();
            if trigger.parse::<Trigger>().is_err() {
                return Err(ValidationError::HookTriggerInvalid {
                    path: path(),
                    hook: hook.hook_type.clone(),
                    trigger,
                });
            }
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{}: a module block with a source is required", .path.display())]
    ModuleRequired { path: PathBuf },
    #[error("{}: dependency `{name}` requires a source", .path.display())]
    DependencySourceRequired { path: PathBuf, name: String },
    #[error("{}: `{name}` is not a valid environment variable name", .path.display())]
    EnvironmentVariableInvalidName { path: PathBuf, name: String },
    #[error("{}: hook `{hook}` requires a command or a script", .path.display())]
    HookCommandOrScriptRequired { path: PathBuf, hook: String },
    #[error("{}: hook `{hook}` defines both a command and a script", .path.display())]
    HookCommandAndScriptBothDefined { path: PathBuf, hook: String },
    #[error("{}: hook `{hook}` has an invalid trigger `{trigger}`", .path.display())]
    HookTriggerInvalid {
        path: PathBuf,
        hook: String,
        trigger: String,
    },
}
