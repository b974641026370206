//! user commands around the provisioner run of a unit
//!
//! ```hcl
//! hook "lint" {
//!   trigger = "prepare:plan,apply"
//!   command = "./scripts/lint.sh"
//!   set_env = true
//! }
//! ```
//!
//! Each distinct invocation (working directory, program, arguments) runs at most once per
//! [HookRuntime], later requests reuse the recorded result. `disable_cache` gives every request
//! its own cache entry.
mod trigger;

pub use trigger::{Event, Trigger, TriggerError};

use crate::descriptor::Hook;
use crate::exec::{ExecError, ExecOptions, ProcessExecutor};
use crate::loader::Unit;
use crate::source::{self, GetError, SourceGetter};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

static ENV_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:"([^"=\s]+)"|([^"=\s]+))\s*=\s*(?:"(.*)"|(.*?))\s*$"#)
        .expect("env line pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub enum HookState {
    Created,
    Running,
    Succeeded { output: Vec<String> },
    Failed { message: String },
}

pub struct HookRuntime {
    executor: Arc<dyn ProcessExecutor>,
    getter: Arc<dyn SourceGetter>,
    /// Fetched scripts are kept in `<cache_dir>/hooks`
    cache_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Mutex<HookState>>>>,
    uncached: AtomicUsize,
}

impl HookRuntime {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        getter: Arc<dyn SourceGetter>,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            executor,
            getter,
            cache_dir,
            cache: Mutex::default(),
            uncached: AtomicUsize::new(0),
        }
    }

    /// Run the hooks of `unit` triggered by `event` for the provisioner `command`, in
    /// declaration order
    pub fn run_hooks(&self, unit: &Unit, event: Event, command: &str) -> Result<(), HookError> {
        for hook in &unit.descriptor.hooks {
            if should_run(hook, event, command) {
                self.run(unit, hook)?;
            }
        }
        Ok(())
    }

    pub fn run(&self, unit: &Unit, hook: &Hook) -> Result<(), HookError> {
        let key = self.cache_key(unit, hook)?;
        let entry = {
            let mut cache = lock(&self.cache);
            cache
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(HookState::Created)))
                .clone()
        };

        let mut state = lock(&entry);
        let mut first_error = None;
        if *state == HookState::Created {
            *state = HookState::Running;
            *state = match self.execute(unit, hook) {
                Ok(output) => HookState::Succeeded { output },
                Err(error) => {
                    let message = error.to_string();
                    first_error = Some(error);
                    HookState::Failed { message }
                }
            };
        } else {
            tracing::debug!(hook=%hook.hook_type, %key, "hook already ran");
        }

        match &*state {
            HookState::Succeeded { output } => {
                if hook.set_env.unwrap_or(false) {
                    unit.extend_environment(output.iter().filter_map(|line| parse_env_line(line)));
                }
                Ok(())
            }
            HookState::Failed { message } if hook.fail_on_error.unwrap_or(true) => {
                Err(first_error.unwrap_or_else(|| HookError::PreviouslyFailed {
                    hook: hook.hook_type.clone(),
                    message: message.clone(),
                }))
            }
            HookState::Failed { message } => {
                tracing::warn!(unit=%unit.path.display(), hook=%hook.hook_type, %message, "hook failed, continuing");
                Ok(())
            }
            HookState::Created | HookState::Running => Ok(()),
        }
    }

    /// Identity of an invocation
    fn cache_key(&self, unit: &Unit, hook: &Hook) -> Result<String, HookError> {
        let program = program_source(hook)?;

        let mut hasher = Sha256::new();
        hasher.update(unit.working_dir.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(program.as_bytes());
        for arg in &hook.args {
            hasher.update([0u8]);
            hasher.update(arg.as_bytes());
        }
        if hook.disable_cache.unwrap_or(false) {
            let fresh = self.uncached.fetch_add(1, Ordering::Relaxed);
            hasher.update(format!("\0uncached:{fresh}").as_bytes());
        }

        Ok(hex::encode(hasher.finalize()))
    }

    fn execute(&self, unit: &Unit, hook: &Hook) -> Result<Vec<String>, HookError> {
        let program = match (&hook.command, &hook.script) {
            (Some(command), _) => command.clone(),
            (None, Some(script)) => self.fetch_script(hook, script)?.display().to_string(),
            (None, None) => {
                return Err(HookError::NothingToRun {
                    hook: hook.hook_type.clone(),
                })
            }
        };

        tracing::info!(unit=%unit.path.display(), hook=%hook.hook_type, %program, "running hook");
        let mut output = vec![];
        let mut on_stdout = |line: &str| {
            tracing::info!(hook=%hook.hook_type, "{line}");
            output.push(line.to_string());
        };

        self.executor
            .execute(
                ExecOptions {
                    working_dir: Some(&unit.working_dir),
                    env: unit.environment(),
                    stdout: Some(&mut on_stdout),
                    ..Default::default()
                },
                &program,
                &hook.args,
            )
            .map_err(|source| HookError::Exec {
                hook: hook.hook_type.clone(),
                unit: unit.path.clone(),
                source,
            })?;

        Ok(output)
    }

    /// Fetch a script into the cache directory (once) and make it executable
    fn fetch_script(&self, hook: &Hook, script: &str) -> Result<PathBuf, HookError> {
        let destination = self
            .cache_dir
            .join("hooks")
            .join(hex::encode(Sha256::digest(script.as_bytes())));
        let path = destination.join(source::file_name(script));

        if path.exists() {
            tracing::debug!(path=%path.display(), "using cached hook script");
        } else {
            self.getter
                .get(script, &destination, None)
                .map_err(|source| HookError::Fetch {
                    hook: hook.hook_type.clone(),
                    source,
                })?;
        }

        make_executable(&path).map_err(|source| HookError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

pub fn should_run(hook: &Hook, event: Event, command: &str) -> bool {
    let trigger = hook.trigger.as_deref().unwrap_or_default();
    match trigger.parse::<Trigger>() {
        Ok(trigger) => trigger.matches(event, command),
        Err(error) => {
            tracing::warn!(hook=%hook.hook_type, %error, "ignoring hook with invalid trigger");
            false
        }
    }
}

/// `KEY=value` with optional quotes around key and value
///
/// Quotes are only removed in pairs.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let captures = ENV_LINE.captures(line)?;
    let key = captures.get(1).or_else(|| captures.get(2))?;
    let value = captures
        .get(3)
        .or_else(|| captures.get(4))
        .map_or("", |value| value.as_str());
    Some((key.as_str().to_string(), value.to_string()))
}

fn program_source(hook: &Hook) -> Result<&str, HookError> {
    hook.command
        .as_deref()
        .or(hook.script.as_deref())
        .ok_or_else(|| HookError::NothingToRun {
            hook: hook.hook_type.clone(),
        })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum HookError {
    #[error("hook `{hook}` has neither a command nor a script")]
    NothingToRun { hook: String },
    #[error("{}: hook `{hook}` failed", .unit.display())]
    Exec {
        hook: String,
        unit: PathBuf,
        #[source]
        source: ExecError,
    },
    #[error("hook `{hook}` failed earlier: {message}")]
    PreviouslyFailed { hook: String, message: String },
    #[error("unable to fetch the script of hook `{hook}`")]
    Fetch {
        hook: String,
        #[source]
        source: GetError,
    },
    #[error("{}: unable to prepare hook script", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
