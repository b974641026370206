//! running external programs
//!
//! Everything that spawns a process (provisioner, hooks, source fetching) goes through
//! [ProcessExecutor] so it can be replaced in tests.
use indexmap::IndexMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Receives one line of output (without the line break)
pub type LineProcessor<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Lines of stderr kept for [ExecError::Failed]
const STDERR_TAIL: usize = 50;

#[derive(Default)]
pub struct ExecOptions<'a> {
    pub working_dir: Option<&'a Path>,
    /// Added to the environment of the current process
    pub env: IndexMap<String, String>,
    pub stdout: Option<LineProcessor<'a>>,
    pub stderr: Option<LineProcessor<'a>>,
    /// Kill the process after this long
    pub timeout: Option<Duration>,
}

pub trait ProcessExecutor: Send + Sync {
    /// Run `command` to completion
    ///
    /// Line processors see the lines of each stream in the order they arrive. A non-zero exit
    /// status is an error.
    fn execute(
        &self,
        options: ExecOptions<'_>,
        command: &str,
        args: &[String],
    ) -> Result<(), ExecError>;
}

/// Spawns real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl ProcessExecutor for SystemExecutor {
    #[tracing::instrument(level = "debug", skip(self, options), fields(working_dir = ?options.working_dir))]
    fn execute(
        &self,
        options: ExecOptions<'_>,
        command: &str,
        args: &[String],
    ) -> Result<(), ExecError> {
        let ExecOptions {
            working_dir,
            env,
            stdout,
            stderr,
            timeout,
        } = options;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(working_dir) = working_dir {
            cmd.current_dir(working_dir);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let (Some(child_stdout), Some(child_stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(ExecError::Spawn {
                command: command.to_string(),
                source: std::io::Error::other("output was not piped"),
            });
        };

        let (status, stderr_tail) = std::thread::scope(|scope| {
            let stdout_reader = scope.spawn(move || read_lines(child_stdout, stdout, None));
            let stderr_reader =
                scope.spawn(move || read_lines(child_stderr, stderr, Some(STDERR_TAIL)));

            let status = match timeout {
                Some(timeout) => match child.wait_timeout(timeout) {
                    Ok(Some(status)) => Ok(status),
                    Ok(None) => {
                        tracing::warn!(command, timeout_secs = timeout.as_secs(), "command timed out, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        Err(ExecError::Timeout {
                            command: command.to_string(),
                            timeout,
                        })
                    }
                    Err(source) => Err(ExecError::Wait {
                        command: command.to_string(),
                        source,
                    }),
                },
                None => child.wait().map_err(|source| ExecError::Wait {
                    command: command.to_string(),
                    source,
                }),
            };

            // drain both streams before returning
            let _ = stdout_reader.join();
            let tail = stderr_reader.join().unwrap_or_default();
            (status, tail)
        });

        let status = status?;
        tracing::debug!(command, code = ?status.code(), "command finished");

        if !status.success() {
            return Err(ExecError::Failed {
                command: command.to_string(),
                code: status.code(),
                stderr: stderr_tail.join("\n"),
            });
        }

        Ok(())
    }
}

/// Feed every line to `processor`, keeping the last `keep` lines
fn read_lines(
    reader: impl Read,
    mut processor: Option<LineProcessor<'_>>,
    keep: Option<usize>,
) -> Vec<String> {
    let mut reader = BufReader::new(reader);
    let mut kept = vec![];
    let mut buffer = vec![];

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%error, "unable to read process output");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches(['\n', '\r']);

        match processor.as_mut() {
            Some(processor) => processor(line),
            None => tracing::trace!(line, "output"),
        }

        if let Some(keep) = keep {
            if kept.len() == keep {
                kept.remove(0);
            }
            kept.push(line.to_string());
        }
    }

    kept
}

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("unable to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to wait for `{command}`")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with exit code {}{}", display_code(.code), display_stderr(.stderr))]
    Failed {
        command: String,
        code: Option<i32>,
        /// last lines of stderr
        stderr: String,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl ExecError {
    /// Captured stderr of a failed process
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|code| code.to_string())
        .unwrap_or_else(|| "none (terminated by signal)".to_string())
}

fn display_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{stderr}")
    }
}


#[cfg(all(test, unix))]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn streams_lines_in_order() {
        let mut stdout = vec![];
        let mut stderr = vec![];
        let mut on_stdout = |line: &str| stdout.push(line.to_string());
        let mut on_stderr = |line: &str| stderr.push(line.to_string());

        SystemExecutor
            .execute(
                ExecOptions {
                    env: IndexMap::from([("GREETING".to_string(), "hello".to_string())]),
                    stdout: Some(&mut on_stdout),
                    stderr: Some(&mut on_stderr),
                    ..Default::default()
                },
                "sh",
                &sh("echo $GREETING; echo two; echo oops >&2"),
            )
            .unwrap();

        assert_eq!(stdout, vec!["hello", "two"]);
        assert_eq!(stderr, vec!["oops"]);
    }

    #[test]
    fn working_directory() {
        let dir = tempfile::tempdir().unwrap();
        SystemExecutor
            .execute(
                ExecOptions {
                    working_dir: Some(dir.path()),
                    ..Default::default()
                },
                "sh",
                &sh("touch marker"),
            )
            .unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[test]
    fn failure_keeps_stderr() {
        let err = SystemExecutor
            .execute(ExecOptions::default(), "sh", &sh("echo broken >&2; exit 3"))
            .unwrap_err();

        match err {
            ExecError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn spawn_failure() {
        assert!(matches!(
            SystemExecutor.execute(ExecOptions::default(), "/does/not/exist", &[]),
            Err(ExecError::Spawn { .. })
        ));
    }

    #[test]
    fn timeout_kills() {
        let err = SystemExecutor
            .execute(
                ExecOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
                "sleep",
                &["5".to_string()],
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }
}
