//! Command tasks: handlers that run an external executable.
//!
//! The worker binary builds its registry from a directory of TOML files, one
//! task type each:
//!
//! ```toml
//! [task]
//! name = "send_digest"
//! command = "bin/send-digest"
//! args = ["--quiet"]
//! permanent_exit_codes = [64, 65]
//! ```
//!
//! The executable gets the task arguments as JSON on stdin and the task
//! identity in `SNAPPEA_TASK_ID`, `SNAPPEA_TASK_TYPE` and `SNAPPEA_ATTEMPT`.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::Arguments;
use crate::registry::{HandlerError, TaskContext, TaskHandler, TaskRegistry};

/// Bytes of stderr kept in the failure message.
const STDERR_TAIL: usize = 2048;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct TaskFile {
    task: TaskDeclaration,
}

/// One declared task type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDeclaration {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes meaning "retrying won't help".
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
}

impl TaskDeclaration {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: TaskFile = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("bad task declaration {}: {e}", path.display()))
        })?;
        if file.task.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "task declaration {} has an empty name",
                path.display()
            )));
        }
        Ok(file.task)
    }
}

/// Runs one executable per attempt.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: PathBuf,
    args: Vec<String>,
    permanent_exit_codes: Vec<i32>,
}

impl CommandHandler {
    /// Paths with more than one component resolve against the process
    /// working directory; bare names are looked up on `PATH`.
    pub fn new(declaration: &TaskDeclaration) -> Result<Self> {
        let command = if declaration.command.is_relative()
            && declaration.command.components().count() > 1
        {
            std::env::current_dir()?.join(&declaration.command)
        } else {
            declaration.command.clone()
        };
        Ok(Self {
            command,
            args: declaration.args.clone(),
            permanent_exit_codes: declaration.permanent_exit_codes.clone(),
        })
    }

    pub fn command(&self) -> &Path {
        &self.command
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn run(
        &self,
        ctx: TaskContext,
        arguments: Arguments,
    ) -> std::result::Result<(), HandlerError> {
        let payload = serde_json::to_vec(&arguments).map_err(HandlerError::permanent)?;

        debug!(command = %self.command.display(), "spawning task command");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("SNAPPEA_TASK_ID", ctx.task_id.to_string())
            .env("SNAPPEA_TASK_TYPE", &ctx.task_type)
            .env("SNAPPEA_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::transient(format!(
                    "cannot spawn {}: {e}",
                    self.command.display()
                ))
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| HandlerError::transient(format!("wait failed: {e}")))?;
        if let Err(e) = fed {
            // The command may exit without reading its input.
            debug!(error = %e, "stdin not fully consumed");
        }

        if !output.stdout.is_empty() {
            debug!(stdout = %tail(&output.stdout), "task command output");
        }

        match output.status.code() {
            Some(0) => Ok(()),
            Some(code) => {
                let message = format!("exited with status {code}{}", stderr_suffix(&output.stderr));
                if self.permanent_exit_codes.contains(&code) {
                    Err(HandlerError::Permanent(message))
                } else {
                    Err(HandlerError::Transient(message))
                }
            }
            None => Err(HandlerError::transient(format!(
                "terminated by signal{}",
                stderr_suffix(&output.stderr)
            ))),
        }
    }
}

fn stderr_suffix(stderr: &[u8]) -> String {
    let text = tail(stderr);
    if text.is_empty() {
        String::new()
    } else {
        format!(": {text}")
    }
}

/// Last [`STDERR_TAIL`] bytes of `bytes` as trimmed text.
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Load every `*.toml` declaration in `dir` into a registry.
///
/// Files are read in name order. A task name declared twice is an error.
pub fn load_registry(dir: &Path) -> Result<TaskRegistry> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Config(format!("cannot read tasks dir {}: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut builder = TaskRegistry::builder();
    for path in paths {
        let declaration = TaskDeclaration::read(&path)?;
        let handler = CommandHandler::new(&declaration)?;
        debug!(
            task_type = %declaration.name,
            command = %handler.command().display(),
            file = %path.display(),
            "loaded task declaration"
        );
        builder = builder.register_arc(declaration.name, Arc::new(handler))?;
    }

    let registry = builder.build();
    info!(task_types = ?registry.task_types(), "task registry loaded");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_parses_with_defaults() {
        let file: TaskFile = toml::from_str(
            r#"
            [task]
            name = "send_digest"
            command = "bin/send-digest"
            "#,
        )
        .unwrap();
        assert_eq!(file.task.name, "send_digest");
        assert!(file.task.permanent_exit_codes.is_empty());
    }

    #[test]
    fn unknown_declaration_keys_rejected() {
        let result: std::result::Result<TaskFile, _> = toml::from_str(
            r#"
            [task]
            name = "x"
            command = "y"
            retries = 3
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "a".repeat(STDERR_TAIL) + "the end";
        let kept = tail(long.as_bytes());
        assert!(kept.starts_with("..."));
        assert!(kept.ends_with("the end"));
        assert_eq!(tail(b"  short \n"), "short");
    }

    #[test]
    fn bare_names_stay_on_path() {
        let declaration = TaskDeclaration {
            name: "t".to_string(),
            command: PathBuf::from("true"),
            args: vec![],
            permanent_exit_codes: vec![],
        };
        let handler = CommandHandler::new(&declaration).unwrap();
        assert_eq!(handler.command(), Path::new("true"));
    }
}
