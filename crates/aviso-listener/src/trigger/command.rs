// ABOUTME: Runs a shell command for each notification, with placeholders filled from the notification.
// ABOUTME: Every substitution is shell-quoted; `${jsonpath}` names a temp file holding the document.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use tempfile::NamedTempFile;

use super::{TriggerError, lookup_path, substitute, value_text};

#[derive(Debug, Clone)]
pub struct CommandTrigger {
    command: String,
    working_dir: Option<PathBuf>,
    environment: BTreeMap<String, String>,
}

impl CommandTrigger {
    pub fn new(
        command: String,
        working_dir: Option<PathBuf>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            command,
            working_dir,
            environment,
        }
    }

    /// Expand placeholders, each one quoted as a single shell word.
    /// The returned temp file, if any, must outlive the command.
    pub fn render(&self, notification: &Value) -> Result<(String, Option<NamedTempFile>), TriggerError> {
        let mut json_file: Option<NamedTempFile> = None;
        let script = substitute(&self.command, notification, |name| {
            let text = match name {
                "json" => serde_json::to_string(notification).map_err(TriggerError::from),
                "jsonpath" => write_json_file(notification).map(|file| {
                    let path = file.path().display().to_string();
                    json_file = Some(file);
                    path
                }),
                path => lookup_path(notification, path)
                    .map(value_text)
                    .ok_or_else(|| TriggerError::Unresolved(path.to_string())),
            };
            Some(text.map(quote))
        })?;
        Ok((script, json_file))
    }

    /// Run the command through `sh -c`. Non-empty stderr or a failed exit is an error.
    pub async fn run(&self, notification: &Value) -> Result<(), TriggerError> {
        let (script, _json_file) = self.render(notification)?;
        tracing::debug!("running command trigger: {}", script);

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = command.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            tracing::info!("command output: {}", stdout.trim_end());
        }
        if !output.status.success() || !stderr.trim().is_empty() {
            return Err(TriggerError::Command {
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(())
    }
}

fn quote(text: String) -> String {
    shell_escape::unix::escape(Cow::Owned(text)).into_owned()
}

fn write_json_file(notification: &Value) -> Result<NamedTempFile, TriggerError> {
    let mut file = tempfile::Builder::new()
        .prefix("aviso-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer(&mut file, notification)?;
    file.flush()?;
    Ok(file)
}
