// ABOUTME: Trigger declarations and the dispatcher that runs them, in order, for each notification.
// ABOUTME: Also resolves `${a.b}` placeholders against the notification document.

pub mod command;
pub mod function;
pub mod post;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub use command::CommandTrigger;
pub use function::{FunctionRegistry, TriggerFn};
pub use post::{CloudEventsSpec, PostTrigger, cloudevent};

/// Errors raised while building or running a trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("placeholder '${{{0}}}' does not resolve in the notification")]
    Unresolved(String),

    #[error("command failed ({status}): {stderr}")]
    Command { status: String, stderr: String },

    #[error("post to {url} failed: {reason}")]
    Post { url: String, reason: String },

    #[error("function '{name}' failed: {source}")]
    Function {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A trigger as declared in a listener file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerSpec {
    Function {
        function: String,
    },
    Command {
        command: String,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        #[serde(default)]
        environment: BTreeMap<String, String>,
    },
    Echo,
    Log {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Post {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// Seconds.
        #[serde(default = "default_post_timeout")]
        timeout: u64,
        #[serde(default)]
        cloudevents: CloudEventsSpec,
    },
}

fn default_post_timeout() -> u64 {
    60
}

impl TriggerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerSpec::Function { .. } => "function",
            TriggerSpec::Command { .. } => "command",
            TriggerSpec::Echo => "echo",
            TriggerSpec::Log { .. } => "log",
            TriggerSpec::Post { .. } => "post",
        }
    }
}

enum Trigger {
    Function { name: String, func: TriggerFn },
    Command(CommandTrigger),
    Echo,
    Log(Option<PathBuf>),
    Post(PostTrigger),
}

/// Runs a listener's triggers in declaration order.
pub struct TriggerDispatcher {
    triggers: Vec<Trigger>,
}

impl TriggerDispatcher {
    /// Build every trigger up front; an unknown function name fails here.
    pub fn new(specs: &[TriggerSpec], registry: &FunctionRegistry) -> Result<Self, TriggerError> {
        let triggers = specs
            .iter()
            .map(|spec| -> Result<Trigger, TriggerError> {
                Ok(match spec {
                    TriggerSpec::Function { function } => Trigger::Function {
                        name: function.clone(),
                        func: registry
                            .get(function)
                            .ok_or_else(|| TriggerError::UnknownFunction(function.clone()))?,
                    },
                    TriggerSpec::Command {
                        command,
                        working_dir,
                        environment,
                    } => Trigger::Command(CommandTrigger::new(
                        command.clone(),
                        working_dir.clone(),
                        environment.clone(),
                    )),
                    TriggerSpec::Echo => Trigger::Echo,
                    TriggerSpec::Log { path } => Trigger::Log(path.clone()),
                    TriggerSpec::Post {
                        url,
                        headers,
                        timeout,
                        cloudevents,
                    } => Trigger::Post(PostTrigger::new(
                        url.clone(),
                        headers.clone(),
                        std::time::Duration::from_secs(*timeout),
                        cloudevents.clone(),
                    )?),
                })
            })
            .collect::<Result<Vec<_>, TriggerError>>()?;
        Ok(Self { triggers })
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Run each trigger; the first failure skips the rest.
    pub async fn dispatch(&self, notification: &Value) -> Result<(), TriggerError> {
        for trigger in &self.triggers {
            match trigger {
                Trigger::Function { name, func } => {
                    func(notification).map_err(|source| TriggerError::Function {
                        name: name.clone(),
                        source,
                    })?;
                }
                Trigger::Command(command) => command.run(notification).await?,
                Trigger::Echo => println!("{}", serde_json::to_string_pretty(notification)?),
                Trigger::Log(path) => log_notification(path.as_deref(), notification).await?,
                Trigger::Post(post) => post.run(notification).await?,
            }
        }
        Ok(())
    }
}

async fn log_notification(
    path: Option<&std::path::Path>,
    notification: &Value,
) -> Result<(), TriggerError> {
    let line = serde_json::to_string(notification)?;
    let Some(path) = path else {
        tracing::info!("notification: {}", line);
        return Ok(());
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Look up a dotted path such as `request.date` in a JSON document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, part| match node {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Text of a JSON value as substituted into templates: strings bare, anything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `${name}` in `template`. `special` gets first pick of each name;
/// anything it declines is looked up as a dotted path in `notification`.
/// A `$` not followed by `{` is copied through unchanged.
pub fn substitute<F>(template: &str, notification: &Value, mut special: F) -> Result<String, TriggerError>
where
    F: FnMut(&str) -> Option<Result<String, TriggerError>>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        let replacement = match special(name) {
            Some(result) => result?,
            None => match lookup_path(notification, name) {
                Some(value) => value_text(value),
                None => return Err(TriggerError::Unresolved(name.to_string())),
            },
        };
        out.push_str(&replacement);
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
