//! Runs a task as a pair of provider processes, or as one resident plugin.
//!
//! For `run`, the input provider's stdout is piped line by line into the
//! output provider's stdin. Each provider first receives a command envelope
//! with its configuration on stdin; the input provider's stdin is then
//! closed while the output provider's stays open for records. Other verbs
//! (`init`, `destroy`, `plan`, `status`) run each provider once with the
//! envelope and let it report on stdout.

pub mod envelope;
pub mod resolve;
pub mod rpc;

use crate::config::{ProviderConfig, TaskConfig, TaskKind};
use crate::{Error, Result};
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as Process};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use envelope::Command;
pub use rpc::{FieldSchema, PluginClient};

/// How long children get to exit after SIGTERM before being killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Sends SIGTERM to every running child, waits up to `grace`, then kills
/// whatever is left.
pub async fn terminate(children: &mut [&mut Child], grace: Duration) {
    for child in children.iter() {
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "Could not signal child");
            }
        }
    }

    let graceful = tokio::time::timeout(
        grace,
        futures::future::join_all(children.iter_mut().map(|c| c.wait())),
    )
    .await;
    if graceful.is_ok() {
        return;
    }

    warn!("Providers did not exit in time, killing");
    for child in children.iter_mut() {
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Could not kill child");
        }
    }
}

/// Pipe and wait failures count as provider failures, not local I/O errors.
fn pipe_error(context: &str) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| Error::Provider(format!("{}: {}", context, e))
}

async fn exit_ok(child: &mut Child, role: &str) -> Result<()> {
    let status = child.wait().await.map_err(pipe_error(role))?;
    if status.success() {
        debug!(role, "Provider exited");
        Ok(())
    } else {
        Err(Error::Provider(format!("{} exited with {}", role, status)))
    }
}

/// Copies newline-terminated records from `from` to `to`, closing `to` at
/// end of input. Returns the number of records.
async fn pump(from: ChildStdout, mut to: ChildStdin) -> Result<u64> {
    let mut reader = BufReader::new(from);
    let mut line = Vec::with_capacity(4096);
    let mut records = 0u64;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(pipe_error("could not read input provider"))?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        to.write_all(&line)
            .await
            .map_err(pipe_error("output provider stopped reading"))?;
        records += 1;
    }
    to.flush()
        .await
        .map_err(pipe_error("output provider stopped reading"))?;
    Ok(records)
}

fn spawn(path: &Path, stdout: Stdio) -> Result<Child> {
    Process::new(path)
        .stdin(Stdio::piped())
        .stdout(stdout)
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Provider(format!("could not start {}: {}", path.display(), e)))
}

fn stdin_of(child: &mut Child) -> Result<ChildStdin> {
    child
        .stdin
        .take()
        .ok_or_else(|| Error::Provider("provider stdin unavailable".into()))
}

pub struct Executor {
    grace: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Runs `command` for `task` until it finishes or `cancel` fires.
    pub async fn execute(
        &self,
        task: &TaskConfig,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(task = %task.name, command = %command, "Executing task");
        match (task.kind, command) {
            (TaskKind::Providers, Command::Run) => self.run_providers(task, cancel).await,
            (TaskKind::Providers, verb) => self.run_lifecycle(task, verb, cancel).await,
            (TaskKind::Plugin, Command::Run) => self.run_plugin(task, cancel).await,
            (TaskKind::Plugin, verb) => Err(Error::Config(format!(
                "task '{}' is a plugin task and only supports run, not {}",
                task.name, verb
            ))),
        }
    }

    async fn resolve_providers(task: &TaskConfig) -> Result<[(PathBuf, &ProviderConfig); 2]> {
        let input = task
            .input
            .as_ref()
            .ok_or_else(|| Error::Config(format!("task '{}' has no input provider", task.name)))?;
        let output = task
            .output
            .as_ref()
            .ok_or_else(|| Error::Config(format!("task '{}' has no output provider", task.name)))?;

        let input_path =
            resolve::resolve(input.provider_path.as_deref(), input.provider_ref.as_deref()).await?;
        let output_path =
            resolve::resolve(output.provider_path.as_deref(), output.provider_ref.as_deref()).await?;
        info!(
            task = %task.name,
            input_provider = %input_path.display(),
            output_provider = %output_path.display(),
            "Provider paths resolved"
        );
        Ok([(input_path, input), (output_path, output)])
    }

    async fn run_providers(&self, task: &TaskConfig, cancel: CancellationToken) -> Result<()> {
        let [(input_path, input_config), (output_path, output_config)] =
            Self::resolve_providers(task).await?;

        let mut input = spawn(&input_path, Stdio::piped())?;
        let mut output = match spawn(&output_path, Stdio::inherit()) {
            Ok(child) => child,
            Err(e) => {
                terminate(&mut [&mut input], self.grace).await;
                return Err(e);
            }
        };

        let outcome = async {
            let mut input_stdin = stdin_of(&mut input)?;
            input_stdin
                .write_all(&envelope::encode(Command::Run, &input_config.config)?)
                .await
                .map_err(pipe_error("could not send envelope to input provider"))?;
            drop(input_stdin);

            let mut output_stdin = stdin_of(&mut output)?;
            output_stdin
                .write_all(&envelope::encode(Command::Run, &output_config.config)?)
                .await
                .map_err(pipe_error("could not send envelope to output provider"))?;

            let input_stdout = input
                .stdout
                .take()
                .ok_or_else(|| Error::Provider("input provider stdout unavailable".into()))?;

            let run = async {
                tokio::try_join!(
                    pump(input_stdout, output_stdin),
                    exit_ok(&mut input, "input provider"),
                    exit_ok(&mut output, "output provider"),
                )
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Shutdown),
                result = run => result.map(|(records, _, _)| records),
            }
        }
        .await;

        match outcome {
            Ok(records) => {
                info!(task = %task.name, records, "Task completed");
                Ok(())
            }
            Err(e) => {
                match &e {
                    Error::Shutdown => info!(task = %task.name, "Stopping providers"),
                    other => warn!(task = %task.name, error = %other, "Task failed, stopping providers"),
                }
                terminate(&mut [&mut input, &mut output], self.grace).await;
                Err(e)
            }
        }
    }

    async fn run_lifecycle(
        &self,
        task: &TaskConfig,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<()> {
        let providers = Self::resolve_providers(task).await?;
        for ((path, provider), role) in providers.iter().zip(["input provider", "output provider"]) {
            let mut child = spawn(path, Stdio::inherit())?;
            let outcome = async {
                let mut stdin = stdin_of(&mut child)?;
                stdin
                    .write_all(&envelope::encode(command, &provider.config)?)
                    .await
                    .map_err(pipe_error(role))?;
                drop(stdin);
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Shutdown),
                    result = exit_ok(&mut child, role) => result,
                }
            }
            .await;
            if let Err(e) = outcome {
                terminate(&mut [&mut child], self.grace).await;
                return Err(e);
            }
            info!(task = %task.name, command = %command, role, "Provider finished");
        }
        Ok(())
    }

    async fn run_plugin(&self, task: &TaskConfig, cancel: CancellationToken) -> Result<()> {
        let path = resolve::resolve(task.plugin_path.as_deref(), task.plugin_ref.as_deref()).await?;
        let mut client = PluginClient::spawn(&path)?;

        let outcome = async {
            let schema = client.get_schema().await?;
            for field in &schema {
                debug!(
                    field = %field.name,
                    kind = %field.kind,
                    required = field.required,
                    "Plugin config field"
                );
            }
            let missing = rpc::missing_required(&schema, &task.config);
            if !missing.is_empty() {
                return Err(Error::Config(format!(
                    "task '{}' is missing required plugin config: {}",
                    task.name,
                    missing.join(", ")
                )));
            }

            let mut records = client.start(&task.config, cancel.clone()).await?;
            let mut stdout = tokio::io::stdout();
            let mut count = 0u64;
            while let Some(record) = records.next().await {
                let mut line = record?.into_bytes();
                line.push(b'\n');
                stdout.write_all(&line).await?;
                count += 1;
            }
            stdout.flush().await?;
            if cancel.is_cancelled() {
                return Err(Error::Shutdown);
            }
            Ok(count)
        }
        .await;

        if let Err(e) = client.close(self.grace).await {
            warn!(task = %task.name, error = %e, "Failed to close plugin");
        }
        let records = outcome?;
        info!(task = %task.name, records, "Plugin finished");
        Ok(())
    }
}
