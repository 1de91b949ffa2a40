//! Resident plugins spoken to over their stdio.
//!
//! Each request is one JSON line `{"id": n, "method": "...", "params": ...}`.
//! The plugin answers with lines carrying the same id: any number of
//! `{"id": n, "event": "<record json>"}` followed by one terminal
//! `{"id": n, "result": ...}` or `{"id": n, "error": "..."}`. Lines that are
//! not frames are ignored so plugins may print banners.

use super::terminate;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One configurable field advertised by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Nested fields when `kind` is `object`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

/// Names of required fields missing from `config`, nested ones dotted.
pub fn missing_required(schema: &[FieldSchema], config: &Value) -> Vec<String> {
    let mut missing = Vec::new();
    collect_missing(schema, config, "", &mut missing);
    missing
}

fn collect_missing(schema: &[FieldSchema], config: &Value, prefix: &str, out: &mut Vec<String>) {
    for field in schema {
        let path = format!("{}{}", prefix, field.name);
        match config.get(&field.name) {
            None | Some(Value::Null) if field.required => out.push(path),
            Some(nested) if nested.is_object() && !field.fields.is_empty() => {
                collect_missing(&field.fields, nested, &format!("{}.", path), out)
            }
            _ => {}
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct Frame {
    id: u64,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
enum Reply {
    Event(String),
    Done(Value),
    Failed(String),
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Reply>>>>;

#[derive(Deserialize)]
struct SchemaResult {
    fields: Vec<FieldSchema>,
}

pub struct PluginClient {
    child: Child,
    stdin: Option<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl PluginClient {
    pub fn spawn(path: &Path) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Provider(format!("could not start {}: {}", path.display(), e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Provider("plugin stdout unavailable".into()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_frames(BufReader::new(stdout), Arc::clone(&pending)));

        Ok(Self {
            child,
            stdin,
            pending,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    async fn call(&mut self, method: &str, params: &Value) -> Result<mpsc::UnboundedReceiver<Reply>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_vec(&Request { id, method, params })?;
        line.push(b'\n');
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Protocol("plugin connection is closed".into()))?;
        if let Err(e) = stdin.write_all(&line).await {
            self.pending.lock().remove(&id);
            return Err(Error::Protocol(format!("could not send {} to plugin: {}", method, e)));
        }
        stdin
            .flush()
            .await
            .map_err(|e| Error::Protocol(format!("could not send {} to plugin: {}", method, e)))?;
        debug!(id, method, "Sent plugin request");
        Ok(rx)
    }

    pub async fn get_schema(&mut self) -> Result<Vec<FieldSchema>> {
        let mut replies = self.call("GetSchema", &Value::Null).await?;
        loop {
            match replies.recv().await {
                Some(Reply::Done(result)) => {
                    return Ok(serde_json::from_value::<SchemaResult>(result)?.fields)
                }
                Some(Reply::Failed(message)) => return Err(Error::Provider(message)),
                Some(Reply::Event(_)) => warn!("Ignoring event frame in GetSchema reply"),
                None => return Err(Error::Protocol("plugin exited during GetSchema".into())),
            }
        }
    }

    /// Starts the plugin and streams the records it emits. The stream ends
    /// on the terminal frame or when `cancel` fires; an error frame arrives
    /// as the last item.
    pub async fn start(
        &mut self,
        config: &Value,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<Result<String>>> {
        let mut replies = self.call("Start", config).await?;
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let reply = tokio::select! {
                    _ = cancel.cancelled() => return,
                    reply = replies.recv() => reply,
                };
                let item = match reply {
                    Some(Reply::Event(record)) => Ok(record),
                    Some(Reply::Done(_)) => return,
                    Some(Reply::Failed(message)) => Err(Error::Provider(message)),
                    None => Err(Error::Protocol("plugin exited before finishing Start".into())),
                };
                let last = item.is_err();
                if tx.send(item).await.is_err() || last {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Closes the plugin's stdin, then terminates it within `grace`.
    pub async fn close(mut self, grace: Duration) -> Result<()> {
        drop(self.stdin.take());
        terminate(&mut [&mut self.child], grace).await;
        self.reader.abort();
        Ok(())
    }
}

async fn read_frames<R>(mut reader: BufReader<R>, pending: Pending)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read from plugin");
                break;
            }
        }
        let Ok(frame) = serde_json::from_str::<Frame>(line.trim_end()) else {
            debug!(line = %line.trim_end(), "Ignoring non-frame output from plugin");
            continue;
        };

        let mut pending = pending.lock();
        let reply = match (frame.event, frame.result, frame.error) {
            (_, _, Some(message)) => Reply::Failed(message),
            (Some(record), _, _) => Reply::Event(record),
            (None, result, None) => Reply::Done(result.unwrap_or(Value::Null)),
        };
        let terminal = !matches!(reply, Reply::Event(_));
        let delivered = pending
            .get(&frame.id)
            .map(|tx| tx.send(reply).is_ok())
            .unwrap_or(false);
        if terminal || !delivered {
            pending.remove(&frame.id);
        }
    }
    // Dropping the senders tells every waiter the plugin is gone.
    pending.lock().clear();
}
