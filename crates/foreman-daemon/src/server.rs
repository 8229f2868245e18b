//! JSON-over-stdio wire server.
//!
//! Requests arrive one JSON object per line on stdin as
//! `{ "method": ..., "params": ... }`; responses leave on stdout as
//! `{ "ok": bool, "value"?, "error"? }`. Nothing else is ever written to
//! stdout — all logging goes to stderr — so a single connected client owns
//! the stream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_core::manager::{DelegateRequest, ResumeRequest, TaskManager};
use foreman_db::{Error, Result};

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Error>,
}

impl Response {
    fn success(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    fn failure(error: Error) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    task_id: String,
    #[serde(default)]
    tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    task_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryParams {
    task_id: String,
}

/// Route one request to the task manager.
pub async fn dispatch(manager: &Arc<TaskManager>, method: &str, params: Value) -> Result<Value> {
    match method {
        "delegate" => {
            let request: DelegateRequest = parse_params(params)?;
            let task = manager.delegate(request).await?;
            to_value(&task)
        }
        "status" => {
            let StatusParams { task_id } = parse_params(params)?;
            let single = task_id.is_some();
            let tasks = manager.get_status(task_id).await?;
            if single {
                to_value(&tasks[0])
            } else {
                to_value(&tasks)
            }
        }
        "logs" => {
            let LogsParams { task_id, tail } = parse_params(params)?;
            let logs = manager.get_logs(task_id, tail).await?;
            to_value(&logs)
        }
        "cancel" => {
            let CancelParams { task_id, reason } = parse_params(params)?;
            manager.cancel(task_id, reason).await?;
            Ok(Value::Null)
        }
        "retry" => {
            let RetryParams { task_id } = parse_params(params)?;
            let task = manager.retry(&task_id).await?;
            to_value(&task)
        }
        "resume" => {
            let request: ResumeRequest = parse_params(params)?;
            let task = manager.resume(request).await?;
            to_value(&task)
        }
        other => Err(Error::invalid_operation(format!("unknown method {other:?}"))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::invalid_operation(format!("invalid params: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

/// Serve requests from stdin until EOF or shutdown.
pub async fn serve_stdio(
    manager: Arc<TaskManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    info!("serving requests on stdio");
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("shutdown requested, closing server");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("stdin closed, shutting down");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                debug!(method = %request.method, "request received");
                match dispatch(&manager, &request.method, request.params).await {
                    Ok(value) => Response::success(value),
                    Err(err) => {
                        warn!(method = %request.method, error = %err, "request failed");
                        Response::failure(err)
                    }
                }
            }
            Err(err) => Response::failure(Error::invalid_operation(format!(
                "malformed request: {err}"
            ))),
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    Ok(())
}
