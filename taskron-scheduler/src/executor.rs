use std::{process::Stdio, sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::{Client, Method};
use taskron_models::{
    core::{NewLogEntry, Task, TaskAction},
    errors::{SendableError, TaskronError},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
    time,
};

pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// How long pipes are drained once the shell has exited. A background child
/// that inherited stdout or stderr can keep them open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

struct RunOutcome {
    success: bool,
    output: String,
    error: String,
}

impl RunOutcome {
    fn failed(output: String, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output,
            error: error.into(),
        }
    }
}

/// Runs one task action to completion and turns whatever happened into a
/// log entry. Nothing escapes `run` as an error.
#[derive(Clone)]
pub struct Executor {
    client: Client,
    timeout: Duration,
    output_limit: usize,
}

impl Executor {
    pub fn new(timeout: Duration, output_limit: usize) -> Result<Self, SendableError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            timeout,
            output_limit,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn run(&self, task: &Task) -> NewLogEntry {
        let start_time = Utc::now();
        debug!("Executing task {} ({})", task.id, task.name);

        let outcome = match time::timeout(self.timeout, self.dispatch(task.action())).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Task {} exceeded timeout of {} seconds",
                    task.id,
                    self.timeout.as_secs_f64()
                );
                RunOutcome::failed(
                    String::new(),
                    TaskronError::ExecutionTimeout {
                        timeout: self.timeout,
                    }
                    .to_string(),
                )
            }
        };

        let end_time = Utc::now();
        if outcome.success {
            info!("Task {} completed successfully", task.id);
        } else {
            info!("Task {} failed: {}", task.id, first_line(&outcome.error));
        }

        NewLogEntry {
            task_id: task.id,
            task_name: task.name.clone(),
            start_time,
            end_time,
            success: outcome.success,
            output: truncate_output(outcome.output, self.output_limit),
            error: truncate_output(outcome.error, self.output_limit),
        }
    }

    async fn dispatch(&self, action: TaskAction) -> RunOutcome {
        match action {
            TaskAction::Command { command } => run_command(&command).await,
            TaskAction::HttpCall {
                url,
                method,
                headers,
            } => self.run_http(&url, &method, &headers).await,
        }
    }

    async fn run_http(&self, url: &str, method: &str, headers: &[(String, String)]) -> RunOutcome {
        let method = match Method::from_bytes(method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return RunOutcome::failed(
                    String::new(),
                    TaskronError::ExecutionFailed(format!("invalid HTTP method '{method}'"))
                        .to_string(),
                );
            }
        };

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return RunOutcome::failed(
                    String::new(),
                    TaskronError::ExecutionFailed(err.to_string()).to_string(),
                );
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => format!("<failed to read response body: {err}>"),
        };
        let output = format!("HTTP {status}\n{body}");

        if status.as_u16() < 400 {
            RunOutcome {
                success: true,
                output,
                error: String::new(),
            }
        } else {
            RunOutcome::failed(
                output,
                format!("HTTP request failed with status code: {}", status.as_u16()),
            )
        }
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Collects everything written to a child pipe. The reader runs on its own
/// task so the exit status can be awaited independently of EOF.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl PipeCapture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => sink.lock().extend_from_slice(&chunk[..read]),
                }
            }
        });
        Self { buffer, reader }
    }

    async fn finish(mut self) -> String {
        if time::timeout(PIPE_DRAIN_GRACE, &mut self.reader).await.is_err() {
            debug!("Pipe still open after the command exited, keeping captured output");
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Drop for PipeCapture {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn run_command(command: &str) -> RunOutcome {
    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return RunOutcome::failed(
                String::new(),
                TaskronError::ExecutionFailed(format!("failed to spawn command: {err}")).to_string(),
            );
        }
    };

    let stdout = PipeCapture::start(child.stdout.take());
    let stderr = PipeCapture::start(child.stderr.take());

    // Dropping this future on timeout drops the child, which kills it, and
    // the captures, which stop their readers.
    let status = match child.wait().await {
        Ok(status) => status,
        Err(err) => {
            return RunOutcome::failed(
                String::new(),
                TaskronError::ExecutionFailed(err.to_string()).to_string(),
            );
        }
    };

    let stdout = stdout.finish().await;
    let mut stderr = stderr.finish().await;

    if status.success() {
        return RunOutcome {
            success: true,
            output: stdout,
            error: stderr,
        };
    }

    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    match status.code() {
        Some(code) => stderr.push_str(&format!("exit status: {code}")),
        None => stderr.push_str("process terminated by signal"),
    }
    RunOutcome::failed(stdout, stderr)
}

/// Caps `text` at `limit` bytes, cutting on a character boundary.
pub fn truncate_output(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n...[truncated {} bytes]",
        &text[..cut],
        text.len() - cut
    )
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
