//! GeoCLIP worker backend
//!
//! GeoCLIP only ships as a Python library, so the model lives in a long-lived
//! child process (`scripts/geoclip_worker.py`) that speaks JSON lines over its
//! stdin/stdout. Construction spawns the worker and waits for it to report the
//! model loaded; each prediction is one request/response exchange.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::engine::model::{GeoModel, ModelLoader, NoGrad, RawPrediction};
use crate::error::ModelFault;

/// Lines of worker stderr kept for fault messages
const STDERR_TAIL_LINES: usize = 20;

/// Spawns GeoCLIP workers
#[derive(Debug, Clone)]
pub struct GeoClipLoader {
    python: String,
    script: PathBuf,
    device: String,
}

impl GeoClipLoader {
    pub fn new(config: &ModelConfig, device: &str) -> Self {
        Self {
            python: config.python.clone(),
            script: config.worker_script.clone(),
            device: device.to_string(),
        }
    }
}

impl ModelLoader for GeoClipLoader {
    fn load(&self) -> Result<Arc<dyn GeoModel>, ModelFault> {
        let worker = GeoClipWorker::spawn(&self.python, &self.script, &self.device)?;
        Ok(Arc::new(worker))
    }
}

#[derive(Debug, Deserialize)]
struct ReadyLine {
    ready: bool,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    id: String,
    path: &'a Path,
    top_k: usize,
    no_grad: bool,
}

#[derive(Debug, Deserialize)]
struct ReplyHeader {
    #[serde(default)]
    id: Option<String>,
    ok: bool,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

struct WorkerIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A running GeoCLIP worker process holding the loaded model
pub struct GeoClipWorker {
    io: Mutex<WorkerIo>,
    pid: u32,
    device: String,
    stderr_tail: StderrTail,
}

impl GeoClipWorker {
    /// Start the worker and block until it reports the model loaded (or fails)
    pub fn spawn(python: &str, script: &Path, device: &str) -> Result<Self, ModelFault> {
        info!("Starting GeoCLIP worker: {} {:?} --device {}", python, script, device);
        let mut child = Command::new(python)
            .arg("-u")
            .arg(script)
            .arg("--device")
            .arg(device)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                reap(&mut child);
                return Err(ModelFault::Protocol("worker pipes unavailable".into()));
            }
        };

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        std::thread::Builder::new()
            .name(format!("geoclip-stderr-{}", pid))
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!(target: "geoclip_worker", "{}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })?;

        let mut io = WorkerIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let line = match read_line(&mut io.stdout) {
            Ok(Some(line)) => line,
            Ok(None) => return Err(exited(&mut io.child, &stderr_tail)),
            Err(e) => {
                reap(&mut io.child);
                return Err(e);
            }
        };
        let ready: ReadyLine = match serde_json::from_str(&line) {
            Ok(ready) => ready,
            Err(e) => {
                reap(&mut io.child);
                return Err(ModelFault::Protocol(format!("bad ready line {:?}: {}", line, e)));
            }
        };

        if !ready.ready {
            reap(&mut io.child);
            return Err(ModelFault::Raised {
                error_type: ready.error_type.unwrap_or_else(|| "Error".into()),
                message: ready.message.unwrap_or_default(),
            });
        }

        let device = ready.device.unwrap_or_else(|| device.to_string());
        info!("GeoCLIP worker {} ready on {}", pid, device);

        Ok(Self {
            io: Mutex::new(io),
            pid,
            device,
            stderr_tail,
        })
    }
}

impl GeoModel for GeoClipWorker {
    fn predict(
        &self,
        image_path: &Path,
        top_k: usize,
        scope: &NoGrad,
    ) -> Result<RawPrediction, ModelFault> {
        let request = PredictRequest {
            id: Uuid::new_v4().to_string(),
            path: image_path,
            top_k,
            no_grad: !scope.grad_enabled(),
        };
        let mut payload = serde_json::to_string(&request)
            .map_err(|e| ModelFault::Protocol(e.to_string()))?;
        payload.push('\n');

        let mut io = self.io.lock();

        if let Err(e) = io.stdin.write_all(payload.as_bytes()).and_then(|_| io.stdin.flush()) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Err(exited(&mut io.child, &self.stderr_tail));
            }
            return Err(e.into());
        }

        let line = match read_line(&mut io.stdout)? {
            Some(line) => line,
            None => return Err(exited(&mut io.child, &self.stderr_tail)),
        };
        drop(io);

        let value: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| ModelFault::Protocol(format!("unparseable reply: {}", e)))?;
        let header: ReplyHeader = serde_json::from_value(value.clone())
            .map_err(|e| ModelFault::Protocol(format!("reply without status: {}", e)))?;

        if header.id.as_deref() != Some(request.id.as_str()) {
            return Err(ModelFault::Protocol(format!(
                "reply id {:?} does not match request {}",
                header.id, request.id
            )));
        }

        if !header.ok {
            return Err(ModelFault::Raised {
                error_type: header.error_type.unwrap_or_else(|| "Error".into()),
                message: header.message.unwrap_or_default(),
            });
        }

        serde_json::from_value(value).map_err(|e| ModelFault::InterfaceShape(e.to_string()))
    }

    /// A call in progress holds the pipes, so a busy worker counts as alive
    fn is_alive(&self) -> bool {
        match self.io.try_lock() {
            Some(mut io) => matches!(io.child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn describe(&self) -> String {
        format!("geoclip (pid {}, {})", self.pid, self.device)
    }
}

impl Drop for GeoClipWorker {
    fn drop(&mut self) {
        let io = self.io.get_mut();
        if let Err(e) = io.child.kill() {
            debug!("GeoCLIP worker {} already gone: {}", self.pid, e);
        }
        let _ = io.child.wait();
    }
}

/// Kill a worker that failed during startup and collect its exit status
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>, ModelFault> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(line.trim_end().to_string()))
    }
}

/// Describe a worker that closed its stdout
fn exited(child: &mut Child, stderr_tail: &StderrTail) -> ModelFault {
    let status = child.wait();
    let tail = stderr_tail
        .lock()
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    match status {
        Ok(status) => {
            warn!("GeoCLIP worker exited: {}", status);
            ModelFault::WorkerExited {
                status: status.to_string(),
                signal: exit_signal(&status),
                stderr_tail: tail,
            }
        }
        Err(e) => ModelFault::Io(e),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
