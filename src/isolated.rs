//! Isolated worker pool for `offload_isolated` tasks.
//!
//! An isolated body is a *registered function*: the scheduler ships a
//! serialized call record `{function, args}` to a child process running the
//! host binary, and the result (or a string error cause) comes back as one
//! JSON line. Hosts opt in by calling [`worker_main`] first thing in `main`;
//! it is a no-op unless the process was spawned with the worker marker.
//!
//! The pool is created lazily, bounded by `PROCESS_POOL_MAX_WORKERS`
//! (default: available parallelism), reuses idle workers, and kills children
//! when they are dropped. Workers also exit on stdin EOF when the parent
//! goes away.

use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config;

/// Environment marker set for worker children.
pub const WORKER_ENV: &str = "WEFT_ISOLATED_WORKER";

/// A function callable from an isolated worker. Must be registered under the
/// same name in both parent and worker processes (the worker runs the same
/// binary, so one registration site covers both).
pub type IsolatedFn = fn(Vec<Value>) -> Result<Value, String>;

static REGISTRY: Lazy<DashMap<String, IsolatedFn>> = Lazy::new(DashMap::new);

/// Register a function for isolated execution.
pub fn register(name: &str, function: IsolatedFn) {
    REGISTRY.insert(name.to_string(), function);
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    function: String,
    args: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<String>,
}

/// Run the worker loop if this process was spawned as an isolated worker.
///
/// Hosts call this at the top of `main`, after registering isolated
/// functions; it never returns in a worker process.
pub fn worker_main() {
    if std::env::var(WORKER_ENV).as_deref() != Ok("1") {
        return;
    }
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(stdin.lock(), stdout.lock());
    std::process::exit(0);
}

/// One request per line in, one response per line out. Returns on EOF.
fn serve(reader: impl BufRead, mut writer: impl Write) {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle(request),
            Err(err) => Response {
                ok: None,
                err: Some(format!("malformed call record: {}", err)),
            },
        };
        let encoded = serde_json::to_string(&response).unwrap_or_else(|_| {
            "{\"err\":\"response encoding failed\"}".to_string()
        });
        if writeln!(writer, "{}", encoded).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
}

fn handle(request: Request) -> Response {
    let Some(function) = REGISTRY.get(&request.function).map(|f| *f) else {
        return Response {
            ok: None,
            err: Some(format!("unknown isolated function '{}'", request.function)),
        };
    };
    match catch_unwind(AssertUnwindSafe(|| function(request.args))) {
        Ok(Ok(value)) => Response {
            ok: Some(value),
            err: None,
        },
        Ok(Err(cause)) => Response {
            ok: None,
            err: Some(cause),
        },
        Err(_) => Response {
            ok: None,
            err: Some(format!("isolated function '{}' panicked", request.function)),
        },
    }
}

// ============================================================================
// WORKER POOL
// ============================================================================

struct Worker {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct Pool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Worker>>,
}

static POOL: Lazy<Pool> = Lazy::new(|| {
    let workers = config::config()
        .process_pool_max_workers
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
    Pool {
        permits: Arc::new(Semaphore::new(workers.max(1))),
        idle: Mutex::new(Vec::new()),
    }
});

async fn spawn_worker() -> Result<Worker, String> {
    let exe = std::env::current_exe()
        .map_err(|e| format!("cannot locate host binary for isolated worker: {}", e))?;
    let mut child = Command::new(exe)
        .env(WORKER_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn isolated worker: {}", e))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "isolated worker has no stdin".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "isolated worker has no stdout".to_string())?;
    Ok(Worker {
        _child: child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

/// Execute a registered function in an isolated worker.
///
/// A worker is returned to the idle set only after a clean round trip; a
/// cancelled or failed exchange drops (and thereby kills) it.
pub(crate) async fn call(function: &str, args: Vec<Value>) -> Result<Value, String> {
    let pool = &*POOL;
    let _permit = pool
        .permits
        .acquire()
        .await
        .map_err(|_| "isolated pool closed".to_string())?;

    let idle_worker = pool.idle.lock().pop();
    let mut worker = match idle_worker {
        Some(worker) => worker,
        None => spawn_worker().await?,
    };

    let record = serde_json::to_string(&Request {
        function: function.to_string(),
        args,
    })
    .map_err(|e| format!("call record encoding failed: {}", e))?;

    let exchange = async {
        worker
            .stdin
            .write_all(record.as_bytes())
            .await
            .map_err(|e| format!("isolated worker write failed: {}", e))?;
        worker
            .stdin
            .write_all(b"\n")
            .await
            .map_err(|e| format!("isolated worker write failed: {}", e))?;
        worker
            .stdin
            .flush()
            .await
            .map_err(|e| format!("isolated worker flush failed: {}", e))?;
        let mut line = String::new();
        let read = worker
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| format!("isolated worker read failed: {}", e))?;
        if read == 0 {
            return Err("isolated worker exited".to_string());
        }
        serde_json::from_str::<Response>(&line)
            .map_err(|e| format!("isolated worker sent garbage: {}", e))
    }
    .await;

    match exchange {
        Ok(response) => {
            pool.idle.lock().push(worker);
            match (response.ok, response.err) {
                (Some(value), _) => Ok(value),
                (None, Some(cause)) => Err(cause),
                (None, None) => Err("isolated worker sent empty response".to_string()),
            }
        }
        Err(cause) => {
            debug!(%cause, "discarding isolated worker");
            Err(cause)
        }
    }
}

/// Kill idle workers. Busy workers die when their exchange is dropped.
pub fn shutdown() {
    POOL.idle.lock().clear();
}
